// Parallel ranged download of an offered file.
//
// The file is cut into fixed 1 MiB chunks; a small worker pool pulls
// chunk indices from a shared counter, fetches each over its own
// dedicated TLS stream, and writes it at the chunk's offset. Workers die
// on their first failed chunk; the transfer reports how much of the file
// actually arrived.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::Connection;

/// Bytes per chunk.
pub const CHUNK_SIZE: u64 = 1_048_576;

/// Worker pool size; surplus workers exit immediately on small files.
pub const WORKERS: usize = 10;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no session for that friend")]
    UnknownFriend,
    #[error("no live connection to that friend")]
    NotConnected,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("{failed} of {total} chunks never arrived")]
    ChunksFailed { failed: u64, total: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared byte counter the workers bump as chunks land.
#[derive(Clone, Default)]
pub struct Progress {
    bytes: Arc<AtomicU64>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }
}

pub(crate) async fn download(
    connection: Arc<Connection>,
    url: &str,
    size: u64,
    target: &Path,
    cancel: CancellationToken,
    progress: Progress,
) -> Result<(), TransferError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(target)
        .await?;
    file.set_len(size).await?;

    let chunks = size.div_ceil(CHUNK_SIZE);
    let next = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicU64::new(0));

    let worker_count = (chunks.min(WORKERS as u64)) as usize;
    let mut workers = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let connection = connection.clone();
        let next = next.clone();
        let done = done.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        let url = url.to_string();
        let target = target.to_path_buf();

        workers.push(tokio::spawn(async move {
            let mut channel = match connection.open_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!("transfer worker {worker_id} could not connect: {e}");
                    return;
                }
            };
            let mut out = match tokio::fs::OpenOptions::new().write(true).open(&target).await {
                Ok(out) => out,
                Err(e) => {
                    tracing::warn!("transfer worker {worker_id} could not open target: {e}");
                    return;
                }
            };

            loop {
                // Cancellation is observed between chunks
                if cancel.is_cancelled() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= chunks {
                    break;
                }
                let start = index * CHUNK_SIZE;
                let end = size.min(start + CHUNK_SIZE);
                tracing::debug!("worker {worker_id} fetching bytes {start}..{end}");

                let bytes = match channel.get_range(&url, start, end).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("worker {worker_id}: chunk {index} failed: {e}");
                        break;
                    }
                };
                let write = async {
                    out.seek(SeekFrom::Start(start)).await?;
                    out.write_all(&bytes).await
                };
                if let Err(e) = write.await {
                    tracing::warn!("worker {worker_id}: writing chunk {index} failed: {e}");
                    break;
                }
                progress.add(end - start);
                done.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    futures::future::join_all(workers).await;

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    file.sync_all().await?;

    let completed = done.load(Ordering::SeqCst);
    if completed != chunks {
        return Err(TransferError::ChunksFailed {
            failed: chunks - completed,
            total: chunks,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_math() {
        assert_eq!(0u64.div_ceil(CHUNK_SIZE), 0);
        assert_eq!(1u64.div_ceil(CHUNK_SIZE), 1);
        assert_eq!(CHUNK_SIZE.div_ceil(CHUNK_SIZE), 1);
        assert_eq!((CHUNK_SIZE + 1).div_ceil(CHUNK_SIZE), 2);
        assert_eq!(3_500_000u64.div_ceil(CHUNK_SIZE), 4);
    }

    #[test]
    fn test_progress_accumulates() {
        let progress = Progress::new();
        assert_eq!(progress.bytes_done(), 0);
        progress.add(100);
        progress.add(50);
        assert_eq!(progress.bytes_done(), 150);

        // Clones share the counter
        let clone = progress.clone();
        clone.add(1);
        assert_eq!(progress.bytes_done(), 151);
    }
}
