// The talk server: everything friends say to us arrives here, over TLS
// that both sides authenticate with pinned certificates.
//
// Routes:
//   HEAD /          liveness probe (connection maintenance uses it)
//   POST /          a message; sender identity = SAN of the client cert
//   GET  /f/{uuid}  an offered file, Range honored, allow-listed per friend
//
// Trust anchors are fixed at acceptor construction. "Restart" swaps in an
// acceptor built from the current friend snapshot; during the swap the
// slot is empty and fresh connections are dropped instead of racing
// against stale anchors. Connections already inside their handshake keep
// the snapshot that authenticated them.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::certificate::{san_host_der, CertError, CertificateStore};
use crate::friends::{Friend, FriendList};
use crate::tls::{self, TlsError};
use crate::util::Cells;
use crate::wire::http;
use crate::wire::{FileOffer, FILE_OFFER_CONTENT_TYPE};
use crate::AppDelegate;

/// Cap on a single POSTed message body.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TalkError {
    #[error("talk server prerequisites unavailable")]
    NotReady,
    #[error("offered path is not a regular file")]
    NotAFile,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Http(#[from] http::HttpError),
}

/// A message a friend delivered to our talk server.
#[derive(Clone)]
pub struct Message {
    pub sender: Friend,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Message {
    /// The body as UTF-8 text, if it is any.
    pub fn text(&self) -> Option<String> {
        String::from_utf8(self.data.clone()).ok()
    }

    /// The body parsed as JSON, if it is any.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.data).ok()
    }

    /// The body as a file offer, when the content type marks it as one.
    pub fn file_offer(&self) -> Option<FileOffer> {
        if self.content_type == FILE_OFFER_CONTENT_TYPE {
            FileOffer::decode(&self.data).ok()
        } else {
            None
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let onion_prefix: String = self.sender.onion.chars().take(6).collect();
        match self.text() {
            Some(text) => write!(f, "{} {} -> {}", self.sender.name, onion_prefix, text),
            None => write!(
                f,
                "{} {} -> <{} bytes of {}>",
                self.sender.name,
                onion_prefix,
                self.data.len(),
                self.content_type
            ),
        }
    }
}

struct OfferedFile {
    path: PathBuf,
    allowed: HashSet<crate::crypto::Digest>,
}

#[derive(Default)]
struct Offers {
    by_uuid: HashMap<String, OfferedFile>,
    by_path: HashMap<PathBuf, String>,
}

struct Inner {
    friends: Arc<FriendList>,
    delegate: Arc<dyn AppDelegate>,
    offers: Mutex<Offers>,
    acceptor: RwLock<Option<TlsAcceptor>>,
}

pub struct TalkServer {
    cells: Arc<Cells>,
    certificate: Arc<CertificateStore>,
    inner: Arc<Inner>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TalkServer {
    pub(crate) fn new(
        cells: Arc<Cells>,
        certificate: Arc<CertificateStore>,
        friends: Arc<FriendList>,
        delegate: Arc<dyn AppDelegate>,
    ) -> Self {
        Self {
            cells,
            certificate,
            inner: Arc::new(Inner {
                friends,
                delegate,
                offers: Mutex::new(Offers::default()),
                acceptor: RwLock::new(None),
            }),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), TalkError> {
        let port = self
            .cells
            .talk_port
            .get()
            .await
            .map_err(|_| TalkError::NotReady)?;

        let acceptor = self.build_acceptor().await?;
        *self.inner.acceptor.write() = Some(acceptor);

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::debug!("talk server listening on port {port}");

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(inner, stream).await {
                                    tracing::debug!("talk connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("talk accept failed: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.inner.acceptor.write() = None;
    }

    /// Rebuild the acceptor from the current friend set and swap it in.
    ///
    /// The friend's file is already on disk when this runs; a connection
    /// arriving mid-swap fails fast instead of seeing stale anchors.
    pub(crate) async fn restart(&self) -> Result<(), TalkError> {
        *self.inner.acceptor.write() = None;
        let acceptor = self.build_acceptor().await?;
        *self.inner.acceptor.write() = Some(acceptor);
        tracing::debug!("talk server re-armed with updated trust anchors");
        Ok(())
    }

    async fn build_acceptor(&self) -> Result<TlsAcceptor, TalkError> {
        let (cert_pem, key_pem) = self.certificate.identity_pair().await?;
        let friend_pems: Vec<String> = self
            .inner
            .friends
            .friends()
            .iter()
            .map(|f| f.cert_pem.clone())
            .collect();
        let config = tls::server_config(&cert_pem, &key_pem, &friend_pems)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Register a local file for a friend and return its fetch path.
    ///
    /// The same absolute path keeps the same URL across repeat offers;
    /// offering to another friend only widens the allow set.
    pub fn offer_file(
        &self,
        friend: &Friend,
        path: &std::path::Path,
    ) -> Result<String, TalkError> {
        let abs_path = std::fs::canonicalize(path)?;
        if !abs_path.is_file() {
            return Err(TalkError::NotAFile);
        }

        let mut offers = self.inner.offers.lock();
        let uuid = match offers.by_path.get(&abs_path) {
            Some(uuid) => uuid.clone(),
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                offers.by_path.insert(abs_path.clone(), uuid.clone());
                offers.by_uuid.insert(
                    uuid.clone(),
                    OfferedFile {
                        path: abs_path,
                        allowed: HashSet::new(),
                    },
                );
                uuid
            }
        };
        if let Some(offered) = offers.by_uuid.get_mut(&uuid) {
            offered.allowed.insert(friend.digest());
        }
        Ok(format!("/f/{uuid}"))
    }
}

async fn serve_connection(inner: Arc<Inner>, stream: TcpStream) -> Result<(), TalkError> {
    // Empty slot = restart in progress; fail fast.
    let acceptor = match inner.acceptor.read().clone() {
        Some(acceptor) => acceptor,
        None => return Ok(()),
    };

    let mut tls = acceptor.accept(stream).await?;

    let onion = {
        let certs = tls
            .get_ref()
            .1
            .peer_certificates()
            .ok_or(TalkError::NotReady)?;
        let first = certs.first().ok_or(TalkError::NotReady)?;
        san_host_der(first.as_ref())?
    };

    loop {
        let request = match http::read_request(&mut tls, MAX_MESSAGE_BYTES).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("bad talk request from {onion}: {e}");
                break;
            }
        };
        route(&inner, &onion, request, &mut tls).await?;
    }
    Ok(())
}

async fn route<S>(
    inner: &Inner,
    onion: &str,
    request: http::Request,
    stream: &mut S,
) -> Result<(), TalkError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    match (request.method.as_str(), request.target.as_str()) {
        ("HEAD", "/") => {
            http::write_response(stream, 200, &[], b"").await?;
        }
        ("POST", "/") => {
            let sender = match inner.friends.friend_for_onion(onion) {
                Ok(friend) => friend,
                Err(e) => {
                    // A verified client cert without a friend record means
                    // the trust anchors and the store disagree.
                    tracing::error!("trust anchor desync: {e}");
                    http::write_response(stream, 500, &[], b"").await?;
                    return Ok(());
                }
            };
            let message = Message {
                sender,
                content_type: request.content_type().to_string(),
                data: request.body,
            };
            tracing::debug!("message: {message}");
            inner.delegate.on_message(message).await;
            http::write_response(stream, 201, &[], b"").await?;
        }
        ("GET", target) if target.starts_with("/f/") => {
            serve_file(inner, onion, &request, stream).await?;
        }
        _ => {
            http::write_response(stream, 404, &[], b"").await?;
        }
    }
    Ok(())
}

async fn serve_file<S>(
    inner: &Inner,
    onion: &str,
    request: &http::Request,
    stream: &mut S,
) -> Result<(), TalkError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let file_id = &request.target["/f/".len()..];
    let entry = {
        let offers = inner.offers.lock();
        offers
            .by_uuid
            .get(file_id)
            .map(|offered| (offered.path.clone(), offered.allowed.clone()))
    };

    // Unknown id, unknown sender, and missing permission all look the
    // same from outside.
    let Some((path, allowed)) = entry else {
        http::write_response(stream, 404, &[], b"").await?;
        return Ok(());
    };
    let sender = match inner.friends.friend_for_onion(onion) {
        Ok(friend) => friend,
        Err(_) => {
            http::write_response(stream, 404, &[], b"").await?;
            return Ok(());
        }
    };
    if !allowed.contains(&sender.digest()) {
        http::write_response(stream, 404, &[], b"").await?;
        return Ok(());
    }

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("offered file {} unreadable: {e}", path.display());
            http::write_response(stream, 404, &[], b"").await?;
            return Ok(());
        }
    };
    let size = file.metadata().await?.len();

    let range = request
        .header("range")
        .and_then(|value| http::parse_range(value, size));
    match range {
        Some((start, end)) => {
            file.seek(SeekFrom::Start(start)).await?;
            let content_range = format!("bytes {}-{}/{}", start, end - 1, size);
            http::write_response_head(
                stream,
                206,
                &[("accept-ranges", "bytes"), ("content-range", &content_range)],
                end - start,
            )
            .await?;
            let mut window = file.take(end - start);
            tokio::io::copy(&mut window, stream).await?;
        }
        None => {
            http::write_response_head(stream, 200, &[("accept-ranges", "bytes")], size).await?;
            tokio::io::copy(&mut file, stream).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NullDelegate;

    #[async_trait]
    impl AppDelegate for NullDelegate {
        async fn on_message(&self, _message: Message) {}
        async fn on_friend_request(&self, _request: crate::server::FriendRequest) -> bool {
            false
        }
    }

    fn bare_server(base: &std::path::Path) -> TalkServer {
        let cells = Arc::new(Cells::new());
        let certificate = Arc::new(CertificateStore::new(base.to_path_buf(), cells.clone()));
        let friends = Arc::new(FriendList::new(base.to_path_buf()));
        TalkServer::new(cells, certificate, friends, Arc::new(NullDelegate))
    }

    fn friend(name: &str) -> Friend {
        Friend::new(
            format!("{name}.onion"),
            name.to_string(),
            format!("cert of {name}"),
            [3u8; 32],
        )
    }

    #[test]
    fn test_offer_file_is_stable_per_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("movie.mkv");
        std::fs::write(&file_path, b"data").unwrap();

        let server = bare_server(dir.path());
        let alice = friend("alice");
        let bob = friend("bob");

        let first = server.offer_file(&alice, &file_path).unwrap();
        let again = server.offer_file(&alice, &file_path).unwrap();
        let for_bob = server.offer_file(&bob, &file_path).unwrap();

        assert_eq!(first, again);
        assert_eq!(first, for_bob);
        assert!(first.starts_with("/f/"));
    }

    #[test]
    fn test_offer_rejects_directories_and_missing_paths() {
        let dir = tempdir().unwrap();
        let server = bare_server(dir.path());
        let alice = friend("alice");

        assert!(matches!(
            server.offer_file(&alice, dir.path()),
            Err(TalkError::NotAFile)
        ));
        assert!(server
            .offer_file(&alice, &dir.path().join("missing"))
            .is_err());
    }

    #[test]
    fn test_message_accessors() {
        let message = Message {
            sender: friend("alice"),
            content_type: "text/plain".to_string(),
            data: b"hi there".to_vec(),
        };
        assert_eq!(message.text().unwrap(), "hi there");
        assert!(message.file_offer().is_none());

        let offer = FileOffer {
            url: "/f/abc".to_string(),
            size: 10,
            content_type: "text/plain".to_string(),
            name: "notes.txt".to_string(),
        };
        let message = Message {
            sender: friend("alice"),
            content_type: FILE_OFFER_CONTENT_TYPE.to_string(),
            data: offer.encode(),
        };
        assert!(message.text().is_some()); // bencode happens to be utf-8
        assert_eq!(message.file_offer().unwrap(), offer);
    }
}
