// Small shared plumbing: free-port picking and write-once result cells.

use std::net::TcpListener;

use thiserror::Error;
use tokio::sync::watch;

/// Ask the OS for a currently-free TCP port.
///
/// The listener is dropped before returning, so the port is only *probably*
/// free by the time a caller binds it. Services that need the port bind it
/// immediately after picking.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

/// The producing service failed before filling the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value never became available: producing service failed")]
pub struct CellPoisoned;

#[derive(Clone)]
enum CellState<T> {
    Empty,
    Set(T),
    Poisoned,
}

/// A write-once result cell awaited by many readers.
///
/// Several startup results (the talk port, the display name, overlay
/// service ids) are produced exactly once by one service and awaited by
/// several others. `Cell` is that one-shot broadcast: `set` publishes the
/// value, `get` waits for it, and `poison` wakes every waiter with an
/// error when the producer dies.
pub struct Cell<T> {
    tx: watch::Sender<CellState<T>>,
}

impl<T: Clone> Cell<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CellState::Empty);
        Self { tx }
    }

    /// Publish the value, waking all waiters. Later calls replace it.
    pub fn set(&self, value: T) {
        self.tx.send_replace(CellState::Set(value));
    }

    /// Mark the cell as dead: all current and future `get`s fail fast.
    pub fn poison(&self) {
        self.tx.send_replace(CellState::Poisoned);
    }

    /// Wait until the value is published.
    pub async fn get(&self) -> Result<T, CellPoisoned> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, CellState::Empty))
            .await
            // The sender lives inside self, so the channel cannot close
            // while we hold &self.
            .map_err(|_| CellPoisoned)?;
        match &*state {
            CellState::Set(value) => Ok(value.clone()),
            _ => Err(CellPoisoned),
        }
    }

    /// Non-blocking read of the current value, if published.
    pub fn try_get(&self) -> Option<T> {
        match &*self.tx.borrow() {
            CellState::Set(value) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T: Clone> Default for Cell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The write-once startup results shared between services.
///
/// Services publish into these cells and await each other through them
/// instead of holding references to one another (the identity fills the
/// first four; the pairing receiver fills the last two; discovery reads
/// all of them).
pub(crate) struct Cells {
    /// Local port the talk server listens on (mapped from overlay virt 443).
    pub talk_port: Cell<u16>,
    /// Our display name.
    pub name: Cell<String>,
    /// Main overlay service id (no `.onion` suffix).
    pub service_id: Cell<String>,
    /// Our X25519 sealing public key.
    pub public_key: Cell<[u8; 32]>,
    /// Local port of the pairing receiver (mapped from overlay virt 80).
    pub cert_port: Cell<u16>,
    /// Overlay service id fronting the pairing receiver.
    pub cert_service_id: Cell<String>,
}

impl Cells {
    pub fn new() -> Self {
        Self {
            talk_port: Cell::new(),
            name: Cell::new(),
            service_id: Cell::new(),
            public_key: Cell::new(),
            cert_port: Cell::new(),
            cert_service_id: Cell::new(),
        }
    }
}

/// Strip a user-supplied name down to filesystem- and DNS-safe characters.
pub(crate) fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "peer".to_string()
    } else {
        cleaned
    }
}

/// serde adapter for 32-byte keys stored as base64 strings.
pub(crate) mod base64_key {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_find_free_port_returns_nonzero() {
        let port = find_free_port().unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_cell_set_before_get() {
        let cell = Cell::new();
        cell.set(7u16);
        assert_eq!(cell.get().await.unwrap(), 7);
        assert_eq!(cell.try_get(), Some(7));
    }

    #[tokio::test]
    async fn test_cell_wakes_multiple_waiters() {
        let cell = Arc::new(Cell::<String>::new());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let cell = cell.clone();
            waiters.push(tokio::spawn(async move { cell.get().await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.set("ready".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "ready");
        }
    }

    #[tokio::test]
    async fn test_cell_poison_fails_waiters() {
        let cell = Arc::new(Cell::<u16>::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.get().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.poison();

        assert_eq!(waiter.await.unwrap(), Err(CellPoisoned));
        assert_eq!(cell.try_get(), None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("alice"), "alice");
        assert_eq!(sanitize_name("a/b c"), "a_b_c");
        assert_eq!(sanitize_name(""), "peer");
    }
}
