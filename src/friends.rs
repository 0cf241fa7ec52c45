// Accepted peers and their persistence.
//
// One JSON file per friend under `friends/`, named `<name>-<digest_hex>`.
// The in-memory list mirrors the directory; a friend is pushed only after
// its file hit the disk, so the talk server never trusts a certificate
// that could vanish on restart.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Digest;
use crate::util::sanitize_name;

#[derive(Debug, Error)]
pub enum FriendError {
    #[error("no friend known for {0}")]
    UnknownPeer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct FriendRecord {
    onion: String,
    name: String,
    cert: String,
    #[serde(with = "crate::util::base64_key")]
    public_key: [u8; 32],
}

/// A peer whose certificate we trust.
#[derive(Clone)]
pub struct Friend {
    /// Overlay host (`<id>.onion`) the friend's certificate names.
    pub onion: String,
    pub name: String,
    /// Their certificate, PEM.
    pub cert_pem: String,
    /// Their X25519 sealing public key.
    pub public_key: [u8; 32],
    digest: Digest,
}

impl Friend {
    pub fn new(onion: String, name: String, cert_pem: String, public_key: [u8; 32]) -> Self {
        let digest = Digest::of(cert_pem.as_bytes());
        Self {
            onion,
            name,
            cert_pem,
            public_key,
            digest,
        }
    }

    /// SHA-256 over the certificate PEM; the canonical identity.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    fn from_record(record: FriendRecord) -> Self {
        Self::new(record.onion, record.name, record.cert, record.public_key)
    }

    fn to_record(&self) -> FriendRecord {
        FriendRecord {
            onion: self.onion.clone(),
            name: self.name.clone(),
            cert: self.cert_pem.clone(),
            public_key: self.public_key,
        }
    }
}

impl std::fmt::Display for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -- {}", self.name, self.digest.to_hex())
    }
}

impl std::fmt::Debug for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Friend({} {})", self.name, self.digest.short_hex())
    }
}

/// The authoritative friend store.
pub struct FriendList {
    dir: PathBuf,
    friends: RwLock<Vec<Friend>>,
}

impl FriendList {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self {
            dir: base.join("friends"),
            friends: RwLock::new(Vec::new()),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), FriendError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        // Directory order is filesystem-dependent; sort for a stable
        // display order.
        entries.sort();

        let mut loaded = Vec::new();
        for path in entries {
            let text = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<FriendRecord>(&text) {
                Ok(record) => loaded.push(Friend::from_record(record)),
                Err(e) => {
                    tracing::warn!("skipping unreadable friend file {}: {e}", path.display())
                }
            }
        }
        tracing::debug!("loaded {} friend(s)", loaded.len());
        *self.friends.write() = loaded;
        Ok(())
    }

    /// Persist a friend and add it to the live list. The file write
    /// completes before this returns; callers re-arm the talk server
    /// afterwards.
    pub(crate) fn add(&self, friend: &Friend) -> Result<(), FriendError> {
        let filename = format!(
            "{}-{}",
            sanitize_name(&friend.name),
            friend.digest().to_hex()
        );
        let text = serde_json::to_string(&friend.to_record())?;
        std::fs::write(self.dir.join(filename), text)?;

        let mut friends = self.friends.write();
        if !friends.iter().any(|f| f.digest() == friend.digest()) {
            friends.push(friend.clone());
        }
        tracing::debug!("added friend {friend}");
        Ok(())
    }

    pub fn has_digest(&self, digest: &Digest) -> bool {
        self.friends.read().iter().any(|f| f.digest() == *digest)
    }

    pub fn friend_for_digest(&self, digest: &Digest) -> Option<Friend> {
        self.friends
            .read()
            .iter()
            .find(|f| f.digest() == *digest)
            .cloned()
    }

    /// Look a friend up by the overlay host its certificate names.
    pub fn friend_for_onion(&self, onion: &str) -> Result<Friend, FriendError> {
        self.friends
            .read()
            .iter()
            .find(|f| f.onion == onion)
            .cloned()
            .ok_or_else(|| FriendError::UnknownPeer(onion.to_string()))
    }

    /// All friends, in persistence order.
    pub fn friends(&self) -> Vec<Friend> {
        self.friends.read().clone()
    }
}
