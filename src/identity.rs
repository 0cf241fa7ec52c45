// Who we are: display name, sealing key, and the overlay service that
// makes us reachable.
//
// Provisioned once on first run into the `ident` file and immutable
// afterwards, except that the overlay service is re-registered with the
// router on every start (with a freshly-picked local talk port).

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::certificate::{CertError, CertificateStore};
use crate::crypto;
use crate::overlay::{OverlayError, OverlayRouter};
use crate::util::{find_free_port, Cell, Cells};
use crate::wire;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no name set; a first run needs one")]
    NoName,
    #[error("identity is not ready")]
    NotReady,
    #[error("corrupt ident record: {0}")]
    Corrupt(&'static str),
    #[error("unseal failed")]
    Unseal,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Cert(#[from] CertError),
}

#[derive(Serialize, Deserialize)]
struct OnionRecord {
    pk: String,
    service_id: String,
}

#[derive(Serialize, Deserialize)]
struct IdentRecord {
    name: String,
    /// base64 of the 32-byte X25519 scalar
    key: String,
    onion: OnionRecord,
}

pub struct Identity {
    base: PathBuf,
    setup_name: Option<String>,
    router: Arc<dyn OverlayRouter>,
    cells: Arc<Cells>,
    secret: Cell<StaticSecret>,
}

impl Identity {
    pub(crate) fn new(
        base: PathBuf,
        setup_name: Option<String>,
        router: Arc<dyn OverlayRouter>,
        cells: Arc<Cells>,
    ) -> Self {
        Self {
            base,
            setup_name,
            router,
            cells,
            secret: Cell::new(),
        }
    }

    /// True until the `ident` record exists on disk.
    pub fn requires_setup(&self) -> bool {
        !self.base.join("ident").is_file()
    }

    pub(crate) async fn start(&self) -> Result<(), IdentityError> {
        let result = self.start_inner().await;
        if result.is_err() {
            self.secret.poison();
            self.cells.public_key.poison();
            self.cells.service_id.poison();
            self.cells.name.poison();
            self.cells.talk_port.poison();
        }
        result
    }

    async fn start_inner(&self) -> Result<(), IdentityError> {
        let port = find_free_port()?;
        let ident_path = self.base.join("ident");

        if ident_path.is_file() {
            let text = tokio::fs::read_to_string(&ident_path).await?;
            let record: IdentRecord = serde_json::from_str(&text)?;
            let mut key_bytes: [u8; 32] = STANDARD
                .decode(record.key.as_bytes())
                .map_err(|_| IdentityError::Corrupt("key is not base64"))?
                .try_into()
                .map_err(|_| IdentityError::Corrupt("key is not 32 bytes"))?;
            self.install_secret(key_bytes);
            key_bytes.zeroize();

            self.cells.service_id.set(record.onion.service_id.clone());
            self.router
                .install_service(record.onion.pk.clone(), vec![(443, port)])
                .await?;
            self.cells.name.set(record.name.clone());
            tracing::info!("loaded identity \"{}\"", record.name);
        } else {
            let name = self.setup_name.clone().ok_or(IdentityError::NoName)?;
            let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let key_b64 = STANDARD.encode(secret.to_bytes());
            self.install_secret(secret.to_bytes());

            let created = self.router.create_service(vec![(443, port)]).await?;
            self.cells.service_id.set(created.service_id.clone());

            let record = IdentRecord {
                name: name.clone(),
                key: key_b64,
                onion: OnionRecord {
                    pk: created.private_key,
                    service_id: created.service_id,
                },
            };
            tokio::fs::write(&ident_path, serde_json::to_string(&record)?).await?;
            self.cells.name.set(name.clone());
            tracing::info!("provisioned new identity \"{name}\"");
        }

        self.cells.talk_port.set(port);
        Ok(())
    }

    fn install_secret(&self, key_bytes: [u8; 32]) {
        let secret = StaticSecret::from(key_bytes);
        self.cells
            .public_key
            .set(X25519PublicKey::from(&secret).to_bytes());
        self.secret.set(secret);
    }

    /// Local port the talk server binds (mapped from overlay virt 443).
    pub async fn port(&self) -> Result<u16, IdentityError> {
        self.cells.talk_port.get().await.map_err(|_| IdentityError::NotReady)
    }

    pub async fn name(&self) -> Result<String, IdentityError> {
        self.cells.name.get().await.map_err(|_| IdentityError::NotReady)
    }

    /// Our X25519 sealing public key.
    pub async fn public_key(&self) -> Result<[u8; 32], IdentityError> {
        self.cells.public_key.get().await.map_err(|_| IdentityError::NotReady)
    }

    pub async fn service_id(&self) -> Result<String, IdentityError> {
        self.cells.service_id.get().await.map_err(|_| IdentityError::NotReady)
    }

    /// `<service_id>.onion`
    pub async fn service_host(&self) -> Result<String, IdentityError> {
        Ok(format!("{}.onion", self.service_id().await?))
    }

    /// The bencoded greeting sent during pairing: certificate, name, and
    /// sealing key.
    pub async fn greeting_payload(
        &self,
        certificate: &CertificateStore,
    ) -> Result<Vec<u8>, IdentityError> {
        let cert = certificate.public_cert_bytes().await?;
        let name = self.name().await?;
        let public_key = self.public_key().await?;
        Ok(wire::Request {
            cert,
            name,
            public_key,
        }
        .encode())
    }

    /// Open a payload sealed to our public key.
    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let secret = self.secret.try_get().ok_or(IdentityError::NotReady)?;
        crypto::open(&secret, sealed).map_err(|_| IdentityError::Unseal)
    }
}
