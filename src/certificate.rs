// Local TLS credential: a self-signed certificate bound to our overlay
// service hostname.
//
// Created once on first run and persisted as `server.crt`/`server.key`;
// immutable afterwards. The SHA-256 of the PEM bytes is this peer's
// canonical fingerprint everywhere else in the system.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::crypto::Digest;
use crate::util::{Cell, Cells};

#[derive(Debug, Error)]
pub enum CertError {
    #[error("cannot provision certificate: {0}")]
    Provision(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("certificate parse failed")]
    Parse,
    #[error("certificate has no DNS subject alternative name")]
    NoSan,
}

#[derive(Clone)]
struct Bundle {
    cert_pem: String,
    key_pem: String,
    digest: Digest,
}

pub struct CertificateStore {
    base: PathBuf,
    cells: Arc<Cells>,
    bundle: Cell<Bundle>,
}

impl CertificateStore {
    pub(crate) fn new(base: PathBuf, cells: Arc<Cells>) -> Self {
        Self {
            base,
            cells,
            bundle: Cell::new(),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), CertError> {
        let result = self.start_inner().await;
        if result.is_err() {
            self.bundle.poison();
        }
        result
    }

    async fn start_inner(&self) -> Result<(), CertError> {
        let service_id = self.cells.service_id.get().await.map_err(|_| {
            CertError::Provision("overlay service identity never became available".to_string())
        })?;
        let host = format!("{service_id}.onion");

        let cert_path = self.base.join("server.crt");
        let key_path = self.base.join("server.key");

        let (cert_pem, key_pem) = if tokio::fs::try_exists(&cert_path).await?
            && tokio::fs::try_exists(&key_path).await?
        {
            tracing::debug!("loading certificate from {}", cert_path.display());
            (
                tokio::fs::read_to_string(&cert_path).await?,
                tokio::fs::read_to_string(&key_path).await?,
            )
        } else {
            tracing::info!("generating certificate for {host}");
            let (cert_pem, key_pem) = generate(&host)?;
            tokio::fs::write(&cert_path, &cert_pem).await?;
            tokio::fs::write(&key_path, &key_pem).await?;
            (cert_pem, key_pem)
        };

        let digest = Digest::of(cert_pem.as_bytes());
        self.bundle.set(Bundle {
            cert_pem,
            key_pem,
            digest,
        });
        Ok(())
    }

    /// Our certificate, PEM bytes. Waits for provisioning.
    pub async fn public_cert_bytes(&self) -> Result<Vec<u8>, CertError> {
        let bundle = self.bundle.get().await.map_err(not_provisioned)?;
        Ok(bundle.cert_pem.into_bytes())
    }

    /// SHA-256 over our certificate PEM. Waits for provisioning.
    pub async fn digest(&self) -> Result<Digest, CertError> {
        let bundle = self.bundle.get().await.map_err(not_provisioned)?;
        Ok(bundle.digest)
    }

    /// Certificate and key PEM for building TLS configs.
    pub(crate) async fn identity_pair(&self) -> Result<(String, String), CertError> {
        let bundle = self.bundle.get().await.map_err(not_provisioned)?;
        Ok((bundle.cert_pem, bundle.key_pem))
    }
}

fn not_provisioned(_: crate::util::CellPoisoned) -> CertError {
    CertError::Provision("certificate service failed".to_string())
}

fn generate(host: &str) -> Result<(String, String), CertError> {
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::Provision(e.to_string()))?;
    let params = rcgen::CertificateParams::new(vec![host.to_string()])
        .map_err(|e| CertError::Provision(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Provision(e.to_string()))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// First DNS name in a PEM certificate's subject alternative names.
///
/// This is how a certificate names the overlay endpoint it belongs to;
/// friends are addressed by it.
pub fn san_host(pem: &[u8]) -> Result<String, CertError> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem).map_err(|_| CertError::Parse)?;
    let cert = parsed.parse_x509().map_err(|_| CertError::Parse)?;
    san_from_cert(&cert)
}

/// Same as [`san_host`], for the DER certificate a TLS peer presented.
pub fn san_host_der(der: &[u8]) -> Result<String, CertError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| CertError::Parse)?;
    san_from_cert(&cert)
}

fn san_from_cert(cert: &X509Certificate<'_>) -> Result<String, CertError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|_| CertError::Parse)?
        .ok_or(CertError::NoSan)?;
    for name in &san.value.general_names {
        if let GeneralName::DNSName(dns) = name {
            return Ok(dns.to_string());
        }
    }
    Err(CertError::NoSan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cells_with_service_id(id: &str) -> Arc<Cells> {
        let cells = Arc::new(Cells::new());
        cells.service_id.set(id.to_string());
        cells
    }

    #[tokio::test]
    async fn test_first_start_generates_and_persists() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::new(
            dir.path().to_path_buf(),
            cells_with_service_id("aliceonionid"),
        );
        store.start().await.unwrap();

        assert!(dir.path().join("server.crt").exists());
        assert!(dir.path().join("server.key").exists());

        let pem = store.public_cert_bytes().await.unwrap();
        assert_eq!(san_host(&pem).unwrap(), "aliceonionid.onion");
        assert_eq!(store.digest().await.unwrap(), Digest::of(&pem));
    }

    #[tokio::test]
    async fn test_restart_loads_same_certificate() {
        let dir = tempdir().unwrap();
        let cells = cells_with_service_id("aliceonionid");

        let first = CertificateStore::new(dir.path().to_path_buf(), cells.clone());
        first.start().await.unwrap();
        let first_digest = first.digest().await.unwrap();

        let second = CertificateStore::new(dir.path().to_path_buf(), cells);
        second.start().await.unwrap();
        assert_eq!(second.digest().await.unwrap(), first_digest);
    }

    #[tokio::test]
    async fn test_start_fails_when_service_id_poisoned() {
        let dir = tempdir().unwrap();
        let cells = Arc::new(Cells::new());
        cells.service_id.poison();

        let store = CertificateStore::new(dir.path().to_path_buf(), cells);
        assert!(matches!(
            store.start().await,
            Err(CertError::Provision(_))
        ));
    }

    #[test]
    fn test_san_host_rejects_cert_without_san() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        assert!(matches!(
            san_host(cert.pem().as_bytes()),
            Err(CertError::NoSan)
        ));
    }

    #[test]
    fn test_san_host_rejects_garbage() {
        assert!(san_host(b"not a pem").is_err());
    }
}
