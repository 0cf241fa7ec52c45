// TLS between friends.
//
// Every peer certificate is self-signed, so web-PKI path building has
// nothing to offer: trust is exact membership in the friend set. The
// server demands a client certificate and accepts precisely the
// certificates in the friend snapshot it was built from; the client pins
// the one certificate stored for the friend it is dialing and ignores
// hostnames entirely (peers are reached by `.onion` name or raw LAN
// address; the certificate SAN is the identity).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName,
    Error as RustlsError, ServerConfig, SignatureScheme,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate found in pem")]
    EmptyPem,
    #[error("no private key found in pem")]
    NoKey,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)?.ok_or(TlsError::NoKey)
}

/// Server side: require a client certificate and accept exactly the
/// friend set this verifier was built from.
#[derive(Debug)]
struct FriendSetVerifier {
    allowed: Vec<CertificateDer<'static>>,
    hints: Vec<DistinguishedName>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for FriendSetVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        if self
            .allowed
            .iter()
            .any(|cert| cert.as_ref() == end_entity.as_ref())
        {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(RustlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client side: accept exactly the certificate stored for the friend
/// being dialed, whatever hostname the connection used.
#[derive(Debug)]
struct PinnedPeerVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedPeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(RustlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Talk-server config: our certificate, client auth required, trust
/// anchors = exactly the given friend certificates.
pub fn server_config(
    cert_pem: &str,
    key_pem: &str,
    friend_cert_pems: &[String],
) -> Result<ServerConfig, TlsError> {
    let chain = certs_from_pem(cert_pem)?;
    if chain.is_empty() {
        return Err(TlsError::EmptyPem);
    }
    let key = key_from_pem(key_pem)?;

    let mut allowed = Vec::new();
    for pem in friend_cert_pems {
        allowed.extend(certs_from_pem(pem)?);
    }

    let verifier = Arc::new(FriendSetVerifier {
        allowed,
        hints: Vec::new(),
        provider: provider(),
    });
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)?;
    Ok(config)
}

/// Per-friend client config: our certificate as the client identity, the
/// friend's stored certificate as the only acceptable server identity.
pub fn client_config(
    our_cert_pem: &str,
    our_key_pem: &str,
    peer_cert_pem: &str,
) -> Result<ClientConfig, TlsError> {
    let chain = certs_from_pem(our_cert_pem)?;
    if chain.is_empty() {
        return Err(TlsError::EmptyPem);
    }
    let key = key_from_pem(our_key_pem)?;
    let pinned = certs_from_pem(peer_cert_pem)?
        .into_iter()
        .next()
        .ok_or(TlsError::EmptyPem)?;

    let verifier = Arc::new(PinnedPeerVerifier {
        pinned,
        provider: provider(),
    });
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(chain, key)?;
    Ok(config)
}
