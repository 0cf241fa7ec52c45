// The add-friend driver.
//
// Pairing with a nearby peer is a single sealed POST: direct to their LAN
// address first (one second to connect, then we assume the LAN path is
// blocked), falling back to their pairing service through the overlay.
// The reply must contain a certificate hashing to the digest the peer
// advertised; anything else aborts without touching state.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::certificate::{CertError, CertificateStore};
use crate::crypto::{self, CryptoError, Digest};
use crate::discovery::Nearby;
use crate::friends::{FriendError, FriendList};
use crate::identity::{Identity, IdentityError};
use crate::overlay::{socks, OverlayError, OverlayRouter, SocksError};
use crate::server::cert::FriendRequest;
use crate::server::talk::TalkError;
use crate::server::TalkServer;
use crate::session::{SessionError, Sessions};
use crate::wire::{self, http, WireError};

/// How long the direct attempt may spend connecting. The response wait
/// afterwards is unbounded: the other side's human is deciding.
const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pairing replies are sealed greetings, same bound as the receiver's.
const MAX_REPLY_BODY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("certificate digest mismatch: expected {expected} got {got}")]
    DigestMismatch { expected: Digest, got: Digest },
    #[error("peer advertises no overlay pairing route")]
    NoOverlayRoute,
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Http(#[from] http::HttpError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Socks(#[from] SocksError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Friend(#[from] FriendError),
    #[error(transparent)]
    Talk(#[from] TalkError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct Pairing {
    identity: Arc<Identity>,
    certificate: Arc<CertificateStore>,
    friends: Arc<FriendList>,
    talk: Arc<TalkServer>,
    sessions: Arc<Sessions>,
    router: Arc<dyn OverlayRouter>,
}

impl Pairing {
    pub(crate) fn new(
        identity: Arc<Identity>,
        certificate: Arc<CertificateStore>,
        friends: Arc<FriendList>,
        talk: Arc<TalkServer>,
        sessions: Arc<Sessions>,
        router: Arc<dyn OverlayRouter>,
    ) -> Self {
        Self {
            identity,
            certificate,
            friends,
            talk,
            sessions,
            router,
        }
    }

    /// Run the add-friend exchange against a nearby candidate.
    ///
    /// `Ok(true)` means both sides now trust each other. `Ok(false)`
    /// means the peer answered but declined. Errors mean the exchange
    /// could not complete; no state was changed.
    pub async fn add(&self, nearby: &Nearby) -> Result<bool, PairingError> {
        let greeting = self.identity.greeting_payload(&self.certificate).await?;
        let sealed = crypto::seal(&nearby.public_key, &greeting)?;

        let response = match self.attempt_direct(nearby, &sealed).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("cannot make a direct connection: {e}");
                self.attempt_overlay(nearby, &sealed).await?
            }
        };
        self.process_response(nearby, response).await
    }

    async fn attempt_direct(
        &self,
        nearby: &Nearby,
        sealed: &[u8],
    ) -> Result<http::Response, PairingError> {
        let mut stream = tokio::time::timeout(
            DIRECT_CONNECT_TIMEOUT,
            TcpStream::connect(nearby.cert_addr()),
        )
        .await
        .map_err(|_| {
            PairingError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "direct pairing connect timed out",
            ))
        })??;

        http::write_request(
            &mut stream,
            "POST",
            "/",
            &[("content-type", "application/octet-stream")],
            sealed,
        )
        .await?;
        Ok(http::read_response(&mut stream, MAX_REPLY_BODY).await?)
    }

    async fn attempt_overlay(
        &self,
        nearby: &Nearby,
        sealed: &[u8],
    ) -> Result<http::Response, PairingError> {
        let cert_service_id = nearby
            .cert_service_id
            .as_ref()
            .ok_or(PairingError::NoOverlayRoute)?;
        let host = format!("{cert_service_id}.onion");

        let proxy = self.router.socks_endpoint().await?;
        let mut stream = TcpStream::connect(proxy).await?;
        socks::connect(&mut stream, &host, 80).await?;

        http::write_request(
            &mut stream,
            "POST",
            "/",
            &[
                ("host", &host),
                ("content-type", "application/octet-stream"),
            ],
            sealed,
        )
        .await?;
        Ok(http::read_response(&mut stream, MAX_REPLY_BODY).await?)
    }

    async fn process_response(
        &self,
        nearby: &Nearby,
        response: http::Response,
    ) -> Result<bool, PairingError> {
        if response.status != 200 {
            tracing::debug!("nope on adding (status {})", response.status);
            return Ok(false);
        }

        let plaintext = self.identity.unseal(&response.body)?;
        let request = wire::Request::decode(&plaintext)?;

        let got = Digest::of(&request.cert);
        if got != nearby.digest {
            tracing::warn!(
                "pairing reply certificate does not match the advertised digest \
                 (expected {} got {got})",
                nearby.digest
            );
            return Err(PairingError::DigestMismatch {
                expected: nearby.digest,
                got,
            });
        }

        let friend = FriendRequest::from_wire(request).to_friend()?;
        tracing::debug!("adding {friend}");
        self.friends.add(&friend)?;
        self.talk.restart().await?;
        self.sessions.track(friend).await?;
        Ok(true)
    }
}
