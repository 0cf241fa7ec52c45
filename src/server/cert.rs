// The pairing receiver: a plaintext HTTP listener that only the overlay
// (and the LAN, during pairing) can reach. Everything sensitive in the
// exchange is inside sealed envelopes, so the transport stays bare.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::certificate::{san_host, CertError, CertificateStore};
use crate::crypto::{self, Digest};
use crate::friends::{Friend, FriendList};
use crate::identity::Identity;
use crate::overlay::OverlayRouter;
use crate::server::TalkServer;
use crate::session::Sessions;
use crate::util::{find_free_port, Cells};
use crate::wire::{self, http};
use crate::AppDelegate;

/// Pairing request bodies are sealed greetings; 64 KiB is generous.
const MAX_PAIRING_BODY: usize = 64 * 1024;

/// An inbound pairing request, decoded and fingerprinted, awaiting the
/// embedder's accept/reject decision.
#[derive(Clone)]
pub struct FriendRequest {
    /// The requester's certificate, PEM bytes.
    pub cert: Vec<u8>,
    pub name: String,
    /// The requester's X25519 sealing public key.
    pub public_key: [u8; 32],
    /// SHA-256 over `cert`.
    pub digest: Digest,
}

impl FriendRequest {
    pub(crate) fn from_wire(request: wire::Request) -> Self {
        let digest = Digest::of(&request.cert);
        Self {
            cert: request.cert,
            name: request.name,
            public_key: request.public_key,
            digest,
        }
    }

    /// The overlay host named by the requester's certificate.
    pub fn onion(&self) -> Result<String, CertError> {
        san_host(&self.cert)
    }

    /// Build the friend record this request describes.
    pub(crate) fn to_friend(&self) -> Result<Friend, CertError> {
        let onion = self.onion()?;
        let cert_pem = String::from_utf8(self.cert.clone()).map_err(|_| CertError::Parse)?;
        Ok(Friend::new(
            onion,
            self.name.clone(),
            cert_pem,
            self.public_key,
        ))
    }
}

impl std::fmt::Display for FriendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -- {}", self.name, self.digest.to_hex())
    }
}

struct Inner {
    identity: Arc<Identity>,
    certificate: Arc<CertificateStore>,
    friends: Arc<FriendList>,
    talk: Arc<TalkServer>,
    sessions: Arc<Sessions>,
    delegate: Arc<dyn AppDelegate>,
}

pub struct CertServer {
    router: Arc<dyn OverlayRouter>,
    cells: Arc<Cells>,
    inner: Arc<Inner>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CertServer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        router: Arc<dyn OverlayRouter>,
        cells: Arc<Cells>,
        identity: Arc<Identity>,
        certificate: Arc<CertificateStore>,
        friends: Arc<FriendList>,
        talk: Arc<TalkServer>,
        sessions: Arc<Sessions>,
        delegate: Arc<dyn AppDelegate>,
    ) -> Self {
        Self {
            router,
            cells,
            inner: Arc::new(Inner {
                identity,
                certificate,
                friends,
                talk,
                sessions,
                delegate,
            }),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), anyhow::Error> {
        let result = self.start_inner().await;
        if result.is_err() {
            self.cells.cert_port.poison();
            self.cells.cert_service_id.poison();
        }
        result
    }

    async fn start_inner(&self) -> Result<(), anyhow::Error> {
        let port = find_free_port()?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::debug!("pairing receiver listening on port {port}");

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
                                    tracing::debug!("pairing connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("pairing accept failed: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(task);

        // Front the listener with an overlay service so blocked LANs can
        // still pair with us.
        let created = self.router.create_service(vec![(80, port)]).await?;
        self.cells.cert_port.set(port);
        self.cells.cert_service_id.set(created.service_id);
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

enum Outcome {
    Accepted(Vec<u8>),
    Rejected,
    Bad,
    Failed,
}

async fn serve_connection(inner: Arc<Inner>, mut stream: TcpStream) -> Result<(), http::HttpError> {
    loop {
        let request = match http::read_request(&mut stream, MAX_PAIRING_BODY).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(http::HttpError::TooLarge) => {
                return http::write_response(&mut stream, 413, &[], b"").await;
            }
            Err(e) => return Err(e),
        };
        if request.method != "POST" || request.target != "/" {
            http::write_response(&mut stream, 404, &[], b"").await?;
            continue;
        }

        match handle_pairing(&inner, &request.body).await {
            Outcome::Accepted(sealed) => {
                http::write_response(
                    &mut stream,
                    200,
                    &[("content-type", "application/octet-stream")],
                    &sealed,
                )
                .await?;
            }
            Outcome::Rejected => http::write_response(&mut stream, 401, &[], b"").await?,
            Outcome::Bad => http::write_response(&mut stream, 400, &[], b"").await?,
            Outcome::Failed => http::write_response(&mut stream, 500, &[], b"").await?,
        }
    }
}

async fn handle_pairing(inner: &Inner, body: &[u8]) -> Outcome {
    tracing::debug!("handling friend request");

    let plaintext = match inner.identity.unseal(body) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::debug!("friend request unseal failed: {e}");
            return Outcome::Bad;
        }
    };
    let request = match wire::Request::decode(&plaintext) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("friend request decode failed: {e}");
            return Outcome::Bad;
        }
    };

    let friend_request = FriendRequest::from_wire(request);
    let peer_public_key = friend_request.public_key;
    tracing::info!("friend request from {friend_request}");

    // The decision can take as long as the embedder's user takes.
    let accepted = inner
        .delegate
        .on_friend_request(friend_request.clone())
        .await;
    if !accepted {
        tracing::debug!("friend request rejected");
        return Outcome::Rejected;
    }

    let friend = match friend_request.to_friend() {
        Ok(friend) => friend,
        Err(e) => {
            tracing::debug!("friend request carried an unusable certificate: {e}");
            return Outcome::Bad;
        }
    };

    // Persist first, then re-arm trust anchors, then connect.
    if let Err(e) = inner.friends.add(&friend) {
        tracing::error!("could not persist friend: {e}");
        return Outcome::Failed;
    }
    if let Err(e) = inner.talk.restart().await {
        tracing::error!("could not re-arm talk server: {e}");
        return Outcome::Failed;
    }
    if let Err(e) = inner.sessions.track(friend).await {
        tracing::warn!("could not open sessions for new friend: {e}");
    }

    let greeting = match inner.identity.greeting_payload(&inner.certificate).await {
        Ok(greeting) => greeting,
        Err(e) => {
            tracing::error!("could not build greeting: {e}");
            return Outcome::Failed;
        }
    };
    match crypto::seal(&peer_public_key, &greeting) {
        Ok(sealed) => Outcome::Accepted(sealed),
        Err(e) => {
            tracing::error!("could not seal greeting: {e}");
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friend_request_digest_matches_cert() {
        let request = wire::Request {
            cert: b"pem bytes".to_vec(),
            name: "carol".to_string(),
            public_key: [4u8; 32],
        };
        let friend_request = FriendRequest::from_wire(request);
        assert_eq!(friend_request.digest, Digest::of(b"pem bytes"));
        assert_eq!(friend_request.name, "carol");
    }

    #[test]
    fn test_to_friend_requires_a_real_certificate() {
        let friend_request = FriendRequest {
            cert: b"not a certificate".to_vec(),
            name: "carol".to_string(),
            public_key: [4u8; 32],
            digest: Digest::of(b"not a certificate"),
        };
        assert!(friend_request.to_friend().is_err());
    }
}
