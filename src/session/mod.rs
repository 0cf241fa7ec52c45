// Per-friend client sessions.
//
// Every friend gets two long-lived connection handles the moment it is
// loaded or added: one direct (LAN address from discovery) and one
// through the overlay. Each runs its own maintenance loop — probe,
// mark active, reconnect with jittered backoff — and `connection()`
// always prefers a live direct path.

pub mod transfer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::certificate::{CertError, CertificateStore};
use crate::crypto::Digest;
use crate::discovery::Discovery;
use crate::friends::{Friend, FriendList};
use crate::overlay::{OverlayError, OverlayRouter, SocksError};
use crate::server::talk::TalkError;
use crate::server::TalkServer;
use crate::tls::{self, TlsError};
use crate::wire::http::{self, HttpError};
use crate::wire::{FileOffer, FILE_OFFER_CONTENT_TYPE};

pub use transfer::{Progress, TransferError};

/// Cap on bodies we accept back from a peer outside of file chunks.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// How long a direct dial may take before it is considered dead.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe interval while a connection is healthy.
const IDLE_PROBE: Duration = Duration::from_secs(15);

/// Reconnect backoff bounds.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session for that friend")]
    UnknownFriend,
    #[error("no live connection to that friend")]
    NotConnected,
    #[error("no direct route: peer is not nearby")]
    NoRoute,
    #[error("friend onion host is not a valid server name")]
    BadServerName,
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("range response had the wrong length")]
    BadChunk,
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Socks(#[from] SocksError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Talk(#[from] TalkError),
}

enum Route {
    /// Dial the LAN address discovery currently has for the peer.
    Direct {
        digest: Digest,
        discovery: Arc<Discovery>,
    },
    /// Dial `<onion>:443` through the overlay's SOCKS endpoint.
    Overlay {
        host: String,
        router: Arc<dyn OverlayRouter>,
    },
}

pub(crate) struct Connection {
    label: &'static str,
    peer: String,
    route: Route,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    active: AtomicBool,
    pooled: tokio::sync::Mutex<Option<TlsStream<TcpStream>>>,
    cancel: CancellationToken,
}

impl Connection {
    fn spawn(
        label: &'static str,
        peer: String,
        route: Route,
        connector: TlsConnector,
        server_name: ServerName<'static>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            label,
            peer,
            route,
            connector,
            server_name,
            active: AtomicBool::new(false),
            pooled: tokio::sync::Mutex::new(None),
            cancel,
        });
        connection.clone().spawn_maintenance();
        connection
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>, SessionError> {
        let tcp = match &self.route {
            Route::Direct { digest, discovery } => {
                let nearby = discovery
                    .nearby_for_digest(digest)
                    .ok_or(SessionError::NoRoute)?;
                tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(nearby.talk_addr()))
                    .await
                    .map_err(|_| {
                        SessionError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "direct dial timed out",
                        ))
                    })??
            }
            Route::Overlay { host, router } => {
                let socks = router.socks_endpoint().await?;
                let mut tcp = TcpStream::connect(socks).await?;
                crate::overlay::socks::connect(&mut tcp, host, 443).await?;
                tcp
            }
        };
        let stream = self.connector.connect(self.server_name.clone(), tcp).await?;
        Ok(stream)
    }

    /// One request/response over the pooled stream. Any I/O failure drops
    /// the stream and clears `active`.
    async fn request(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<http::Response, SessionError> {
        let mut guard = self.pooled.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => match self.dial().await {
                Ok(stream) => stream,
                Err(e) => {
                    self.active.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            },
        };

        let exchange = async {
            http::write_request(&mut stream, method, target, headers, body).await?;
            http::read_response(&mut stream, MAX_RESPONSE_BYTES).await
        };
        match exchange.await {
            Ok(response) => {
                *guard = Some(stream);
                self.active.store(true, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                self.active.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    pub async fn send(&self, text: &str) -> Result<bool, SessionError> {
        let response = self
            .request("POST", "/", &[("content-type", "text/plain")], text.as_bytes())
            .await?;
        Ok(response.is_success())
    }

    pub async fn offer(&self, offer: &FileOffer) -> Result<bool, SessionError> {
        let response = self
            .request(
                "POST",
                "/",
                &[("content-type", FILE_OFFER_CONTENT_TYPE)],
                &offer.encode(),
            )
            .await?;
        Ok(response.is_success())
    }

    /// A dedicated stream for chunked transfers, so workers don't fight
    /// over the pooled one.
    pub async fn open_channel(&self) -> Result<Channel, SessionError> {
        Ok(Channel {
            stream: self.dial().await?,
        })
    }

    fn spawn_maintenance(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut backoff = BACKOFF_FLOOR;
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let delay = match self.request("HEAD", "/", &[], b"").await {
                    Ok(_) => {
                        backoff = BACKOFF_FLOOR;
                        IDLE_PROBE
                    }
                    Err(e) => {
                        tracing::debug!(
                            "{} connection to {} down: {e}",
                            self.label,
                            self.peer
                        );
                        let jittered = backoff.mul_f64(0.8 + 0.4 * rand::random::<f64>());
                        backoff = (backoff * 2).min(BACKOFF_CEILING);
                        jittered
                    }
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }
}

/// A dedicated request stream used by transfer workers.
pub(crate) struct Channel {
    stream: TlsStream<TcpStream>,
}

impl Channel {
    /// Fetch `[start, end)` of the peer's file at `target`.
    pub async fn get_range(
        &mut self,
        target: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, SessionError> {
        let range = format!("bytes={}-{}", start, end - 1);
        http::write_request(&mut self.stream, "GET", target, &[("range", &range)], b"").await?;
        let response =
            http::read_response(&mut self.stream, (end - start) as usize).await?;
        if response.status != 206 && response.status != 200 {
            return Err(SessionError::Status(response.status));
        }
        if response.body.len() as u64 != end - start {
            return Err(SessionError::BadChunk);
        }
        Ok(response.body)
    }
}

/// A friend with its pair of connection handles.
pub(crate) struct Peer {
    pub friend: Friend,
    direct: Arc<Connection>,
    overlay: Arc<Connection>,
}

impl Peer {
    fn connect(
        friend: Friend,
        our_cert_pem: &str,
        our_key_pem: &str,
        discovery: Arc<Discovery>,
        router: Arc<dyn OverlayRouter>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let config = Arc::new(tls::client_config(
            our_cert_pem,
            our_key_pem,
            &friend.cert_pem,
        )?);
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(friend.onion.clone())
            .map_err(|_| SessionError::BadServerName)?;

        let direct = Connection::spawn(
            "direct",
            friend.name.clone(),
            Route::Direct {
                digest: friend.digest(),
                discovery,
            },
            connector.clone(),
            server_name.clone(),
            cancel.child_token(),
        );
        let overlay = Connection::spawn(
            "overlay",
            friend.name.clone(),
            Route::Overlay {
                host: friend.onion.clone(),
                router,
            },
            connector,
            server_name,
            cancel.child_token(),
        );

        Ok(Self {
            friend,
            direct,
            overlay,
        })
    }

    /// Direct wins while its probe holds; otherwise the overlay handle.
    pub fn connection(&self) -> &Arc<Connection> {
        if self.direct.active() {
            &self.direct
        } else {
            &self.overlay
        }
    }

    pub fn active(&self) -> bool {
        self.direct.active() || self.overlay.active()
    }
}

/// All live peer sessions, keyed by friend digest.
pub struct Sessions {
    friends: Arc<FriendList>,
    discovery: Arc<Discovery>,
    certificate: Arc<CertificateStore>,
    router: Arc<dyn OverlayRouter>,
    talk: Arc<TalkServer>,
    peers: parking_lot::RwLock<HashMap<Digest, Arc<Peer>>>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl Sessions {
    pub(crate) fn new(
        friends: Arc<FriendList>,
        discovery: Arc<Discovery>,
        certificate: Arc<CertificateStore>,
        router: Arc<dyn OverlayRouter>,
        talk: Arc<TalkServer>,
    ) -> Self {
        Self {
            friends,
            discovery,
            certificate,
            router,
            talk,
            peers: parking_lot::RwLock::new(HashMap::new()),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), SessionError> {
        for friend in self.friends.friends() {
            if let Err(e) = self.track(friend).await {
                tracing::warn!("could not open sessions for a friend: {e}");
            }
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let cancel = {
            let mut guard = self.cancel.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        cancel.cancel();
        self.peers.write().clear();
    }

    /// Open connection handles for a friend (idempotent).
    pub(crate) async fn track(&self, friend: Friend) -> Result<(), SessionError> {
        if self.peers.read().contains_key(&friend.digest()) {
            return Ok(());
        }
        let (cert_pem, key_pem) = self.certificate.identity_pair().await?;
        let cancel = self.cancel.lock().clone();
        let peer = Peer::connect(
            friend,
            &cert_pem,
            &key_pem,
            self.discovery.clone(),
            self.router.clone(),
            cancel,
        )?;
        self.peers.write().insert(peer.friend.digest(), Arc::new(peer));
        Ok(())
    }

    fn peer(&self, digest: &Digest) -> Option<Arc<Peer>> {
        self.peers.read().get(digest).cloned()
    }

    /// Whether either connection to the friend is currently live.
    pub fn is_active(&self, digest: &Digest) -> bool {
        self.peer(digest).map(|peer| peer.active()).unwrap_or(false)
    }

    /// Send a text message. `Ok(false)` means no live connection or a
    /// non-2xx reply.
    pub async fn send(&self, digest: &Digest, text: &str) -> Result<bool, SessionError> {
        let peer = self.peer(digest).ok_or(SessionError::UnknownFriend)?;
        let connection = peer.connection();
        if !connection.active() {
            tracing::debug!("can't send: no live connection to {}", peer.friend.name);
            return Ok(false);
        }
        connection.send(text).await
    }

    /// Offer a local file: register it with our talk server, then tell
    /// the friend where to fetch it.
    pub async fn offer_file(&self, digest: &Digest, path: &Path) -> Result<bool, SessionError> {
        let peer = self.peer(digest).ok_or(SessionError::UnknownFriend)?;
        let connection = peer.connection();
        if !connection.active() {
            return Ok(false);
        }

        let url = self.talk.offer_file(&peer.friend, path)?;
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let offer = FileOffer {
            url,
            size: metadata.len(),
            content_type: guess_content_type(path).to_string(),
            name,
        };
        connection.offer(&offer).await
    }

    /// Download an offered file with parallel ranged GETs.
    pub async fn get_file(
        &self,
        digest: &Digest,
        url: &str,
        size: u64,
        target: &Path,
        progress: Progress,
    ) -> Result<(), TransferError> {
        let peer = self.peer(digest).ok_or(TransferError::UnknownFriend)?;
        let connection = peer.connection().clone();
        if !connection.active() {
            return Err(TransferError::NotConnected);
        }
        let cancel = self.cancel.lock().child_token();
        transfer::download(connection, url, size, target, cancel, progress).await
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
