// slick — friend-to-friend encrypted messaging and file transfer.
//
// Two peers pair by exchanging self-signed certificates inside sealed
// envelopes (LAN-direct, falling back to an onion overlay), then talk
// over mutually-authenticated TLS that works on both paths. No servers,
// no accounts: a friend is a certificate you chose to trust.

pub mod certificate;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod friends;
pub mod identity;
pub mod overlay;
pub mod pairing;
pub mod server;
pub mod session;
pub mod tls;
mod util;
pub mod wire;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub use certificate::{san_host, CertError, CertificateStore};
pub use config::{AppConfig, RouterConfig};
pub use crypto::Digest;
pub use discovery::{Discovery, Nearby};
pub use friends::{Friend, FriendError};
pub use identity::{Identity, IdentityError};
pub use overlay::{CreatedService, OverlayError, OverlayRouter, TorRouter};
pub use pairing::PairingError;
pub use server::{CertServer, FriendRequest, Message, TalkServer};
pub use session::{Progress, SessionError, Sessions, TransferError};
pub use wire::FileOffer;

use crate::friends::FriendList;
use crate::pairing::Pairing;
use crate::util::Cells;

// ============================================================================
// DELEGATE
// ============================================================================

/// Callback surface for the embedding application.
///
/// Messages arrive in wire order per peer; the friend-request decision
/// may take as long as a human takes.
#[async_trait]
pub trait AppDelegate: Send + Sync {
    /// A friend delivered a message (text or file offer).
    async fn on_message(&self, message: Message);
    /// Someone asked to become a friend. Return `true` to accept.
    async fn on_friend_request(&self, request: FriendRequest) -> bool;
}

// ============================================================================
// SERVICE SUPERVISION
// ============================================================================

/// Lifecycle state of one component, as tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Initializing,
    Started,
    Errored,
    Stopping,
    Stopped,
}

#[async_trait]
trait Service: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
}

struct RouterService(Arc<dyn OverlayRouter>);
struct CertificateService(Arc<CertificateStore>);
struct FriendsService(Arc<FriendList>);
struct IdentityService(Arc<Identity>);
struct CertServerService(Arc<CertServer>);
struct DiscoveryService(Arc<Discovery>);
struct TalkService(Arc<TalkServer>);
struct SessionsService(Arc<Sessions>);

#[async_trait]
impl Service for RouterService {
    fn name(&self) -> &'static str {
        "tor"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.launch().await?)
    }
    async fn stop(&self) {
        self.0.shutdown().await;
    }
}

#[async_trait]
impl Service for CertificateService {
    fn name(&self) -> &'static str {
        "certificate"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {}
}

#[async_trait]
impl Service for FriendsService {
    fn name(&self) -> &'static str {
        "friends"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {}
}

#[async_trait]
impl Service for IdentityService {
    fn name(&self) -> &'static str {
        "ident"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {}
}

#[async_trait]
impl Service for CertServerService {
    fn name(&self) -> &'static str {
        "cert"
    }
    async fn start(&self) -> anyhow::Result<()> {
        self.0.start().await
    }
    async fn stop(&self) {
        self.0.stop().await;
    }
}

#[async_trait]
impl Service for DiscoveryService {
    fn name(&self) -> &'static str {
        "discovery"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {
        self.0.stop().await;
    }
}

#[async_trait]
impl Service for TalkService {
    fn name(&self) -> &'static str {
        "talk"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {
        self.0.stop().await;
    }
}

#[async_trait]
impl Service for SessionsService {
    fn name(&self) -> &'static str {
        "connections"
    }
    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.0.start().await?)
    }
    async fn stop(&self) {
        self.0.stop().await;
    }
}

// ============================================================================
// APP
// ============================================================================

/// The assembled node: every component plus its supervisor.
pub struct App {
    base: PathBuf,
    delete_at_exit: bool,
    states: Arc<RwLock<HashMap<&'static str, ServiceStatus>>>,
    services: Vec<Arc<dyn Service>>,
    start_tasks: Mutex<Vec<JoinHandle<()>>>,
    log_guard: Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>,

    identity: Arc<Identity>,
    friends: Arc<FriendList>,
    discovery: Arc<Discovery>,
    sessions: Arc<Sessions>,
    pairing: Pairing,
}

impl App {
    /// Build a node that runs its own overlay router per the config.
    pub fn new(config: AppConfig, delegate: Arc<dyn AppDelegate>) -> anyhow::Result<Self> {
        let (base, delete_at_exit) = resolve_base(config.base);
        let router = Arc::new(TorRouter::new(base.clone(), config.router));
        Self::assemble(base, delete_at_exit, config.name, delegate, router)
    }

    /// Build a node against a caller-supplied overlay router.
    pub fn with_router(
        config: AppConfig,
        delegate: Arc<dyn AppDelegate>,
        router: Arc<dyn OverlayRouter>,
    ) -> anyhow::Result<Self> {
        let (base, delete_at_exit) = resolve_base(config.base);
        Self::assemble(base, delete_at_exit, config.name, delegate, router)
    }

    fn assemble(
        base: PathBuf,
        delete_at_exit: bool,
        name: Option<String>,
        delegate: Arc<dyn AppDelegate>,
        router: Arc<dyn OverlayRouter>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&base)?;

        let cells = Arc::new(Cells::new());
        let certificate = Arc::new(CertificateStore::new(base.clone(), cells.clone()));
        let friends = Arc::new(FriendList::new(base.clone()));
        let identity = Arc::new(Identity::new(
            base.clone(),
            name,
            router.clone(),
            cells.clone(),
        ));
        let talk = Arc::new(TalkServer::new(
            cells.clone(),
            certificate.clone(),
            friends.clone(),
            delegate.clone(),
        ));
        let discovery = Arc::new(Discovery::new(cells.clone(), certificate.clone()));
        let sessions = Arc::new(Sessions::new(
            friends.clone(),
            discovery.clone(),
            certificate.clone(),
            router.clone(),
            talk.clone(),
        ));
        let cert_server = Arc::new(CertServer::new(
            router.clone(),
            cells,
            identity.clone(),
            certificate.clone(),
            friends.clone(),
            talk.clone(),
            sessions.clone(),
            delegate,
        ));
        let pairing = Pairing::new(
            identity.clone(),
            certificate.clone(),
            friends.clone(),
            talk.clone(),
            sessions.clone(),
            router.clone(),
        );

        let services: Vec<Arc<dyn Service>> = vec![
            Arc::new(RouterService(router)),
            Arc::new(CertificateService(certificate)),
            Arc::new(FriendsService(friends.clone())),
            Arc::new(IdentityService(identity.clone())),
            Arc::new(CertServerService(cert_server)),
            Arc::new(DiscoveryService(discovery.clone())),
            Arc::new(TalkService(talk)),
            Arc::new(SessionsService(sessions.clone())),
        ];

        Ok(Self {
            base,
            delete_at_exit,
            states: Arc::new(RwLock::new(HashMap::new())),
            services,
            start_tasks: Mutex::new(Vec::new()),
            log_guard: Mutex::new(None),
            identity,
            friends,
            discovery,
            sessions,
            pairing,
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Launch every service concurrently. Failures are recorded per
    /// service and never abort siblings.
    pub async fn start(&self) {
        self.init_logging();
        tracing::debug!("starting app in {}", self.base.display());

        let mut tasks = self.start_tasks.lock();
        for service in &self.services {
            self.states
                .write()
                .insert(service.name(), ServiceStatus::Initializing);
            let service = service.clone();
            let states = self.states.clone();
            tasks.push(tokio::spawn(async move {
                tracing::debug!("starting {}", service.name());
                match service.start().await {
                    Ok(()) => {
                        states.write().insert(service.name(), ServiceStatus::Started);
                    }
                    Err(e) => {
                        states.write().insert(service.name(), ServiceStatus::Errored);
                        tracing::error!("{} failed to start: {e:#}", service.name());
                    }
                }
            }));
        }
    }

    /// Cancel outstanding start work and stop every service concurrently.
    /// An ephemeral base directory is removed afterwards.
    pub async fn stop(&self) {
        tracing::debug!("stopping app");
        for task in self.start_tasks.lock().drain(..) {
            task.abort();
        }

        let stops = self.services.iter().map(|service| {
            let service = service.clone();
            let states = self.states.clone();
            async move {
                states
                    .write()
                    .insert(service.name(), ServiceStatus::Stopping);
                service.stop().await;
                states.write().insert(service.name(), ServiceStatus::Stopped);
            }
        });
        futures::future::join_all(stops).await;

        if self.delete_at_exit {
            let _ = tokio::fs::remove_dir_all(&self.base).await;
        }
    }

    fn init_logging(&self) {
        let appender = tracing_appender::rolling::never(&self.base, "slick.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_writer(writer)
            .with_ansi(false);
        // If the embedder already installed a subscriber, the log file is
        // theirs to wire up.
        if subscriber.try_init().is_ok() {
            *self.log_guard.lock() = Some(guard);
        }
    }

    // ------------------------------------------------------------------------
    // STATE & DISCOVERY
    // ------------------------------------------------------------------------

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// True until an identity has been provisioned on disk.
    pub fn requires_setup(&self) -> bool {
        self.identity.requires_setup()
    }

    pub fn service_states(&self) -> HashMap<&'static str, ServiceStatus> {
        self.states.read().clone()
    }

    /// Peers currently visible on the LAN.
    pub fn nearby(&self) -> Vec<Nearby> {
        self.discovery.nearby()
    }

    /// Feed a peer record obtained out of band, as if discovered.
    pub fn observe_nearby(&self, record: Nearby) {
        self.discovery.observe(record);
    }

    /// The record this node advertises (loopback address stand-in).
    pub async fn advertisement(&self) -> anyhow::Result<Nearby> {
        Ok(self.discovery.local_record().await?)
    }

    // ------------------------------------------------------------------------
    // FRIENDS & MESSAGING
    // ------------------------------------------------------------------------

    /// Run the pairing exchange against a nearby candidate.
    pub async fn add_friend(&self, nearby: &Nearby) -> Result<bool, PairingError> {
        self.pairing.add(nearby).await
    }

    pub fn friends(&self) -> Vec<Friend> {
        self.friends.friends()
    }

    /// Whether any connection to the friend is currently live.
    pub fn is_active(&self, friend: &Digest) -> bool {
        self.sessions.is_active(friend)
    }

    /// Send a text message over the best live connection.
    pub async fn send(&self, friend: &Digest, text: &str) -> Result<bool, SessionError> {
        self.sessions.send(friend, text).await
    }

    /// Offer a local file to a friend.
    pub async fn offer_file(&self, friend: &Digest, path: &Path) -> Result<bool, SessionError> {
        self.sessions.offer_file(friend, path).await
    }

    /// Fetch an offered file to `target`.
    pub async fn get_file(
        &self,
        friend: &Digest,
        url: &str,
        size: u64,
        target: &Path,
    ) -> Result<(), TransferError> {
        self.sessions
            .get_file(friend, url, size, target, Progress::new())
            .await
    }

    /// Fetch an offered file, reporting progress through the given counter.
    pub async fn get_file_with_progress(
        &self,
        friend: &Digest,
        url: &str,
        size: u64,
        target: &Path,
        progress: Progress,
    ) -> Result<(), TransferError> {
        self.sessions
            .get_file(friend, url, size, target, progress)
            .await
    }
}

fn resolve_base(base: Option<PathBuf>) -> (PathBuf, bool) {
    match base {
        Some(base) => (base, false),
        None => {
            let base = std::env::temp_dir().join(format!("slick-{}", uuid::Uuid::new_v4()));
            (base, true)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
