// Overlay router capability layer.
//
// The router itself is an external process (tor or compatible). This
// module owns its lifecycle and exposes the narrow capability set the
// rest of the system needs: ephemeral service management and the SOCKS5
// outbound endpoint. Everything speaks the async control channel; nothing
// here ever blocks the scheduler.

mod control;
pub(crate) mod socks;

pub use socks::SocksError;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::config::RouterConfig;
use crate::util::{find_free_port, Cell};

use control::ControlClient;

/// An ephemeral overlay service the router is publishing for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedService {
    /// Service id, without the `.onion` suffix.
    pub service_id: String,
    /// Private key blob (`ED25519-V3:...`), replayed verbatim to
    /// re-install the service after a restart.
    pub private_key: String,
}

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay router is not running")]
    NotLaunched,
    #[error("router control error: {0}")]
    Control(String),
    #[error("unknown overlay service {0}")]
    UnknownService(String),
    #[error("router did not finish bootstrapping in time")]
    BootstrapTimeout,
    #[error("router process exited during bootstrap")]
    Exited,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The capability surface the core needs from an overlay router.
///
/// `TorRouter` is the production implementation; tests substitute their
/// own to run without a router process.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OverlayRouter: Send + Sync {
    /// Start or adopt the router process and authenticate its control
    /// channel. Returns once the outbound SOCKS proxy is usable.
    async fn launch(&self) -> Result<(), OverlayError>;

    /// Tear the router down. Idempotent.
    async fn shutdown(&self);

    /// Publish a brand-new ephemeral v3 service mapping each
    /// `(virtual, local)` port pair. Published before returning.
    async fn create_service(&self, ports: Vec<(u16, u16)>) -> Result<CreatedService, OverlayError>;

    /// Re-publish a service from its stored private key.
    async fn install_service(
        &self,
        private_key: String,
        ports: Vec<(u16, u16)>,
    ) -> Result<String, OverlayError>;

    /// Stop publishing a service created through this router.
    async fn remove_service(&self, service_id: String) -> Result<(), OverlayError>;

    /// Address of the router's outbound SOCKS5 proxy.
    async fn socks_endpoint(&self) -> Result<SocketAddr, OverlayError>;
}

/// Runs and talks to a tor-compatible router.
pub struct TorRouter {
    base: PathBuf,
    config: RouterConfig,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    control: tokio::sync::Mutex<Option<ControlClient<TcpStream>>>,
    socks: Cell<SocketAddr>,
    /// service_id → private key, for validating removals.
    services: parking_lot::Mutex<HashMap<String, String>>,
}

impl TorRouter {
    pub fn new(base: PathBuf, config: RouterConfig) -> Self {
        Self {
            base,
            config,
            child: tokio::sync::Mutex::new(None),
            control: tokio::sync::Mutex::new(None),
            socks: Cell::new(),
            services: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    async fn launch_inner(&self) -> Result<(), OverlayError> {
        match self.config.clone() {
            RouterConfig::Spawn {
                binary,
                bootstrap_timeout_secs,
            } => {
                self.spawn_router(&binary, Duration::from_secs(bootstrap_timeout_secs))
                    .await
            }
            RouterConfig::Adopt {
                control,
                cookie,
                socks,
            } => {
                let cookie_bytes = tokio::fs::read(&cookie).await?;
                let stream = TcpStream::connect(control).await?;
                let mut client = ControlClient::new(stream);
                client.authenticate(&hex::encode(cookie_bytes)).await?;
                *self.control.lock().await = Some(client);
                self.socks.set(socks);
                tracing::info!("adopted running overlay router at {control}");
                Ok(())
            }
        }
    }

    async fn spawn_router(&self, binary: &str, bootstrap_timeout: Duration) -> Result<(), OverlayError> {
        let data_dir = self.base.join("tor");
        tokio::fs::create_dir_all(&data_dir).await?;

        let control_port = find_free_port()?;
        let socks_port = find_free_port()?;

        let mut child = Command::new(binary)
            .arg("--ControlPort")
            .arg(control_port.to_string())
            .arg("--SocksPort")
            .arg(socks_port.to_string())
            .arg("--DataDirectory")
            .arg(&data_dir)
            .arg("--CookieAuthentication")
            .arg("1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or(OverlayError::Exited)?;
        let mut lines = BufReader::new(stdout).lines();

        let bootstrap = async {
            while let Some(line) = lines.next_line().await? {
                tracing::debug!(target: "slick::overlay", "{line}");
                if line.contains("Bootstrapped 100") {
                    return Ok(());
                }
            }
            Err(OverlayError::Exited)
        };
        match tokio::time::timeout(bootstrap_timeout, bootstrap).await {
            Ok(result) => result?,
            Err(_) => return Err(OverlayError::BootstrapTimeout),
        }

        // Keep draining so the router never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "slick::overlay", "{line}");
            }
        });

        let cookie = tokio::fs::read(data_dir.join("control_auth_cookie")).await?;
        let stream = TcpStream::connect(("127.0.0.1", control_port)).await?;
        let mut client = ControlClient::new(stream);
        client.authenticate(&hex::encode(cookie)).await?;

        *self.child.lock().await = Some(child);
        *self.control.lock().await = Some(client);
        self.socks
            .set(SocketAddr::from(([127, 0, 0, 1], socks_port)));
        tracing::info!("overlay router bootstrapped, socks on port {socks_port}");
        Ok(())
    }
}

#[async_trait]
impl OverlayRouter for TorRouter {
    async fn launch(&self) -> Result<(), OverlayError> {
        let result = self.launch_inner().await;
        if result.is_err() {
            self.socks.poison();
        }
        result
    }

    async fn shutdown(&self) {
        *self.control.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    async fn create_service(&self, ports: Vec<(u16, u16)>) -> Result<CreatedService, OverlayError> {
        let mut guard = self.control.lock().await;
        let client = guard.as_mut().ok_or(OverlayError::NotLaunched)?;
        let created = client.add_onion(None, &ports).await?;
        self.services
            .lock()
            .insert(created.service_id.clone(), created.private_key.clone());
        tracing::debug!("created overlay service {}", created.service_id);
        Ok(created)
    }

    async fn install_service(
        &self,
        private_key: String,
        ports: Vec<(u16, u16)>,
    ) -> Result<String, OverlayError> {
        let mut guard = self.control.lock().await;
        let client = guard.as_mut().ok_or(OverlayError::NotLaunched)?;
        let created = client.add_onion(Some(&private_key), &ports).await?;
        self.services
            .lock()
            .insert(created.service_id.clone(), private_key);
        tracing::debug!("re-installed overlay service {}", created.service_id);
        Ok(created.service_id)
    }

    async fn remove_service(&self, service_id: String) -> Result<(), OverlayError> {
        if self.services.lock().remove(&service_id).is_none() {
            return Err(OverlayError::UnknownService(service_id));
        }
        let mut guard = self.control.lock().await;
        let client = guard.as_mut().ok_or(OverlayError::NotLaunched)?;
        client.del_onion(&service_id).await
    }

    async fn socks_endpoint(&self) -> Result<SocketAddr, OverlayError> {
        self.socks.get().await.map_err(|_| OverlayError::NotLaunched)
    }
}
