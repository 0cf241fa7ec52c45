// Shared fixtures for the integration tests: a router stub that hands
// out fake overlay services (so no router process is needed), a
// channel-backed delegate, and helpers to spawn paired nodes on loopback.
// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use slick::{
    App, AppConfig, AppDelegate, CreatedService, FriendRequest, Message, OverlayError,
    OverlayRouter, ServiceStatus,
};

/// An overlay router that fabricates service ids instead of talking to a
/// real router. The overlay path stays dark (no SOCKS endpoint); the
/// direct path carries all traffic, which is exactly what loopback tests
/// exercise.
pub struct StubRouter {
    counter: AtomicU64,
    socks: Option<SocketAddr>,
}

impl StubRouter {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            socks: None,
        }
    }

    /// Route overlay traffic through the given SOCKS5 proxy instead of
    /// reporting the overlay as unavailable.
    pub fn with_socks(socks: SocketAddr) -> Self {
        Self {
            counter: AtomicU64::new(0),
            socks: Some(socks),
        }
    }
}

fn service_id_for(private_key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    private_key.hash(&mut hasher);
    format!("{:016x}stub", hasher.finish())
}

#[async_trait]
impl OverlayRouter for StubRouter {
    async fn launch(&self) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn create_service(
        &self,
        _ports: Vec<(u16, u16)>,
    ) -> Result<CreatedService, OverlayError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let private_key = format!("ED25519-V3:stub-key-{n}-{}", std::process::id());
        Ok(CreatedService {
            service_id: service_id_for(&private_key),
            private_key,
        })
    }

    async fn install_service(
        &self,
        private_key: String,
        _ports: Vec<(u16, u16)>,
    ) -> Result<String, OverlayError> {
        // Same key, same id, like a real router
        Ok(service_id_for(&private_key))
    }

    async fn remove_service(&self, _service_id: String) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn socks_endpoint(&self) -> Result<SocketAddr, OverlayError> {
        self.socks.ok_or(OverlayError::NotLaunched)
    }
}

/// A minimal SOCKS5 server that accepts any CONNECT and tunnels it to
/// one fixed target, standing in for the overlay: whatever onion the
/// client names, the bytes land on `target`.
pub async fn spawn_socks_proxy(target: SocketAddr) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await?;
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await?;
                client.write_all(&[0x05, 0x00]).await?;

                let mut head = [0u8; 4];
                client.read_exact(&mut head).await?;
                let addr_len = match head[3] {
                    0x01 => 4,
                    0x04 => 16,
                    0x03 => {
                        let mut len = [0u8; 1];
                        client.read_exact(&mut len).await?;
                        len[0] as usize
                    }
                    _ => return Ok::<(), std::io::Error>(()),
                };
                let mut rest = vec![0u8; addr_len + 2];
                client.read_exact(&mut rest).await?;

                let mut upstream = TcpStream::connect(target).await?;
                client
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await?;
                tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
                Ok(())
            });
        }
    });
    addr
}

/// Forwards messages into a channel and answers friend requests with a
/// switchable decision.
pub struct TestDelegate {
    accept: AtomicBool,
    messages: mpsc::UnboundedSender<Message>,
}

impl TestDelegate {
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }
}

#[async_trait]
impl AppDelegate for TestDelegate {
    async fn on_message(&self, message: Message) {
        let _ = self.messages.send(message);
    }

    async fn on_friend_request(&self, _request: FriendRequest) -> bool {
        self.accept.load(Ordering::SeqCst)
    }
}

pub struct Node {
    pub app: Arc<App>,
    pub delegate: Arc<TestDelegate>,
    pub messages: mpsc::UnboundedReceiver<Message>,
    pub dir: tempfile::TempDir,
}

/// Spawn a node on loopback with a stub router and wait until the
/// services that matter here are up. Discovery may fail in sandboxed
/// environments without multicast; these tests inject peer records by
/// hand, so an errored discovery service is acceptable.
pub async fn spawn_node(name: &str, accept: bool) -> Node {
    spawn_node_with_router(name, accept, Arc::new(StubRouter::new())).await
}

pub async fn spawn_node_with_router(
    name: &str,
    accept: bool,
    router: Arc<dyn OverlayRouter>,
) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let delegate = Arc::new(TestDelegate {
        accept: AtomicBool::new(accept),
        messages: tx,
    });

    let app = Arc::new(
        App::with_router(
            AppConfig {
                base: Some(dir.path().to_path_buf()),
                name: Some(name.to_string()),
                ..AppConfig::default()
            },
            delegate.clone(),
            router,
        )
        .unwrap(),
    );
    app.start().await;
    wait_for_ready(&app).await;

    Node {
        app,
        delegate,
        messages: rx,
        dir,
    }
}

pub async fn wait_for_ready(app: &App) {
    let required = ["tor", "certificate", "friends", "ident", "cert", "talk", "connections"];
    wait_until("services to start", || {
        let states = app.service_states();
        required
            .iter()
            .all(|name| states.get(name) == Some(&ServiceStatus::Started))
    })
    .await;
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// `joiner` runs the pairing exchange against `host` (who must be set to
/// accept). Afterwards both sides know each other's loopback record, so
/// direct connections can come up in both directions.
pub async fn pair(joiner: &Node, host: &Node) {
    let host_record = host.app.advertisement().await.unwrap();
    joiner.app.observe_nearby(host_record.clone());

    let added = joiner.app.add_friend(&host_record).await.unwrap();
    assert!(added, "pairing was declined");

    let joiner_record = joiner.app.advertisement().await.unwrap();
    host.app.observe_nearby(joiner_record);
}

pub async fn recv_message(node: &mut Node) -> Message {
    tokio::time::timeout(Duration::from_secs(10), node.messages.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("message channel closed")
}
