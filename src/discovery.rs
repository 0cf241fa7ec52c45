// LAN presence: advertise ourselves over zero-configuration DNS and
// collect the peers advertising back.
//
// The advertisement carries everything pairing needs before any
// connection exists: our certificate digest, sealing key, and the local
// port of the pairing receiver (plus its overlay service id once known,
// so blocked LANs can fall back to the overlay).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::certificate::{CertError, CertificateStore};
use crate::crypto::Digest;
use crate::util::{sanitize_name, CellPoisoned, Cells};

pub const SERVICE_TYPE: &str = "_slick._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery prerequisites unavailable")]
    NotReady,
    #[error(transparent)]
    Mdns(#[from] mdns_sd::Error),
    #[error(transparent)]
    Cert(#[from] CertError),
}

impl From<CellPoisoned> for DiscoveryError {
    fn from(_: CellPoisoned) -> Self {
        DiscoveryError::NotReady
    }
}

/// A peer seen on the LAN that has not (necessarily) become a friend.
#[derive(Debug, Clone)]
pub struct Nearby {
    /// Display name from the instance name.
    pub name: String,
    /// Full service instance name; removal events match on this.
    pub host: String,
    /// Overlay service id fronting the peer's pairing receiver, if
    /// advertised.
    pub cert_service_id: Option<String>,
    pub ip: IpAddr,
    /// The peer's certificate digest.
    pub digest: Digest,
    /// The peer's X25519 sealing public key.
    pub public_key: [u8; 32],
    /// Local port of the peer's pairing receiver.
    pub cert_port: u16,
    /// Local port of the peer's talk server.
    pub talk_port: u16,
}

impl Nearby {
    pub fn talk_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.talk_port)
    }

    pub fn cert_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.cert_port)
    }
}

impl std::fmt::Display for Nearby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -- {} {} {}",
            self.name,
            self.digest.to_hex(),
            self.ip,
            self.talk_port
        )
    }
}

/// The deduplicated set of nearby peers, keyed by digest.
struct NearbySet {
    own_digest: Mutex<Option<Digest>>,
    records: RwLock<Vec<Nearby>>,
}

impl NearbySet {
    fn new() -> Self {
        Self {
            own_digest: Mutex::new(None),
            records: RwLock::new(Vec::new()),
        }
    }

    fn set_own_digest(&self, digest: Digest) {
        *self.own_digest.lock() = Some(digest);
    }

    /// Insert or refresh a record. Our own advertisement is dropped, and
    /// a digest already present has its addressing updated in place
    /// rather than growing a twin entry.
    fn observe(&self, record: Nearby) {
        if *self.own_digest.lock() == Some(record.digest) {
            return;
        }
        let mut records = self.records.write();
        if let Some(existing) = records.iter_mut().find(|r| r.digest == record.digest) {
            *existing = record;
        } else {
            tracing::debug!("nearby: {record}");
            records.push(record);
        }
    }

    fn remove_host(&self, host: &str) {
        self.records.write().retain(|r| r.host != host);
    }

    fn all(&self) -> Vec<Nearby> {
        self.records.read().clone()
    }

    fn for_digest(&self, digest: &Digest) -> Option<Nearby> {
        self.records
            .read()
            .iter()
            .find(|r| r.digest == *digest)
            .cloned()
    }
}

/// What we put on the air.
#[derive(Clone)]
struct Advert {
    instance: String,
    hostname: String,
    port: u16,
    digest: Digest,
    public_key: [u8; 32],
    cert_port: u16,
}

/// Owns the zeroconf daemon handle and the currently-registered record.
struct Registrar {
    daemon: Mutex<Option<ServiceDaemon>>,
    advert: Mutex<Option<Advert>>,
    cert_host: Mutex<Option<String>>,
    registered: Mutex<Option<String>>,
}

impl Registrar {
    fn new() -> Self {
        Self {
            daemon: Mutex::new(None),
            advert: Mutex::new(None),
            cert_host: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    fn register(&self) -> Result<(), DiscoveryError> {
        let daemon = self.daemon.lock().clone().ok_or(DiscoveryError::NotReady)?;
        let advert = self.advert.lock().clone().ok_or(DiscoveryError::NotReady)?;

        let mut props: Vec<(String, String)> = vec![
            ("d".to_string(), advert.digest.to_hex()),
            ("pk".to_string(), hex::encode(advert.public_key)),
            ("cp".to_string(), advert.cert_port.to_string()),
        ];
        if let Some(cert_host) = self.cert_host.lock().clone() {
            props.push(("cs".to_string(), cert_host));
        }
        let prop_refs: Vec<(&str, &str)> = props
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &advert.instance,
            &advert.hostname,
            "",
            advert.port,
            &prop_refs[..],
        )?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        tracing::debug!("registered {fullname}");
        *self.registered.lock() = Some(fullname);
        Ok(())
    }

    fn unregister(&self) {
        let daemon = self.daemon.lock().clone();
        let fullname = self.registered.lock().take();
        if let (Some(daemon), Some(fullname)) = (daemon, fullname) {
            if let Err(e) = daemon.unregister(&fullname) {
                tracing::debug!("unregister {fullname}: {e}");
            }
        }
    }
}

pub struct Discovery {
    cells: Arc<Cells>,
    certificate: Arc<CertificateStore>,
    registrar: Arc<Registrar>,
    set: Arc<NearbySet>,
    restart_tx: mpsc::Sender<()>,
    restart_rx: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    pub(crate) fn new(cells: Arc<Cells>, certificate: Arc<CertificateStore>) -> Self {
        // Single-slot restart queue: coalesces bursts of re-register
        // requests into one restart.
        let (restart_tx, restart_rx) = mpsc::channel(1);
        Self {
            cells,
            certificate,
            registrar: Arc::new(Registrar::new()),
            set: Arc::new(NearbySet::new()),
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn start(&self) -> Result<(), DiscoveryError> {
        let name = self.cells.name.get().await?;
        let port = self.cells.talk_port.get().await?;
        let public_key = self.cells.public_key.get().await?;
        let cert_port = self.cells.cert_port.get().await?;
        let digest = self.certificate.digest().await?;

        self.set.set_own_digest(digest);

        let daemon = ServiceDaemon::new()?;
        *self.registrar.daemon.lock() = Some(daemon.clone());
        *self.registrar.advert.lock() = Some(Advert {
            instance: format!("{}.{}", name, digest.short_hex()),
            hostname: format!("{}-{}.local.", sanitize_name(&name), digest.short_hex()),
            port,
            digest,
            public_key,
            cert_port,
        });
        self.registrar.register()?;

        let mut tasks = self.tasks.lock();

        // Browse for peers
        let receiver = daemon.browse(SERVICE_TYPE)?;
        let set = self.set.clone();
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => match parse_service(&info) {
                        Some(record) => set.observe(record),
                        None => {
                            tracing::warn!("unusable advertisement {}", info.get_fullname())
                        }
                    },
                    ServiceEvent::ServiceRemoved(_ty, fullname) => set.remove_host(&fullname),
                    _ => {}
                }
            }
        }));

        // Re-registration worker, fed by the single-slot queue
        if let Some(mut restart_rx) = self.restart_rx.lock().take() {
            let registrar = self.registrar.clone();
            tasks.push(tokio::spawn(async move {
                while restart_rx.recv().await.is_some() {
                    registrar.unregister();
                    if let Err(e) = registrar.register() {
                        tracing::warn!("re-registration failed: {e}");
                    }
                }
            }));
        }

        // Pick up the pairing receiver's overlay service id once it exists
        let cells = self.cells.clone();
        let registrar = self.registrar.clone();
        let restart_tx = self.restart_tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Ok(cert_host) = cells.cert_service_id.get().await {
                *registrar.cert_host.lock() = Some(cert_host);
                let _ = restart_tx.try_send(());
            }
        }));

        Ok(())
    }

    pub(crate) async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registrar.unregister();
        if let Some(daemon) = self.registrar.daemon.lock().take() {
            let _ = daemon.shutdown();
        }
    }

    /// Queue a re-registration carrying the given cert overlay service id.
    pub fn set_cert_host(&self, cert_host: String) {
        *self.registrar.cert_host.lock() = Some(cert_host);
        let _ = self.restart_tx.try_send(());
    }

    /// Feed a peer record obtained out of band (manual addition), exactly
    /// as if it had been resolved from the LAN.
    pub fn observe(&self, record: Nearby) {
        self.set.observe(record);
    }

    /// Current nearby peers, in observation order.
    pub fn nearby(&self) -> Vec<Nearby> {
        self.set.all()
    }

    pub fn nearby_for_digest(&self, digest: &Digest) -> Option<Nearby> {
        self.set.for_digest(digest)
    }

    /// The record this node advertises, with a loopback address in place
    /// of the per-interface ones. Useful for out-of-band sharing.
    pub(crate) async fn local_record(&self) -> Result<Nearby, DiscoveryError> {
        let name = self.cells.name.get().await?;
        let digest = self.certificate.digest().await?;
        Ok(Nearby {
            host: format!("{}.{}.{}", name, digest.short_hex(), SERVICE_TYPE),
            name,
            cert_service_id: self.cells.cert_service_id.try_get(),
            ip: IpAddr::from([127, 0, 0, 1]),
            digest,
            public_key: self.cells.public_key.get().await?,
            cert_port: self.cells.cert_port.get().await?,
            talk_port: self.cells.talk_port.get().await?,
        })
    }
}

fn parse_service(info: &ServiceInfo) -> Option<Nearby> {
    let fullname = info.get_fullname();
    let instance = fullname.strip_suffix(SERVICE_TYPE)?.trim_end_matches('.');
    let name = match instance.rsplit_once('.') {
        Some((name, _digest_prefix)) => name,
        None => instance,
    };

    let digest = Digest::from_hex(info.get_property_val_str("d")?)?;
    let public_key: [u8; 32] = hex::decode(info.get_property_val_str("pk")?)
        .ok()?
        .try_into()
        .ok()?;
    let cert_port: u16 = info.get_property_val_str("cp")?.parse().ok()?;
    let cert_service_id = info.get_property_val_str("cs").map(str::to_string);
    let ip = info.get_addresses().iter().copied().find(IpAddr::is_ipv4)?;

    Some(Nearby {
        name: name.to_string(),
        host: fullname.to_string(),
        cert_service_id,
        ip,
        digest,
        public_key,
        cert_port,
        talk_port: info.get_port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, digest_seed: &[u8], ip: [u8; 4], talk_port: u16) -> Nearby {
        Nearby {
            name: name.to_string(),
            host: format!("{name}.aaaaaa.{SERVICE_TYPE}"),
            cert_service_id: None,
            ip: IpAddr::from(ip),
            digest: Digest::of(digest_seed),
            public_key: [1u8; 32],
            cert_port: 1000,
            talk_port,
        }
    }

    #[test]
    fn test_own_digest_filtered() {
        let set = NearbySet::new();
        set.set_own_digest(Digest::of(b"me"));

        set.observe(record("me", b"me", [192, 168, 1, 2], 9000));
        assert!(set.all().is_empty());

        set.observe(record("peer", b"peer", [192, 168, 1, 3], 9001));
        assert_eq!(set.all().len(), 1);
    }

    #[test]
    fn test_reobservation_updates_in_place() {
        let set = NearbySet::new();
        set.set_own_digest(Digest::of(b"me"));

        set.observe(record("peer", b"peer", [192, 168, 1, 3], 9001));
        // Same peer shows up again on a different interface and port
        set.observe(record("peer", b"peer", [10, 0, 0, 7], 9002));

        let all = set.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip, IpAddr::from([10, 0, 0, 7]));
        assert_eq!(all[0].talk_port, 9002);
    }

    #[test]
    fn test_remove_by_host() {
        let set = NearbySet::new();
        set.observe(record("peer", b"peer", [192, 168, 1, 3], 9001));

        set.remove_host(&format!("other.aaaaaa.{SERVICE_TYPE}"));
        assert_eq!(set.all().len(), 1);

        set.remove_host(&format!("peer.aaaaaa.{SERVICE_TYPE}"));
        assert!(set.all().is_empty());
    }

    #[test]
    fn test_parse_service_roundtrip() {
        let digest = Digest::of(b"peer cert");
        let props = [
            ("d", digest.to_hex()),
            ("pk", hex::encode([5u8; 32])),
            ("cp", "4242".to_string()),
            ("cs", "certserviceid".to_string()),
        ];
        let prop_refs: Vec<(&str, &str)> =
            props.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "bob.abc123",
            "bob-abc123.local.",
            "192.168.1.9",
            9100,
            &prop_refs[..],
        )
        .unwrap();

        let record = parse_service(&info).unwrap();
        assert_eq!(record.name, "bob");
        assert_eq!(record.digest, digest);
        assert_eq!(record.public_key, [5u8; 32]);
        assert_eq!(record.cert_port, 4242);
        assert_eq!(record.talk_port, 9100);
        assert_eq!(record.cert_service_id.as_deref(), Some("certserviceid"));
        assert_eq!(record.ip, IpAddr::from([192, 168, 1, 9]));
    }

    #[test]
    fn test_parse_service_rejects_missing_digest() {
        let props = [("pk", hex::encode([5u8; 32]))];
        let prop_refs: Vec<(&str, &str)> =
            props.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "bob.abc123",
            "bob-abc123.local.",
            "192.168.1.9",
            9100,
            &prop_refs[..],
        )
        .unwrap();
        assert!(parse_service(&info).is_none());
    }
}
