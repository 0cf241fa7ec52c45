// Embedding configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for an [`crate::App`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Working directory holding `ident`, `server.crt`, `friends/`, `tor/`
    /// and `slick.log`. `None` means an ephemeral temp directory that is
    /// deleted on shutdown.
    pub base: Option<PathBuf>,
    /// Display name, required the first time an identity is provisioned.
    /// Ignored once `ident` exists.
    pub name: Option<String>,
    #[serde(default)]
    pub router: RouterConfig,
}

/// How to reach the overlay router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouterConfig {
    /// Spawn a router process of our own under `base/tor`.
    Spawn {
        /// Router binary to execute.
        binary: String,
        /// How long to wait for the overlay circuit bootstrap.
        bootstrap_timeout_secs: u64,
    },
    /// Adopt an already-running router.
    Adopt {
        /// Control listener address.
        control: SocketAddr,
        /// Path to the router's control auth cookie.
        cookie: PathBuf,
        /// Outbound SOCKS5 listener address.
        socks: SocketAddr,
    },
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig::Spawn {
            binary: "tor".to_string(),
            bootstrap_timeout_secs: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_router_spawns_tor() {
        match RouterConfig::default() {
            RouterConfig::Spawn { binary, .. } => assert_eq!(binary, "tor"),
            other => panic!("unexpected default: {other:?}"),
        }
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = AppConfig {
            base: Some(PathBuf::from("/tmp/slick")),
            name: Some("alice".to_string()),
            router: RouterConfig::Adopt {
                control: "127.0.0.1:9051".parse().unwrap(),
                cookie: PathBuf::from("/run/tor/control.authcookie"),
                socks: "127.0.0.1:9050".parse().unwrap(),
            },
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name.as_deref(), Some("alice"));
        match back.router {
            RouterConfig::Adopt { socks, .. } => {
                assert_eq!(socks, "127.0.0.1:9050".parse().unwrap())
            }
            other => panic!("unexpected router: {other:?}"),
        }
    }
}
