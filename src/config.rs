//! Configuration loading.

use crate::client::ClientOptions;
use crate::error::ConfigError;
use crate::session::SessionConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Bridge configuration. Every section and field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub xmpp: XmppConfig,
    pub tracking: TrackingConfig,
}

/// WebSocket listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind to (e.g., "127.0.0.1:5281").
    pub address: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 5281)),
        }
    }
}

/// Outbound XMPP connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    /// Domain appended to login identities without one.
    pub default_host: Option<String>,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Skip TLS certificate verification. Development only.
    pub dangerous_insecure_tls: bool,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            default_host: None,
            keepalive_secs: 10,
            connect_timeout_secs: 15,
            dangerous_insecure_tls: false,
        }
    }
}

/// Reply tracking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// 0 keeps tracked stanzas until their reply arrives.
    pub reply_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: 120,
            sweep_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            keepalive: Duration::from_secs(self.xmpp.keepalive_secs),
            connect_timeout: Duration::from_secs(self.xmpp.connect_timeout_secs),
            insecure_tls: self.xmpp.dangerous_insecure_tls,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_host: self.xmpp.default_host.clone(),
            reply_timeout: match self.tracking.reply_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            sweep_interval: Duration::from_secs(self.tracking.sweep_interval_secs),
            ..SessionConfig::default()
        }
    }
}
