//! Bridge configuration.
//!
//! Configuration is read from a toml file:
//!
//! ```toml
//! [bridge]
//! transport = "tcp"
//! host = "127.0.0.1"
//! port = "5000"
//! acknowledge_reset = false
//! peer_close_timeout_ms = 2000
//!
//! [bridge.retry]
//! max_attempts = 0    # retry forever
//! delay_ms = 1000
//!
//! [data]
//! port = "7000"
//!
//! [model]
//! resources = "resources"
//! multiple_address_files = false
//! ```
//!
//! Every field is optional.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util;
use crate::{DEFAULT_DATA_PORT, DEFAULT_RESOURCES_DIR, DEFAULT_TICK_PORT, LOCAL_HOST};

const TCP_TRANSPORT_NAME: &str = "tcp";
const UDP_TRANSPORT_NAME: &str = "udp";

/// Byte stream binding used to reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Tcp
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TransportKind::Tcp => TCP_TRANSPORT_NAME,
            TransportKind::Udp => UDP_TRANSPORT_NAME,
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransportKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            TCP_TRANSPORT_NAME => Ok(TransportKind::Tcp),
            UDP_TRANSPORT_NAME => Ok(TransportKind::Udp),
            _ => Err(Error::Other(format!("unknown transport: {}", s))),
        }
    }
}

/// How connection attempts are repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, `None` retries forever
    pub max_attempts: Option<u32>,
    /// Wait between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn forever(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    /// Whether another attempt may follow after `attempts` failed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Zero means unlimited
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: match self.max_attempts {
                0 => None,
                n => Some(n),
            },
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

/// Connection settings for a single channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub transport: TransportKind,
    pub host: String,
    /// Numeric port
    pub port: String,
    /// Echo the reset code back to the worker before closing
    pub acknowledge_reset: bool,
    /// How long to wait for the worker to close its side after a reset
    pub peer_close_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            host: LOCAL_HOST.to_string(),
            port: DEFAULT_TICK_PORT.to_string(),
            acknowledge_reset: false,
            peer_close_timeout_ms: 2000,
            retry: RetryConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn peer_close_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_close_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory holding the address documents, relative to the model root
    pub resources: PathBuf,
    /// Namespace address keys by document. Forced on when several
    /// documents are present.
    pub multiple_address_files: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            resources: PathBuf::from(DEFAULT_RESOURCES_DIR),
            multiple_address_files: false,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Step channel
    pub bridge: EndpointConfig,
    /// Optional value exchange channel
    pub data: Option<EndpointConfig>,
    pub model: ModelConfig,
}

impl FromStr for BridgeConfig {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl BridgeConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        util::deser_struct_from_path(path)
    }

    /// Adds a data channel on the default port, sharing the step channel's
    /// host and transport.
    pub fn with_default_data_channel(mut self) -> Self {
        self.data = Some(EndpointConfig {
            port: DEFAULT_DATA_PORT.to_string(),
            ..self.bridge.clone()
        });
        self
    }
}
