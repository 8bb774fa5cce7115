//! Cluster and client configuration
//!
//! The cluster file is JSON:
//!
//! ```json
//! {
//!   "nodes": [
//!     { "host": "10.0.0.1", "port": 11211 },
//!     { "host": "10.0.0.2", "port": 11211 }
//!   ],
//!   "virtual_nodes": 64
//! }
//! ```
//!
//! An invalid configuration is fatal at node and client startup.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use famstore_core::MAX_KEY_LEN;

use crate::error::{ClientError, ClientResult};
use crate::retry::RetryPolicy;

/// Default ring points per node.
pub const DEFAULT_VIRTUAL_NODES: u32 = 64;

/// Upper bound on ring points per node.
pub const MAX_VIRTUAL_NODES: u32 = 4096;

/// Network address of one storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub host: String,
    pub port: u16,
}

impl Location {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Location {
    type Err = ClientError;

    /// Parse `host:port`.
    fn from_str(s: &str) -> ClientResult<Self> {
        let bad = || ClientError::Config { reason: format!("expected host:port, got {:?}", s) };
        let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
        let port = port.parse::<u16>().map_err(|_| bad())?;
        if host.is_empty() {
            return Err(bad());
        }
        Ok(Self::new(host, port))
    }
}

/// The hashable projection of a key used for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName(Vec<u8>);

impl ResourceName {
    pub fn new(key: &[u8]) -> Self {
        Self(key.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

fn default_virtual_nodes() -> u32 {
    DEFAULT_VIRTUAL_NODES
}

/// Static cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Storage nodes; the index is the node id used by `famstore-node --node`
    pub nodes: Vec<Location>,
    /// Ring points contributed by each node
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<Location>) -> Self {
        Self { nodes, virtual_nodes: DEFAULT_VIRTUAL_NODES }
    }

    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ClientError::Config {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> ClientResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate().map_err(|reason| ClientError::Config { reason })?;
        Ok(config)
    }

    pub fn to_json(&self) -> ClientResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the configuration as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> ClientResult<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|e| ClientError::Config {
            reason: format!("cannot write {}: {}", path.display(), e),
        })
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("cluster must list at least one node".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.host.trim().is_empty() {
                return Err(format!("node {} has an empty host", i));
            }
            if node.port == 0 {
                return Err(format!("node {} ({}) has port 0", i, node));
            }
            if self.nodes[..i].contains(node) {
                return Err(format!("node {} duplicates {}", i, node));
            }
        }
        if self.virtual_nodes == 0 || self.virtual_nodes > MAX_VIRTUAL_NODES {
            return Err(format!("virtual_nodes must be in [1, {}]", MAX_VIRTUAL_NODES));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Client-side tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts to open a connection to one node
    pub connect: RetryPolicy,
    /// Attempts per put/get/del, each on a freshly resolved connection
    pub operation: RetryPolicy,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Socket read/write timeout
    pub io_timeout: Duration,
    /// Longest key sent
    pub max_key_len: usize,
    /// Longest value sent
    pub max_value_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: RetryPolicy::once(),
            operation: RetryPolicy::with_retries(1),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(5),
            max_key_len: MAX_KEY_LEN,
            max_value_len: 1024 * 1024,
        }
    }
}
