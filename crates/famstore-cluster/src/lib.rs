//! FamStore Cluster: sharding, client failover and storage nodes
//!
//! Keys are spread over storage nodes by a consistent-hash ring built from a
//! static JSON configuration. Each node runs a `famstore_core` engine behind
//! the memcached binary protocol; the client keeps one pooled connection per
//! node and retries once on a connection failure.
//!
//! # Architecture
//!
//! - **Routing**: `Cluster::locate` maps a key to exactly one `Location`
//! - **Client**: `Client::put/get/del` over a `ConnectionPool`, bounded by
//!   `RetryPolicy`
//! - **Node**: `NodeServer` serves any `KeyValueStore` over TCP

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod ring;
pub mod server;

// Re-export key types for convenience
pub use client::Client;
pub use config::{ClientConfig, ClusterConfig, Location, ResourceName};
pub use connection::{Connection, Connector, TcpConnection, TcpConnector};
pub use error::{ClientError, ClientResult};
pub use pool::ConnectionPool;
pub use retry::RetryPolicy;
pub use ring::Cluster;
pub use server::{handle_request, NodeServer, ServerHandle};
