//! Cluster client: routes each key to its node and fails over once
//!
//! An operation resolves the owning node, takes (or opens) the pooled
//! connection and runs the command. An I/O or protocol failure evicts the
//! connection. I/O failures are then retried from the top under the operation
//! retry policy (one retry by default). Misses and server-reported failures
//! are returned immediately. There is no fallback to another node: a key
//! lives on exactly one location.

use std::path::Path;

use tracing::{info, warn};

use famstore_core::KeyValueStore;

use crate::config::{ClientConfig, ClusterConfig, Location, ResourceName};
use crate::connection::{Connection, Connector, TcpConnector};
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;
use crate::ring::Cluster;

/// Client for a FamStore cluster.
pub struct Client<C: Connector = TcpConnector> {
    pool: ConnectionPool<C>,
    config: ClientConfig,
}

impl Client<TcpConnector> {
    /// Client over TCP for a validated cluster configuration.
    pub fn connect(cluster: &ClusterConfig, config: ClientConfig) -> ClientResult<Self> {
        let connector = TcpConnector::new(config.connect_timeout, config.io_timeout);
        Self::with_connector(cluster, config, connector)
    }

    /// Load the cluster file and build a TCP client with default settings.
    pub fn from_config_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        Self::connect(&ClusterConfig::load(path)?, ClientConfig::default())
    }
}

impl<C: Connector> Client<C> {
    pub fn with_connector(cluster: &ClusterConfig, config: ClientConfig, connector: C) -> ClientResult<Self> {
        let cluster = Cluster::new(cluster)?;
        info!(nodes = cluster.locations().len(), "cluster client ready");
        Ok(Self {
            pool: ConnectionPool::new(cluster, connector, config.connect),
            config,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        self.pool.cluster()
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Node that owns `key`.
    pub fn locate(&self, key: &[u8]) -> &Location {
        self.cluster().locate(&ResourceName::new(key))
    }

    fn check_key(&self, key: &[u8]) -> ClientResult<()> {
        if key.len() > self.config.max_key_len {
            return Err(ClientError::KeyTooLong { len: key.len(), max: self.config.max_key_len });
        }
        Ok(())
    }

    /// Run `op` on the connection owning `key`, with failover.
    fn run<T>(&self, key: &[u8], op: impl Fn(&mut C::Conn) -> ClientResult<T>) -> ClientResult<T> {
        let name = ResourceName::new(key);
        self.config.operation.run(
            |_| {
                let (location, conn) = self.pool.get_connection(&name)?;
                let result = op(&mut conn.lock());
                if let Err(e) = &result {
                    if e.poisons_connection() {
                        warn!(%location, error = %e, "connection failed, evicting");
                        self.pool.evict(&location);
                    }
                }
                result
            },
            ClientError::is_retryable,
        )
    }

    /// Store `value` under `key` on its node.
    pub fn put(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        self.check_key(key)?;
        if value.len() > self.config.max_value_len {
            return Err(ClientError::ValueTooLong { len: value.len(), max: self.config.max_value_len });
        }
        self.run(key, |conn| conn.set(key, value))
    }

    /// Read `key` from its node; `NotFound` when absent.
    pub fn get(&self, key: &[u8]) -> ClientResult<Vec<u8>> {
        self.check_key(key)?;
        self.run(key, |conn| conn.get(key))?.ok_or(ClientError::NotFound)
    }

    /// Delete `key` on its node; `NotFound` when absent.
    pub fn del(&self, key: &[u8]) -> ClientResult<()> {
        self.check_key(key)?;
        if self.run(key, |conn| conn.delete(key))? {
            Ok(())
        } else {
            Err(ClientError::NotFound)
        }
    }

    /// Flush every node this client currently holds a connection to.
    ///
    /// Returns the locations flushed.
    pub fn wipe(&self) -> ClientResult<Vec<Location>> {
        let locations = self.pool.pooled_locations();
        for location in &locations {
            let conn = self.pool.connection_to(location)?;
            let result = conn.lock().flush();
            if let Err(e) = result {
                if e.poisons_connection() {
                    self.pool.evict(location);
                }
                return Err(e);
            }
        }
        info!(nodes = locations.len(), "wiped cluster");
        Ok(locations)
    }

    /// Log the routing ring.
    pub fn print_cluster(&self) {
        self.cluster().print();
    }
}

impl<C: Connector> KeyValueStore for Client<C> {
    type Error = ClientError;

    fn put(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        Client::put(self, key, value)
    }

    fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match Client::get(self, key) {
            Ok(value) => Ok(Some(value)),
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn del(&self, key: &[u8]) -> ClientResult<bool> {
        match Client::del(self, key) {
            Ok(()) => Ok(true),
            Err(ClientError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn clear(&self) -> ClientResult<()> {
        self.wipe().map(|_| ())
    }

    fn max_key_len(&self) -> usize {
        self.config.max_key_len
    }

    fn max_val_len(&self) -> usize {
        self.config.max_value_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// In-memory node shared by every connection to it.
    #[derive(Default)]
    struct Node {
        data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
        /// Commands that fail with a connection reset before being applied
        fail_next: AtomicU32,
        /// Replies that arrive as malformed frames
        garble_next: AtomicU32,
    }

    struct MemConn {
        node: Arc<Node>,
    }

    impl MemConn {
        fn check(&self) -> ClientResult<()> {
            let pending = self.node.fail_next.load(Ordering::SeqCst);
            if pending > 0 {
                self.node.fail_next.store(pending - 1, Ordering::SeqCst);
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
            }
            let garbled = self.node.garble_next.load(Ordering::SeqCst);
            if garbled > 0 {
                self.node.garble_next.store(garbled - 1, Ordering::SeqCst);
                return Err(ClientError::Protocol { reason: "bad magic 0x82".into() });
            }
            Ok(())
        }
    }

    impl Connection for MemConn {
        fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
            self.check()?;
            Ok(self.node.data.lock().get(key).cloned())
        }
        fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
            self.check()?;
            self.node.data.lock().insert(key.to_vec(), value.to_vec());
            Ok(())
        }
        fn delete(&mut self, key: &[u8]) -> ClientResult<bool> {
            self.check()?;
            Ok(self.node.data.lock().remove(key).is_some())
        }
        fn flush(&mut self) -> ClientResult<()> {
            self.check()?;
            self.node.data.lock().clear();
            Ok(())
        }
        fn version(&mut self) -> ClientResult<String> {
            Ok("mem".into())
        }
    }

    struct MemConnector {
        nodes: HashMap<Location, Arc<Node>>,
        opens: AtomicU32,
    }

    impl Connector for MemConnector {
        type Conn = MemConn;

        fn connect(&self, location: &Location) -> ClientResult<MemConn> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let node = self.nodes.get(location).cloned().ok_or(ClientError::Io {
                location: Some(location.clone()),
                kind: std::io::ErrorKind::ConnectionRefused,
                message: "refused".into(),
            })?;
            Ok(MemConn { node })
        }
    }

    fn client(n: u16) -> Client<MemConnector> {
        let locs: Vec<Location> = (0..n).map(|i| Location::new("mem", 1 + i)).collect();
        let nodes = locs.iter().map(|l| (l.clone(), Arc::new(Node::default()))).collect();
        Client::with_connector(
            &ClusterConfig::new(locs),
            ClientConfig::default(),
            MemConnector { nodes, opens: AtomicU32::new(0) },
        )
        .unwrap()
    }

    fn node_of<'a>(c: &'a Client<MemConnector>, key: &[u8]) -> &'a Arc<Node> {
        &c.pool.connector().nodes[c.locate(key)]
    }

    #[test]
    fn test_put_get_del() {
        let c = client(3);
        c.put(b"k", b"v").unwrap();
        assert_eq!(c.get(b"k").unwrap(), b"v");
        c.del(b"k").unwrap();
        assert_eq!(c.get(b"k"), Err(ClientError::NotFound));
        assert_eq!(c.del(b"k"), Err(ClientError::NotFound));
    }

    #[test]
    fn test_keys_land_on_owner() {
        let c = client(3);
        for i in 0..100 {
            let key = format!("key{}", i);
            c.put(key.as_bytes(), b"v").unwrap();
            assert!(node_of(&c, key.as_bytes()).data.lock().contains_key(key.as_bytes()));
        }
    }

    #[test]
    fn test_single_failure_is_retried() {
        let c = client(2);
        c.put(b"k", b"v1").unwrap();
        node_of(&c, b"k").fail_next.store(1, Ordering::SeqCst);
        c.put(b"k", b"v2").unwrap();
        assert_eq!(c.get(b"k").unwrap(), b"v2");
        // First open plus one reopen after eviction
        assert_eq!(c.pool.connector().opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_second_failure_is_returned() {
        let c = client(2);
        node_of(&c, b"k").fail_next.store(2, Ordering::SeqCst);
        assert!(matches!(c.put(b"k", b"v"), Err(ClientError::Io { .. })));
        assert!(c.pool.is_empty());
    }

    #[test]
    fn test_malformed_reply_evicts_without_retry() {
        let c = client(2);
        c.put(b"k", b"v").unwrap();
        node_of(&c, b"k").garble_next.store(1, Ordering::SeqCst);

        assert!(matches!(c.get(b"k"), Err(ClientError::Protocol { .. })));
        assert!(c.pool.is_empty());
        assert_eq!(c.pool.connector().opens.load(Ordering::SeqCst), 1);

        // The next call gets a fresh connection and the real value
        assert_eq!(c.get(b"k").unwrap(), b"v");
        assert_eq!(c.pool.connector().opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wipe_evicts_garbled_connection() {
        let c = client(1);
        c.put(b"k", b"v").unwrap();
        node_of(&c, b"k").garble_next.store(1, Ordering::SeqCst);
        assert!(matches!(c.wipe(), Err(ClientError::Protocol { .. })));
        assert!(c.pool.is_empty());
    }

    #[test]
    fn test_size_limits_checked_locally() {
        let c = client(1);
        assert!(matches!(c.put(&[b'k'; 41], b"v"), Err(ClientError::KeyTooLong { .. })));
        let big = vec![0u8; c.config().max_value_len + 1];
        assert!(matches!(c.put(b"k", &big), Err(ClientError::ValueTooLong { .. })));
        assert_eq!(c.pool.connector().opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wipe_flushes_pooled_nodes() {
        let c = client(3);
        for i in 0..30 {
            c.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        let flushed = c.wipe().unwrap();
        assert_eq!(flushed, c.pool.pooled_locations());
        for i in 0..30 {
            assert_eq!(c.get(format!("k{}", i).as_bytes()), Err(ClientError::NotFound));
        }
    }
}
