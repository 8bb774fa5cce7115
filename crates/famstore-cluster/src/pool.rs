//! Lazily opened connections, at most one per node
//!
//! The pool map's mutex guards membership only. Each connection carries its
//! own mutex so one request at a time uses it while requests to other nodes
//! proceed.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{Location, ResourceName};
use crate::connection::Connector;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryPolicy;
use crate::ring::Cluster;

/// Shared handle to one pooled connection.
pub type PooledConnection<C> = Arc<Mutex<<C as Connector>::Conn>>;

/// Connection pool routed by the cluster ring.
pub struct ConnectionPool<C: Connector> {
    cluster: Cluster,
    connector: C,
    connect_policy: RetryPolicy,
    conns: Mutex<HashMap<Location, PooledConnection<C>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(cluster: Cluster, connector: C, connect_policy: RetryPolicy) -> Self {
        Self {
            cluster,
            connector,
            connect_policy,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connection to the node owning `name`, opened if not pooled yet.
    pub fn get_connection(&self, name: &ResourceName) -> ClientResult<(Location, PooledConnection<C>)> {
        let location = self.cluster.locate(name).clone();
        let conn = self.connection_to(&location)?;
        Ok((location, conn))
    }

    /// Pooled connection to `location`, opened under the connect policy.
    pub fn connection_to(&self, location: &Location) -> ClientResult<PooledConnection<C>> {
        if let Some(conn) = self.conns.lock().get(location) {
            return Ok(Arc::clone(conn));
        }

        // Open outside the map lock; a racing opener may win the slot
        let opened = self
            .connect_policy
            .run(|_| self.connector.connect(location), ClientError::is_retryable)
            .map_err(|e| {
                warn!(%location, error = %e, "connect failed");
                match e {
                    ClientError::Io { .. } => ClientError::ServerUnreachable {
                        location: location.clone(),
                        attempts: self.connect_policy.max_attempts.max(1),
                    },
                    other => other,
                }
            })?;

        let mut conns = self.conns.lock();
        let conn = conns
            .entry(location.clone())
            .or_insert_with(|| {
                debug!(%location, "pooled new connection");
                Arc::new(Mutex::new(opened))
            });
        Ok(Arc::clone(conn))
    }

    /// Drop the pooled connection to `location`; the next use reopens it.
    pub fn evict(&self, location: &Location) {
        if self.conns.lock().remove(location).is_some() {
            debug!(%location, "evicted connection");
        }
    }

    /// Locations with an open pooled connection, sorted.
    pub fn pooled_locations(&self) -> Vec<Location> {
        let mut locs: Vec<Location> = self.conns.lock().keys().cloned().collect();
        locs.sort();
        locs
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::connection::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullConn;

    impl Connection for NullConn {
        fn get(&mut self, _key: &[u8]) -> ClientResult<Option<Vec<u8>>> { Ok(None) }
        fn set(&mut self, _key: &[u8], _value: &[u8]) -> ClientResult<()> { Ok(()) }
        fn delete(&mut self, _key: &[u8]) -> ClientResult<bool> { Ok(false) }
        fn flush(&mut self) -> ClientResult<()> { Ok(()) }
        fn version(&mut self) -> ClientResult<String> { Ok("null".into()) }
    }

    /// Counts opens; refuses all of them when `refuse` is set.
    struct CountingConnector {
        opens: AtomicU32,
        refuse: bool,
    }

    impl Connector for CountingConnector {
        type Conn = NullConn;

        fn connect(&self, location: &Location) -> ClientResult<NullConn> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(ClientError::io_at(
                    location,
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                ));
            }
            Ok(NullConn)
        }
    }

    fn pool(refuse: bool, connect: RetryPolicy) -> ConnectionPool<CountingConnector> {
        let config = ClusterConfig::new(vec![Location::new("a", 1), Location::new("b", 2)]);
        ConnectionPool::new(
            Cluster::new(&config).unwrap(),
            CountingConnector { opens: AtomicU32::new(0), refuse },
            connect,
        )
    }

    #[test]
    fn test_reuses_pooled_connection() {
        let p = pool(false, RetryPolicy::once());
        let name = ResourceName::from("key");
        let (loc1, c1) = p.get_connection(&name).unwrap();
        let (loc2, c2) = p.get_connection(&name).unwrap();
        assert_eq!(loc1, loc2);
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(p.connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(p.pooled_locations(), vec![loc1]);
    }

    #[test]
    fn test_evict_forces_reopen() {
        let p = pool(false, RetryPolicy::once());
        let name = ResourceName::from("key");
        let (loc, _) = p.get_connection(&name).unwrap();
        p.evict(&loc);
        assert!(p.is_empty());
        p.get_connection(&name).unwrap();
        assert_eq!(p.connector.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unreachable_after_connect_attempts() {
        let p = pool(true, RetryPolicy::with_retries(2));
        let err = p.get_connection(&ResourceName::from("key")).err().unwrap();
        assert!(matches!(err, ClientError::ServerUnreachable { attempts: 3, .. }));
        assert_eq!(p.connector.opens.load(Ordering::SeqCst), 3);
        assert!(p.is_empty());
    }
}
