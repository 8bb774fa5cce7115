//! Integration tests: client and storage nodes over real TCP sockets.
//!
//! Each test starts its nodes on ephemeral localhost ports, builds the
//! cluster configuration from the bound addresses and drives the client.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use famstore_cluster::protocol::{self, Header, Response, Status, HEADER_SIZE};
use famstore_cluster::{
    Client, ClientConfig, ClientError, ClusterConfig, Connector, Location, NodeServer, RetryPolicy,
    ServerHandle, TcpConnection, TcpConnector,
};
use famstore_core::{EngineConfig, EngineMetrics, KeyValueStore, MemoryManager, RadixTreeEngine};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Node {
    engine: Arc<RadixTreeEngine>,
    handle: ServerHandle,
}

impl Node {
    fn location(&self) -> Location {
        Location::new("127.0.0.1", self.handle.local_addr().port())
    }
}

fn start_node() -> Node {
    let mut config = EngineConfig::small();
    config.heap_size_bytes = 16 * 1024 * 1024;
    let engine = Arc::new(
        RadixTreeEngine::open(&MemoryManager::new(), config, None, Arc::new(EngineMetrics::new()))
            .unwrap(),
    );
    let handle = NodeServer::bind(Arc::clone(&engine), "127.0.0.1:0").unwrap().spawn().unwrap();
    Node { engine, handle }
}

fn start_cluster(n: usize) -> (Vec<Node>, ClusterConfig) {
    let nodes: Vec<Node> = (0..n).map(|_| start_node()).collect();
    let config = ClusterConfig::new(nodes.iter().map(Node::location).collect());
    (nodes, config)
}

fn fast_client_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// TCP connector that counts open attempts.
struct CountingConnector {
    inner: TcpConnector,
    opens: Arc<AtomicU32>,
}

impl Connector for CountingConnector {
    type Conn = TcpConnection;

    fn connect(&self, location: &Location) -> Result<TcpConnection, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(location)
    }
}

/// Node whose first connection answers its first request with a frame that
/// has a bad magic byte and a well-formed reply hidden in its body. Every
/// other request gets an honest `KeyNotFound`.
fn start_garbling_node() -> Location {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for (i, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || serve_scripted(stream, i == 0));
        }
    });
    Location::new("127.0.0.1", port)
}

fn serve_scripted(mut stream: TcpStream, mut garble: bool) {
    while let Ok(Some(req)) = protocol::read_request(&mut stream) {
        let reply = if garble {
            garble = false;
            let decoy = protocol::encode_response(&Response::value(&req, b"WRONG".to_vec())).unwrap();
            let bytes: [u8; HEADER_SIZE] = decoy[..HEADER_SIZE].try_into().unwrap();
            let mut header = Header::from_bytes(&bytes);
            header.magic = 0x82;
            header.total_body_len = decoy.len() as u32;
            let mut frame = header.to_bytes().to_vec();
            frame.extend_from_slice(&decoy);
            frame
        } else {
            protocol::encode_response(&Response::error(&req, Status::KeyNotFound, "Not found"))
                .unwrap()
        };
        if stream.write_all(&reply).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[test]
fn test_put_get_del_across_nodes() {
    let (nodes, config) = start_cluster(3);
    let client = Client::connect(&config, fast_client_config()).unwrap();

    for i in 0..200 {
        let key = format!("key{:03}", i);
        client.put(key.as_bytes(), format!("value{}", i).as_bytes()).unwrap();
    }
    for i in 0..200 {
        let key = format!("key{:03}", i);
        assert_eq!(client.get(key.as_bytes()).unwrap(), format!("value{}", i).as_bytes());
    }

    // Each key lives on exactly the node the ring names
    let mut per_node = vec![0usize; nodes.len()];
    for i in 0..200 {
        let key = format!("key{:03}", i);
        let owner = client.locate(key.as_bytes()).clone();
        for (idx, node) in nodes.iter().enumerate() {
            let held = node.engine.get(key.as_bytes()).is_ok();
            assert_eq!(held, node.location() == owner, "key {} misplaced", key);
            if held {
                per_node[idx] += 1;
            }
        }
    }
    assert!(per_node.iter().all(|&n| n > 0), "unused node: {:?}", per_node);

    client.del(b"key007").unwrap();
    assert_eq!(client.get(b"key007"), Err(ClientError::NotFound));
    assert_eq!(client.del(b"key007"), Err(ClientError::NotFound));
}

#[test]
fn test_server_side_size_errors_are_not_retried() {
    let (_nodes, config) = start_cluster(1);
    let opens = Arc::new(AtomicU32::new(0));
    let mut client_config = fast_client_config();
    // Let oversized values through the client so the node rejects them
    client_config.max_value_len = usize::MAX;
    let connector = CountingConnector {
        inner: TcpConnector::new(client_config.connect_timeout, client_config.io_timeout),
        opens: Arc::clone(&opens),
    };
    let client = Client::with_connector(&config, client_config, connector).unwrap();

    let big = vec![7u8; EngineConfig::small().max_value_len + 1];
    match client.put(b"big", &big) {
        Err(ClientError::Server { status, .. }) => {
            assert_eq!(status, famstore_cluster::protocol::Status::ValueTooLarge)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    // The connection stays usable
    client.put(b"small", b"ok").unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wipe_flushes_nodes() {
    let (nodes, config) = start_cluster(2);
    let client = Client::connect(&config, fast_client_config()).unwrap();
    for i in 0..50 {
        client.put(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    let flushed = client.wipe().unwrap();
    assert!(!flushed.is_empty());
    for node in &nodes {
        assert_eq!(node.engine.scan_iter(b"", true, b"", true).unwrap().count(), 0);
    }
}

#[test]
fn test_client_as_key_value_store() {
    let (_nodes, config) = start_cluster(2);
    let client = Client::connect(&config, fast_client_config()).unwrap();
    fn roundtrip<S: KeyValueStore>(store: &S) {
        store.put(b"generic", b"yes").unwrap();
        assert_eq!(store.get(b"generic").unwrap(), Some(b"yes".to_vec()));
        assert!(store.del(b"generic").unwrap());
        assert_eq!(store.get(b"generic").unwrap(), None);
    }
    roundtrip(&client);
}

#[test]
fn test_node_can_front_another_cluster() {
    // A node serving a client is a proxy; the server is generic over the store
    let (backend, config) = start_cluster(2);
    let proxy_store = Arc::new(Client::connect(&config, fast_client_config()).unwrap());
    let proxy = NodeServer::bind(proxy_store, "127.0.0.1:0").unwrap().spawn().unwrap();

    let front = ClusterConfig::new(vec![Location::new("127.0.0.1", proxy.local_addr().port())]);
    let client = Client::connect(&front, fast_client_config()).unwrap();
    client.put(b"via-proxy", b"hello").unwrap();
    assert_eq!(client.get(b"via-proxy").unwrap(), b"hello");

    let held: usize = backend.iter().filter(|n| n.engine.get(b"via-proxy").is_ok()).count();
    assert_eq!(held, 1);
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[test]
fn test_dead_node_fails_after_one_retry() {
    let (mut nodes, config) = start_cluster(1);
    let opens = Arc::new(AtomicU32::new(0));
    let client_config = fast_client_config();
    let connector = CountingConnector {
        inner: TcpConnector::new(client_config.connect_timeout, client_config.io_timeout),
        opens: Arc::clone(&opens),
    };
    let client = Client::with_connector(&config, client_config, connector).unwrap();

    client.put(b"k", b"v").unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // Stop the only node; the pooled connection is now dead
    let node = nodes.remove(0);
    let location = node.location();
    node.handle.shutdown();

    let err = client.get(b"k").unwrap_err();
    assert!(
        matches!(&err, ClientError::ServerUnreachable { location: l, attempts: 1 } if *l == location)
            || matches!(err, ClientError::Io { .. }),
        "unexpected {:?}",
        err
    );
    // The broken pooled connection plus at most one reopen
    assert!(opens.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_malformed_frame_drops_the_connection() {
    let config = ClusterConfig::new(vec![start_garbling_node()]);
    let opens = Arc::new(AtomicU32::new(0));
    let client_config = fast_client_config();
    let connector = CountingConnector {
        inner: TcpConnector::new(client_config.connect_timeout, client_config.io_timeout),
        opens: Arc::clone(&opens),
    };
    let client = Client::with_connector(&config, client_config, connector).unwrap();

    assert!(matches!(client.get(b"k"), Err(ClientError::Protocol { .. })));
    assert!(client.pool().is_empty());
    // The leftover bytes never reach a later request
    assert_eq!(client.get(b"k"), Err(ClientError::NotFound));
    assert_eq!(client.get(b"k"), Err(ClientError::NotFound));
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[test]
fn test_unreachable_without_pooled_connection() {
    // Reserve a port with nothing behind it
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let config = ClusterConfig::new(vec![Location::new("127.0.0.1", port)]);
    let opens = Arc::new(AtomicU32::new(0));
    let client_config = ClientConfig { connect: RetryPolicy::once(), ..fast_client_config() };
    let connector = CountingConnector {
        inner: TcpConnector::new(client_config.connect_timeout, client_config.io_timeout),
        opens: Arc::clone(&opens),
    };
    let client = Client::with_connector(&config, client_config, connector).unwrap();

    assert!(matches!(
        client.put(b"k", b"v"),
        Err(ClientError::ServerUnreachable { attempts: 1, .. })
    ));
    // One open per operation attempt
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn test_client_from_config_file() {
    let (_nodes, config) = start_cluster(2);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.json");
    config.save(&path).unwrap();

    let client = Client::from_config_file(&path).unwrap();
    assert_eq!(client.cluster().locations(), config.nodes.as_slice());
    client.put(b"from-file", b"1").unwrap();
    assert_eq!(client.get(b"from-file").unwrap(), b"1");
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cluster.json");
    std::fs::write(&path, r#"{"nodes": [{"host": "a", "port": 0}]}"#).unwrap();
    assert!(matches!(Client::from_config_file(&path), Err(ClientError::Config { .. })));
}
