//! Storage node server
//!
//! Serves any [`KeyValueStore`] over the memcached binary protocol. One
//! accept thread polls a non-blocking listener; each connection gets its own
//! thread handling requests in order.

use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use famstore_core::{ErrorKind, KeyValueStore, StoreError};

use crate::error::{ClientError, ClientResult};
use crate::protocol::{read_request, write_response, Opcode, Request, Response, Status};

/// How often idle threads check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wire status for a store error.
fn status_for(kind: ErrorKind) -> Status {
    match kind {
        ErrorKind::NotFound => Status::KeyNotFound,
        ErrorKind::KeyTooLong => Status::InvalidArguments,
        ErrorKind::ValueTooLong => Status::ValueTooLarge,
        ErrorKind::OutOfMemory => Status::OutOfMemory,
        ErrorKind::Unavailable | ErrorKind::Other => Status::InternalError,
    }
}

/// Execute one request against `store`.
pub fn handle_request<S: KeyValueStore>(store: &S, req: &Request) -> Response {
    let fail = |e: S::Error| {
        let status = status_for(e.kind());
        if status == Status::InternalError || status == Status::OutOfMemory {
            warn!(opcode = ?req.opcode, error = %e, "request failed");
        }
        Response::error(req, status, &e.to_string())
    };

    match req.opcode {
        Opcode::Get => match store.get(&req.key) {
            Ok(Some(value)) => Response::value(req, value),
            Ok(None) => Response::error(req, Status::KeyNotFound, "Not found"),
            Err(e) => fail(e),
        },
        Opcode::Set => {
            if req.extras.len() != 8 {
                return Response::error(req, Status::InvalidArguments, "SET requires 8 bytes of extras");
            }
            match store.put(&req.key, &req.value) {
                Ok(()) => Response::ok(req),
                Err(e) => fail(e),
            }
        }
        Opcode::Delete => match store.del(&req.key) {
            Ok(true) => Response::ok(req),
            Ok(false) => Response::error(req, Status::KeyNotFound, "Not found"),
            Err(e) => fail(e),
        },
        Opcode::Flush => match store.clear() {
            Ok(()) => Response::ok(req),
            Err(e) => fail(e),
        },
        Opcode::Noop => Response::ok(req),
        Opcode::Version => Response::value(req, env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
    }
}

/// A storage node bound to a listening socket.
pub struct NodeServer<S: KeyValueStore + 'static> {
    store: Arc<S>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl<S: KeyValueStore + 'static> NodeServer<S> {
    /// Bind `addr` (e.g. `"0.0.0.0:11211"`, port 0 for any).
    pub fn bind(store: Arc<S>, addr: impl ToSocketAddrs) -> ClientResult<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self { store, listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving on background threads.
    pub fn spawn(self) -> ClientResult<ServerHandle> {
        self.listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let local_addr = self.local_addr;

        let thread = thread::Builder::new()
            .name("famstore-accept".to_string())
            .spawn(move || accept_loop(self.listener, self.store, shutdown_clone))?;

        info!(addr = %local_addr, "storage node listening");
        Ok(ServerHandle { local_addr, shutdown, thread: Some(thread) })
    }

    /// Serve on the calling thread until the process exits.
    pub fn run(self) -> ClientResult<()> {
        let handle = self.spawn()?;
        handle.wait();
        Ok(())
    }
}

/// Handle to a running node server.
/// Dropping this handle stops accepting and joins the connection threads.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and wait for its threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Block until the accept thread exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop<S: KeyValueStore + 'static>(
    listener: TcpListener,
    store: Arc<S>,
    shutdown: Arc<AtomicBool>,
) {
    let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let store = Arc::clone(&store);
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("famstore-conn-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, store.as_ref(), &shutdown) {
                            debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => warn!(%peer, error = %e, "cannot spawn connection thread"),
                }
                workers.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    info!("storage node stopped");
}

/// Wait for the next request to start arriving. `Ok(false)` on shutdown or
/// a closed peer.
fn await_request(stream: &TcpStream, shutdown: &AtomicBool) -> io::Result<bool> {
    let mut peek_buf = [0u8; 1];
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }
        match stream.peek(&mut peek_buf) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn serve_connection<S: KeyValueStore>(
    stream: TcpStream,
    store: &S,
    shutdown: &AtomicBool,
) -> ClientResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream.try_clone()?);

    loop {
        if reader.buffer().is_empty() && !await_request(&stream, shutdown)? {
            return Ok(());
        }
        // A frame has started: give the rest of it a generous deadline
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let req = match read_request(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e @ ClientError::Protocol { .. }) => {
                warn!(error = %e, "dropping connection after malformed request");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        stream.set_read_timeout(Some(POLL_INTERVAL))?;

        let resp = handle_request(store, &req);
        write_response(&mut writer, &resp)?;
    }
}
