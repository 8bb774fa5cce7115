//! Connections to storage nodes
//!
//! [`Connection`] is the per-node command surface the client drives;
//! [`Connector`] opens them. The TCP implementation speaks the memcached
//! binary protocol. Tests substitute in-process connectors.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::config::Location;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{read_response, write_request, Opcode, Request, Response, Status};

/// Commands against one storage node.
pub trait Connection: Send {
    /// `Ok(None)` when the node does not hold the key.
    fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()>;

    /// `Ok(false)` when the node did not hold the key.
    fn delete(&mut self, key: &[u8]) -> ClientResult<bool>;

    /// Remove every key on the node.
    fn flush(&mut self) -> ClientResult<()>;

    /// Server version string.
    fn version(&mut self) -> ClientResult<String>;
}

/// Opens connections to storage nodes.
pub trait Connector: Send + Sync {
    type Conn: Connection;

    fn connect(&self, location: &Location) -> ClientResult<Self::Conn>;
}

/// Opens [`TcpConnection`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self { connect_timeout, io_timeout }
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(&self, location: &Location) -> ClientResult<TcpConnection> {
        TcpConnection::open(location, self.connect_timeout, self.io_timeout)
    }
}

/// One TCP connection speaking the memcached binary protocol.
pub struct TcpConnection {
    location: Location,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    next_opaque: u32,
}

impl TcpConnection {
    /// Resolve `location` and connect to the first address that answers.
    pub fn open(
        location: &Location,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> ClientResult<Self> {
        let io_err = |e| ClientError::io_at(location, e);
        let addrs = (location.host.as_str(), location.port).to_socket_addrs().map_err(io_err)?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(io_err)?;
                    stream.set_read_timeout(Some(io_timeout)).map_err(io_err)?;
                    stream.set_write_timeout(Some(io_timeout)).map_err(io_err)?;
                    let reader = BufReader::new(stream.try_clone().map_err(io_err)?);
                    debug!(%location, %addr, "connected");
                    return Ok(Self {
                        location: location.clone(),
                        reader,
                        writer: BufWriter::new(stream),
                        next_opaque: 1,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(io_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Send one request and read its response.
    fn call(&mut self, req: Request) -> ClientResult<Response> {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        let req = req.with_opaque(opaque);

        write_request(&mut self.writer, &req).map_err(|e| self.locate_err(e))?;
        let resp = read_response(&mut self.reader).map_err(|e| self.locate_err(e))?;
        if resp.opaque != opaque || resp.opcode != req.opcode {
            return Err(ClientError::Protocol {
                reason: format!(
                    "response {:?}/{} does not match request {:?}/{}",
                    resp.opcode, resp.opaque, req.opcode, opaque
                ),
            });
        }
        Ok(resp)
    }

    fn locate_err(&self, err: ClientError) -> ClientError {
        match err {
            ClientError::Io { location: None, kind, message } => {
                ClientError::Io { location: Some(self.location.clone()), kind, message }
            }
            other => other,
        }
    }
}

fn server_error(resp: Response) -> ClientError {
    ClientError::Server {
        status: resp.status,
        message: String::from_utf8_lossy(&resp.value).into_owned(),
    }
}

impl Connection for TcpConnection {
    fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let resp = self.call(Request::get(key))?;
        match resp.status {
            Status::NoError => Ok(Some(resp.value)),
            Status::KeyNotFound => Ok(None),
            _ => Err(server_error(resp)),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let resp = self.call(Request::set(key, value))?;
        match resp.status {
            Status::NoError => Ok(()),
            _ => Err(server_error(resp)),
        }
    }

    fn delete(&mut self, key: &[u8]) -> ClientResult<bool> {
        let resp = self.call(Request::delete(key))?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::KeyNotFound => Ok(false),
            _ => Err(server_error(resp)),
        }
    }

    fn flush(&mut self) -> ClientResult<()> {
        let resp = self.call(Request::flush())?;
        match resp.status {
            Status::NoError => Ok(()),
            _ => Err(server_error(resp)),
        }
    }

    fn version(&mut self) -> ClientResult<String> {
        let resp = self.call(Request::version())?;
        match (resp.status, resp.opcode) {
            (Status::NoError, Opcode::Version) => Ok(String::from_utf8_lossy(&resp.value).into_owned()),
            _ => Err(server_error(resp)),
        }
    }
}
