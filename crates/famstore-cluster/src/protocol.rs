//! Memcached binary protocol codec
//!
//! Every packet is a 24-byte header followed by `extras + key + value`.
//! All integers are big-endian.
//!
//! Layout:
//!   [0]      magic:        u8   - 0x80 request, 0x81 response
//!   [1]      opcode:       u8
//!   [2..4]   key_len:      u16
//!   [4]      extras_len:   u8
//!   [5]      data_type:    u8   - always 0
//!   [6..8]   status:       u16  - vbucket id in requests (0)
//!   [8..12]  total_body:   u32  - extras + key + value
//!   [12..16] opaque:       u32  - echoed back by the server
//!   [16..24] cas:          u64

use std::io::{self, Read, Write};

use crate::error::{ClientError, ClientResult};

/// Request packet magic
pub const REQUEST_MAGIC: u8 = 0x80;

/// Response packet magic
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Header size in bytes
pub const HEADER_SIZE: usize = 24;

/// Largest body accepted from the wire (extras + key + value)
pub const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// Commands understood by a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Delete = 0x04,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x04 => Opcode::Delete,
            0x08 => Opcode::Flush,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            _ => return None,
        })
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    InternalError = 0x0084,
}

impl Status {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0084 => Status::InternalError,
            _ => return None,
        })
    }
}

/// Fixed 24-byte packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// Status in responses, vbucket in requests
    pub status: u16,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.magic;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extras_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.status.to_be_bytes());
        buf[8..12].copy_from_slice(&self.total_body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: bytes[0],
            opcode: bytes[1],
            key_len: u16::from_be_bytes([bytes[2], bytes[3]]),
            extras_len: bytes[4],
            data_type: bytes[5],
            status: u16::from_be_bytes([bytes[6], bytes[7]]),
            total_body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            cas: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19],
                bytes[20], bytes[21], bytes[22], bytes[23],
            ]),
        }
    }

    /// Check the length fields against each other and the body limit.
    fn validate(&self) -> ClientResult<()> {
        let fixed = self.extras_len as u32 + self.key_len as u32;
        if fixed > self.total_body_len {
            return Err(protocol_error(format!(
                "extras ({}) + key ({}) exceed body length {}",
                self.extras_len, self.key_len, self.total_body_len
            )));
        }
        if self.total_body_len > MAX_BODY_LEN {
            return Err(protocol_error(format!(
                "body of {} bytes exceeds limit of {}",
                self.total_body_len, MAX_BODY_LEN
            )));
        }
        Ok(())
    }
}

fn protocol_error(reason: String) -> ClientError {
    ClientError::Protocol { reason }
}

/// A decoded request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub opaque: u32,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Request {
    pub fn get(key: &[u8]) -> Self {
        Self::new(Opcode::Get, Vec::new(), key, &[])
    }

    /// SET with zero flags and no expiry.
    pub fn set(key: &[u8], value: &[u8]) -> Self {
        Self::new(Opcode::Set, vec![0u8; 8], key, value)
    }

    pub fn delete(key: &[u8]) -> Self {
        Self::new(Opcode::Delete, Vec::new(), key, &[])
    }

    pub fn flush() -> Self {
        Self::new(Opcode::Flush, Vec::new(), &[], &[])
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop, Vec::new(), &[], &[])
    }

    pub fn version() -> Self {
        Self::new(Opcode::Version, Vec::new(), &[], &[])
    }

    fn new(opcode: Opcode, extras: Vec<u8>, key: &[u8], value: &[u8]) -> Self {
        Self { opcode, opaque: 0, extras, key: key.to_vec(), value: value.to_vec() }
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }
}

/// A decoded response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Response {
    pub fn ok(req: &Request) -> Self {
        Self::with_status(req, Status::NoError)
    }

    /// Response to `req` carrying `value`; GET replies get the flags extras.
    pub fn value(req: &Request, value: Vec<u8>) -> Self {
        let extras = if req.opcode == Opcode::Get { vec![0u8; 4] } else { Vec::new() };
        Self { extras, value, ..Self::ok(req) }
    }

    /// Failure response with a textual message body
    pub fn error(req: &Request, status: Status, message: &str) -> Self {
        Self { value: message.as_bytes().to_vec(), ..Self::with_status(req, status) }
    }

    fn with_status(req: &Request, status: Status) -> Self {
        Self {
            opcode: req.opcode,
            status,
            opaque: req.opaque,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }
}

fn encode(
    magic: u8,
    opcode: u8,
    status: u16,
    opaque: u32,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> ClientResult<Vec<u8>> {
    let key_len = u16::try_from(key.len())
        .map_err(|_| protocol_error(format!("key of {} bytes cannot be framed", key.len())))?;
    let extras_len = u8::try_from(extras.len())
        .map_err(|_| protocol_error(format!("extras of {} bytes cannot be framed", extras.len())))?;
    let body = extras.len() + key.len() + value.len();
    let total_body_len = u32::try_from(body)
        .ok()
        .filter(|&n| n <= MAX_BODY_LEN)
        .ok_or_else(|| protocol_error(format!("body of {} bytes exceeds limit", body)))?;

    let header = Header {
        magic,
        opcode,
        key_len,
        extras_len,
        data_type: 0,
        status,
        total_body_len,
        opaque,
        cas: 0,
    };
    let mut buf = Vec::with_capacity(HEADER_SIZE + body);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(buf)
}

/// Serialize a request packet
pub fn encode_request(req: &Request) -> ClientResult<Vec<u8>> {
    encode(REQUEST_MAGIC, req.opcode as u8, 0, req.opaque, &req.extras, &req.key, &req.value)
}

/// Serialize a response packet
pub fn encode_response(resp: &Response) -> ClientResult<Vec<u8>> {
    encode(
        RESPONSE_MAGIC,
        resp.opcode as u8,
        resp.status as u16,
        resp.opaque,
        &resp.extras,
        &resp.key,
        &resp.value,
    )
}

/// Header plus body split into extras, key and value
struct Packet {
    header: Header,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Read one packet. `Ok(None)` on a clean EOF before the first header byte.
fn read_packet(r: &mut impl Read, magic: u8) -> io::Result<Option<ClientResult<Packet>>> {
    let mut hdr = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match r.read(&mut hdr[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let header = Header::from_bytes(&hdr);
    if header.magic != magic {
        return Ok(Some(Err(protocol_error(format!(
            "bad magic 0x{:02x}, expected 0x{:02x}",
            header.magic, magic
        )))));
    }
    if let Err(e) = header.validate() {
        return Ok(Some(Err(e)));
    }

    let mut body = vec![0u8; header.total_body_len as usize];
    r.read_exact(&mut body)?;
    let value = body.split_off(header.extras_len as usize + header.key_len as usize);
    let key = body.split_off(header.extras_len as usize);
    Ok(Some(Ok(Packet { header, extras: body, key, value })))
}

/// Read a request. `Ok(None)` when the peer closed the connection between
/// requests.
pub fn read_request(r: &mut impl Read) -> ClientResult<Option<Request>> {
    let Some(packet) = read_packet(r, REQUEST_MAGIC)? else {
        return Ok(None);
    };
    let p = packet?;
    let opcode = Opcode::from_u8(p.header.opcode).ok_or_else(|| {
        protocol_error(format!("unsupported opcode 0x{:02x}", p.header.opcode))
    })?;
    Ok(Some(Request {
        opcode,
        opaque: p.header.opaque,
        extras: p.extras,
        key: p.key,
        value: p.value,
    }))
}

/// Read a response; EOF is an error here.
pub fn read_response(r: &mut impl Read) -> ClientResult<Response> {
    let Some(packet) = read_packet(r, RESPONSE_MAGIC)? else {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    };
    let p = packet?;
    let opcode = Opcode::from_u8(p.header.opcode).ok_or_else(|| {
        protocol_error(format!("unsupported opcode 0x{:02x}", p.header.opcode))
    })?;
    let status = Status::from_u16(p.header.status)
        .ok_or_else(|| protocol_error(format!("unknown status 0x{:04x}", p.header.status)))?;
    Ok(Response {
        opcode,
        status,
        opaque: p.header.opaque,
        extras: p.extras,
        key: p.key,
        value: p.value,
    })
}

pub fn write_request(w: &mut impl Write, req: &Request) -> ClientResult<()> {
    w.write_all(&encode_request(req)?)?;
    w.flush()?;
    Ok(())
}

pub fn write_response(w: &mut impl Write, resp: &Response) -> ClientResult<()> {
    w.write_all(&encode_response(resp)?)?;
    w.flush()?;
    Ok(())
}
