//! Binary encoding of the frames exchanged on the data channel.
//!
//! Every frame starts with one header byte (3 bits protocol version, 5 bits
//! frame kind) followed by the stream id as a LEB128 varint and the body.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::status::{Code, Status};

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on everything a frame adds around its message data.
pub const FRAME_OVERHEAD: usize = 64;

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const REQUEST_KIND_HEADERS: u8 = 0;
const REQUEST_KIND_MESSAGE: u8 = 1;
const REQUEST_KIND_RST_STREAM: u8 = 2;

const RESPONSE_KIND_HEADERS: u8 = 8;
const RESPONSE_KIND_MESSAGE: u8 = 9;
const RESPONSE_KIND_TRAILERS: u8 = 10;

/// Call metadata; keys map to every value sent under them.
pub type Metadata = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub method: String,
    pub metadata: Metadata,
    /// `None` when the caller set no deadline.
    pub timeout: Option<Duration>,
}

/// One chunk of a message; `eom` marks the last chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMessage {
    pub data: Bytes,
    pub eom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Headers(RequestHeaders),
    /// `packet` is `None` for a bare end-of-stream marker.
    Message {
        packet: Option<PacketMessage>,
        eos: bool,
    },
    RstStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stream: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Headers(Metadata),
    Message(PacketMessage),
    Trailers { status: Status, metadata: Metadata },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub stream: u64,
    pub body: ResponseBody,
}

pub fn encode_request(request: &Request) -> Bytes {
    let mut buf = Vec::with_capacity(64);
    match &request.body {
        RequestBody::Headers(headers) => {
            write_header(&mut buf, REQUEST_KIND_HEADERS);
            write_var_u64(&mut buf, request.stream);
            write_str(&mut buf, &headers.method);
            write_metadata(&mut buf, &headers.metadata);
            let micros = headers
                .timeout
                .map(|timeout| u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0);
            write_var_u64(&mut buf, micros);
        }
        RequestBody::Message { packet, eos } => {
            let data_len = packet.as_ref().map(|packet| packet.data.len()).unwrap_or(0);
            buf.reserve(data_len);
            write_header(&mut buf, REQUEST_KIND_MESSAGE);
            write_var_u64(&mut buf, request.stream);
            buf.push(*eos as u8);
            buf.push(packet.is_some() as u8);
            if let Some(packet) = packet {
                write_packet(&mut buf, packet);
            }
        }
        RequestBody::RstStream => {
            write_header(&mut buf, REQUEST_KIND_RST_STREAM);
            write_var_u64(&mut buf, request.stream);
        }
    }
    Bytes::from(buf)
}

pub fn decode_request(bytes: &Bytes) -> Result<Request, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    let stream = cursor.read_var_u64()?;
    let body = match kind {
        REQUEST_KIND_HEADERS => {
            let method = cursor.read_string()?;
            let metadata = read_metadata(&mut cursor)?;
            let micros = cursor.read_var_u64()?;
            RequestBody::Headers(RequestHeaders {
                method,
                metadata,
                timeout: (micros > 0).then(|| Duration::from_micros(micros)),
            })
        }
        REQUEST_KIND_MESSAGE => {
            let eos = cursor.read_bool()?;
            let packet = if cursor.read_bool()? {
                Some(read_packet(&mut cursor)?)
            } else {
                None
            };
            RequestBody::Message { packet, eos }
        }
        REQUEST_KIND_RST_STREAM => RequestBody::RstStream,
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(Request { stream, body })
}

pub fn encode_response(response: &Response) -> Bytes {
    let mut buf = Vec::with_capacity(64);
    match &response.body {
        ResponseBody::Headers(metadata) => {
            write_header(&mut buf, RESPONSE_KIND_HEADERS);
            write_var_u64(&mut buf, response.stream);
            write_metadata(&mut buf, metadata);
        }
        ResponseBody::Message(packet) => {
            buf.reserve(packet.data.len());
            write_header(&mut buf, RESPONSE_KIND_MESSAGE);
            write_var_u64(&mut buf, response.stream);
            write_packet(&mut buf, packet);
        }
        ResponseBody::Trailers { status, metadata } => {
            write_header(&mut buf, RESPONSE_KIND_TRAILERS);
            write_var_u64(&mut buf, response.stream);
            buf.push(status.code() as u8);
            write_str(&mut buf, status.message());
            write_metadata(&mut buf, metadata);
        }
    }
    Bytes::from(buf)
}

pub fn decode_response(bytes: &Bytes) -> Result<Response, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    let stream = cursor.read_var_u64()?;
    let body = match kind {
        RESPONSE_KIND_HEADERS => ResponseBody::Headers(read_metadata(&mut cursor)?),
        RESPONSE_KIND_MESSAGE => ResponseBody::Message(read_packet(&mut cursor)?),
        RESPONSE_KIND_TRAILERS => {
            let code = Code::from_u8(cursor.read_u8()?);
            let message = cursor.read_string()?;
            let metadata = read_metadata(&mut cursor)?;
            ResponseBody::Trailers {
                status: Status::new(code, message),
                metadata,
            }
        }
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(Response { stream, body })
}

fn write_packet(buf: &mut Vec<u8>, packet: &PacketMessage) {
    buf.push(packet.eom as u8);
    write_var_u64(buf, packet.data.len() as u64);
    buf.extend_from_slice(&packet.data);
}

fn read_packet(cursor: &mut Cursor<'_>) -> Result<PacketMessage, WireError> {
    let eom = cursor.read_bool()?;
    let len = cursor.read_len()?;
    let data = cursor.read_shared(len)?;
    Ok(PacketMessage { data, eom })
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

fn write_metadata(buf: &mut Vec<u8>, metadata: &Metadata) {
    write_var_u64(buf, metadata.len() as u64);
    for (key, values) in metadata {
        write_str(buf, key);
        write_var_u64(buf, values.len() as u64);
        for value in values {
            write_str(buf, value);
        }
    }
}

fn read_metadata(cursor: &mut Cursor<'_>) -> Result<Metadata, WireError> {
    let count = cursor.read_len()?;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = cursor.read_string()?;
        let value_count = cursor.read_len()?;
        let mut values = Vec::with_capacity(value_count.min(16));
        for _ in 0..value_count {
            values.push(cursor.read_string()?);
        }
        metadata.entry(key).or_default().extend(values);
    }
    Ok(metadata)
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok(byte & TYPE_MASK)
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

struct Cursor<'a> {
    source: &'a Bytes,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a Bytes) -> Self {
        Self { source, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let value = *self.source.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| WireError::InvalidData("length overflow"))?;
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        Ok(len)
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    /// Zero-copy view into the frame buffer.
    fn read_shared(&mut self, len: usize) -> Result<Bytes, WireError> {
        if self.pos + len > self.source.len() {
            return Err(WireError::UnexpectedEof);
        }
        let data = self.source.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(data)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_len()?;
        let raw = self.read_shared(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidData("invalid utf-8"))
    }

    fn remaining(&self) -> usize {
        self.source.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::InvalidData("trailing bytes"));
        }
        Ok(())
    }
}
