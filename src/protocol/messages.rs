// ABOUTME: Protocol message type definitions and serialization
// ABOUTME: Fixed 26-byte little-endian header plus typed message bodies

use bytes::Buf;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::local_now_micros;

/// Size of the fixed message header on the wire.
pub const BASE_MESSAGE_SIZE: usize = 26;

/// Upper bound on a message body. Anything larger is a framing error: either
/// the peer is broken or we lost sync with the byte stream.
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// POSIX-style timestamp pair, a duration since the Unix epoch on the
/// sender's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tv {
    pub sec: i32,
    pub usec: i32,
}

impl Tv {
    /// Current local wall clock.
    pub fn now() -> Self {
        Self::from_micros(local_now_micros())
    }

    pub fn from_micros(micros: i64) -> Self {
        Tv {
            sec: micros.div_euclid(1_000_000) as i32,
            usec: micros.rem_euclid(1_000_000) as i32,
        }
    }

    pub fn to_micros(self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        ensure(buf.remaining(), 8, "timestamp")?;
        Ok(Tv {
            sec: buf.get_i32_le(),
            usec: buf.get_i32_le(),
        })
    }

    fn put(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.sec.to_le_bytes());
        buf.extend_from_slice(&self.usec.to_le_bytes());
    }
}

/// The closed set of message kinds this client understands. Unknown type
/// codes are legal on the wire and are skipped by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Base = 0,
    CodecHeader = 1,
    WireChunk = 2,
    ServerSettings = 3,
    Time = 4,
    Hello = 5,
    StreamTags = 6,
}

impl MessageType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(MessageType::Base),
            1 => Some(MessageType::CodecHeader),
            2 => Some(MessageType::WireChunk),
            3 => Some(MessageType::ServerSettings),
            4 => Some(MessageType::Time),
            5 => Some(MessageType::Hello),
            6 => Some(MessageType::StreamTags),
            _ => None,
        }
    }
}

/// Fixed wire header preceding every message body.
///
/// `id` is assigned by the sender; `refers_to` mirrors the id of the message
/// this one answers (0 if none). `sent` is stamped just before serialization,
/// `received` by the reader on arrival.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseMessage {
    pub msg_type: u16,
    pub id: u16,
    pub refers_to: u16,
    pub sent: Tv,
    pub received: Tv,
    pub size: u32,
}

impl BaseMessage {
    /// Decode the fixed header from at least [`BASE_MESSAGE_SIZE`] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        ensure(buf.remaining(), BASE_MESSAGE_SIZE, "message header")?;
        let header = BaseMessage {
            msg_type: buf.get_u16_le(),
            id: buf.get_u16_le(),
            refers_to: buf.get_u16_le(),
            sent: Tv::get(&mut buf)?,
            received: Tv::get(&mut buf)?,
            size: buf.get_u32_le(),
        };
        if header.size > MAX_BODY_SIZE {
            return Err(Error::Protocol(format!(
                "message body of {} bytes exceeds limit",
                header.size
            )));
        }
        Ok(header)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.msg_type.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.refers_to.to_le_bytes());
        self.sent.put(buf);
        self.received.put(buf);
        buf.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }
}

/// A message body that can be framed behind a [`BaseMessage`] header.
pub trait TypedMessage: Sized {
    const KIND: MessageType;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()>;
    fn decode_body(body: &[u8]) -> Result<Self>;
}

/// Serialize `msg` into a complete wire frame, stamping `sent` with the
/// local clock.
pub fn serialize_frame<T: TypedMessage>(msg: &T, id: u16, refers_to: u16) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    msg.encode_body(&mut body)?;
    let header = BaseMessage {
        msg_type: T::KIND as u16,
        id,
        refers_to,
        sent: Tv::now(),
        received: Tv::default(),
        size: body.len() as u32,
    };
    let mut frame = Vec::with_capacity(BASE_MESSAGE_SIZE + body.len());
    header.encode(&mut frame);
    frame.extend_from_slice(&body);
    Ok(frame)
}

// =============================================================================
// Handshake
// =============================================================================

/// Client identification, sent once right after connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "HostName")]
    pub hostname: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ClientName")]
    pub client_name: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Instance")]
    pub instance: u32,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "SnapStreamProtocolVersion")]
    pub protocol_version: u32,
}

impl Hello {
    pub fn new(mac: &str, host_id: &str, instance: u32) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Hello {
            mac: mac.to_string(),
            hostname: host,
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            instance,
            id: host_id.to_string(),
            protocol_version: 2,
        }
    }
}

impl TypedMessage for Hello {
    const KIND: MessageType = MessageType::Hello;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        encode_json_body(self, buf)
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        decode_json_body(body)
    }
}

// =============================================================================
// Server settings
// =============================================================================

/// Playback parameters, pushed by the server whenever they change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    /// End-to-end buffer the server asks for, in milliseconds.
    pub buffer_ms: i32,
    /// Server-side latency compensation for this client, in milliseconds.
    pub latency: i32,
    /// Volume in percent, 0..=100.
    pub volume: u16,
    pub muted: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            buffer_ms: 1000,
            latency: 0,
            volume: 100,
            muted: false,
        }
    }
}

impl TypedMessage for ServerSettings {
    const KIND: MessageType = MessageType::ServerSettings;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        encode_json_body(self, buf)
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        decode_json_body(body)
    }
}

// =============================================================================
// Time synchronization
// =============================================================================

/// Round-trip clock probe. The client sends it with a zero payload; the
/// server replies with `latency` = its receive stamp minus the client's send
/// stamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    pub latency: Tv,
}

impl TypedMessage for Time {
    const KIND: MessageType = MessageType::Time;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.latency.put(buf);
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        Ok(Time {
            latency: Tv::get(&mut buf)?,
        })
    }
}

// =============================================================================
// Audio payloads
// =============================================================================

/// One packet of encoded audio with the capture time of its first sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    pub timestamp: Tv,
    pub payload: Vec<u8>,
}

impl TypedMessage for WireChunk {
    const KIND: MessageType = MessageType::WireChunk;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.timestamp.put(buf);
        put_blob(buf, &self.payload);
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let timestamp = Tv::get(&mut buf)?;
        let payload = get_blob(&mut buf)?;
        Ok(WireChunk { timestamp, payload })
    }
}

/// Codec name plus opaque initialization bytes, sent by the server before the
/// first chunk of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    pub codec: String,
    pub payload: Vec<u8>,
}

impl TypedMessage for CodecHeader {
    const KIND: MessageType = MessageType::CodecHeader;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_string(buf, &self.codec);
        put_blob(buf, &self.payload);
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let codec = get_string(&mut buf)?;
        let payload = get_blob(&mut buf)?;
        Ok(CodecHeader { codec, payload })
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Free-form track metadata, forwarded to an attached metadata sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTags {
    pub tags: serde_json::Value,
}

impl TypedMessage for StreamTags {
    const KIND: MessageType = MessageType::StreamTags;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        let json = serde_json::to_string(&self.tags)
            .map_err(|e| Error::internal(format!("tags serialization: {e}")))?;
        put_string(buf, &json);
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let json = get_string(&mut buf)?;
        let tags = serde_json::from_str(&json)
            .map_err(|e| Error::Protocol(format!("bad stream tags: {e}")))?;
        Ok(StreamTags { tags })
    }
}

// =============================================================================
// Body helpers
// =============================================================================

fn ensure(have: usize, need: usize, what: &str) -> Result<()> {
    if have < need {
        return Err(Error::Protocol(format!(
            "truncated {what}: want {need} bytes, have {have}"
        )));
    }
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let bytes = get_blob(buf)?;
    String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("invalid utf-8 string: {e}")))
}

fn put_blob(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

fn get_blob(buf: &mut &[u8]) -> Result<Vec<u8>> {
    ensure(buf.remaining(), 4, "length prefix")?;
    let len = buf.get_u32_le() as usize;
    ensure(buf.remaining(), len, "length-prefixed payload")?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn encode_json_body<T: Serialize>(value: &T, buf: &mut Vec<u8>) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| Error::internal(format!("json serialization: {e}")))?;
    put_string(buf, &json);
    Ok(())
}

fn decode_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let mut buf = body;
    let json = get_string(&mut buf)?;
    serde_json::from_str(&json).map_err(|e| Error::Protocol(format!("bad json payload: {e}")))
}
