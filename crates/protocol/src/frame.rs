//! Binary frame codec for the realtime dialogue wire protocol.
//!
//! Every message on the upstream WebSocket is one frame:
//!
//! ```text
//! [version:4 headerSize:4] [messageType:4 flags:4] [serialization:4 compression:4] [reserved:8]
//! [sequence: u32 BE]                  (if flags has 0b0010)
//! [eventId: u32 BE]                   (if flags has 0b0100)
//! [sessionIdSize: i32 BE][sessionId]  (server responses: always; client requests: when present)
//! [errorCode: u32 BE]                 (ERROR frames, replacing the fields above)
//! [payloadSize: u32 BE][payload]
//! ```
//!
//! The sessionIdSize field is signed while payloadSize is unsigned. That
//! asymmetry is part of the wire format and must be preserved.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use tracing::warn;

pub const PROTOCOL_VERSION: u8 = 0b0001;
/// Header length in 4-byte words. The protocol fixes this at one word.
pub const HEADER_SIZE_WORDS: u8 = 0b0001;

pub const FLAG_HAS_SEQUENCE: u8 = 0b0010;
pub const FLAG_HAS_EVENT: u8 = 0b0100;

pub const SERIALIZATION_NONE: u8 = 0b0000;
pub const SERIALIZATION_JSON: u8 = 0b0001;

pub const COMPRESSION_NONE: u8 = 0b0000;
pub const COMPRESSION_GZIP: u8 = 0b0001;

/// Message type nibble of the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    /// Also carries audio-only server responses.
    ServerAck = 0b1011,
    Error = 0b1111,
}

impl MessageType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0b0001 => Some(Self::FullClientRequest),
            0b0010 => Some(Self::AudioOnlyRequest),
            0b1001 => Some(Self::FullServerResponse),
            0b1011 => Some(Self::ServerAck),
            0b1111 => Some(Self::Error),
            _ => None,
        }
    }

    fn is_server_response(self) -> bool {
        matches!(self, Self::FullServerResponse | Self::ServerAck)
    }
}

/// Decoded frame payload.
///
/// JSON-serialized payloads that fail to parse are surfaced as text rather
/// than dropped, so a malformed upstream body still reaches the logs.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize frame payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress frame payload: {0}")]
    Compress(#[from] std::io::Error),
}

/// One wire message of the upstream dialogue protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    pub sequence: Option<u32>,
    pub event: Option<u32>,
    pub session_id: Option<String>,
    pub error_code: Option<u32>,
    pub payload: Payload,
    /// Set when the payload claimed GZIP but failed to inflate; the raw
    /// bytes are kept so the session can still log them.
    pub raw_compressed: bool,
}

impl Frame {
    /// A JSON event frame on the control channel (FULL_CLIENT_REQUEST).
    pub fn event_json(event: u32, session_id: Option<String>, payload: Value) -> Self {
        Self {
            message_type: MessageType::FullClientRequest,
            flags: FLAG_HAS_EVENT,
            sequence: None,
            event: Some(event),
            session_id,
            error_code: None,
            payload: Payload::Json(payload),
            raw_compressed: false,
        }
    }

    /// A raw-audio event frame (AUDIO_ONLY_REQUEST, serialization NONE).
    pub fn event_audio(event: u32, session_id: Option<String>, pcm: Bytes) -> Self {
        Self {
            message_type: MessageType::AudioOnlyRequest,
            flags: FLAG_HAS_EVENT,
            sequence: None,
            event: Some(event),
            session_id,
            error_code: None,
            payload: Payload::Binary(pcm),
            raw_compressed: false,
        }
    }

    /// Encodes the frame into wire bytes, GZIP-compressing the payload when
    /// `compress` is set.
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>, ProtocolError> {
        let serialization = match self.payload {
            Payload::Binary(_) => SERIALIZATION_NONE,
            _ => SERIALIZATION_JSON,
        };
        let compression = if compress {
            COMPRESSION_GZIP
        } else {
            COMPRESSION_NONE
        };

        let mut out = Vec::with_capacity(64);
        out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE_WORDS);
        out.push(((self.message_type as u8) << 4) | (self.flags & 0x0F));
        out.push((serialization << 4) | compression);
        out.push(0);

        if self.message_type == MessageType::Error {
            // Error frames carry an error code in place of the prefix fields.
            out.extend_from_slice(&self.error_code.unwrap_or(0).to_be_bytes());
        } else {
            if let Some(sequence) = self.sequence {
                out.extend_from_slice(&sequence.to_be_bytes());
            }
            if let Some(event) = self.event {
                out.extend_from_slice(&event.to_be_bytes());
            }
            if self.message_type.is_server_response() {
                // Server responses always carry the session-id prefix, even
                // when the session id is empty.
                let session = self.session_id.as_deref().unwrap_or("");
                out.extend_from_slice(&(session.len() as i32).to_be_bytes());
                out.extend_from_slice(session.as_bytes());
            } else if let Some(session) = &self.session_id {
                out.extend_from_slice(&(session.len() as i32).to_be_bytes());
                out.extend_from_slice(session.as_bytes());
            }
        }

        let serialized = match &self.payload {
            Payload::Json(value) => serde_json::to_vec(value)?,
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Binary(bytes) => bytes.to_vec(),
        };
        let body = if compress { gzip(&serialized)? } else { serialized };

        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a server-originated frame.
    ///
    /// Returns `None` for under-length buffers and message types the proxy
    /// does not consume (only server responses, acks and error frames arrive
    /// on the downstream half of the connection).
    pub fn decode(buf: &[u8]) -> Option<Frame> {
        if buf.len() < 8 {
            return None;
        }

        let header_size = (buf[0] & 0x0F) as usize;
        let message_type = MessageType::from_nibble(buf[1] >> 4)?;
        let flags = buf[1] & 0x0F;
        let serialization = buf[2] >> 4;
        let compression = buf[2] & 0x0F;

        let mut offset = header_size * 4;
        let mut sequence = None;
        let mut event = None;
        let mut session_id = None;
        let mut error_code = None;

        if message_type.is_server_response() {
            if flags & FLAG_HAS_SEQUENCE != 0 {
                sequence = Some(read_u32(buf, &mut offset)?);
            }
            if flags & FLAG_HAS_EVENT != 0 {
                event = Some(read_u32(buf, &mut offset)?);
            }
            let session_size = read_i32(buf, &mut offset)?;
            if session_size < 0 {
                return None;
            }
            let session_bytes = read_bytes(buf, &mut offset, session_size as usize)?;
            session_id = Some(String::from_utf8_lossy(session_bytes).into_owned());
        } else if message_type == MessageType::Error {
            error_code = Some(read_u32(buf, &mut offset)?);
        } else {
            return None;
        }

        let payload_size = read_u32(buf, &mut offset)? as usize;
        let raw = read_bytes(buf, &mut offset, payload_size)?;

        let (body, raw_compressed) = if compression == COMPRESSION_GZIP {
            match gunzip(raw) {
                Ok(inflated) => (inflated, false),
                Err(err) => {
                    warn!(?message_type, error = %err, "keeping raw payload after gzip failure");
                    (raw.to_vec(), true)
                }
            }
        } else {
            (raw.to_vec(), false)
        };

        let payload = if serialization == SERIALIZATION_JSON {
            match serde_json::from_slice::<Value>(&body) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Text(String::from_utf8_lossy(&body).into_owned()),
            }
        } else {
            Payload::Binary(Bytes::from(body))
        };

        Some(Frame {
            message_type,
            flags,
            sequence,
            event,
            session_id,
            error_code,
            payload,
            raw_compressed,
        })
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn read_u32(buf: &[u8], offset: &mut usize) -> Option<u32> {
    let bytes = read_bytes(buf, offset, 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(buf: &[u8], offset: &mut usize) -> Option<i32> {
    let bytes = read_bytes(buf, offset, 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_bytes<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = offset.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    let slice = &buf[*offset..end];
    *offset = end;
    Some(slice)
}
