//! Wire message formats for the three ApeFtp frames
//!
//! All multi-byte integers are big-endian. Encoding is pure and never fails;
//! decoding fails when a declared length disagrees with the bytes on hand.
//!
//! ```text
//! Demand Request    [cmd:1][md5:16][totalLength:4][segmentMaxLength:4]
//! Transfer Request  [cmd:1][md5:16][totalLength:4][function:1][segmentCount:2]
//!                   [segmentIndex:2][segmentPayloadLength:4][payload...]
//! Transfer Response [cmd:1][md5:16][totalLength:4][resultCode:1]
//!                   [messageLength:1][message: UTF-8...]
//! ```

use anyhow::{bail, Result};
use std::fmt;

use crate::protocol::{
    command, FunctionCode, ResultCode, DEMAND_FRAME_LEN, MAX_MESSAGE_LEN, RESPONSE_HEADER_LEN,
    TRANSFER_HEADER_LEN,
};

/// Whole-file MD5 digest, 16 bytes.
pub type ContentHash = [u8; 16];

/// Identity of one transfer: content hash plus total file length.
///
/// Both sides track their end of a transfer under this key; the receiver
/// admits at most one in-flight task per key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub md5: ContentHash,
    pub total_length: u32,
}

impl SessionKey {
    pub fn new(md5: ContentHash, total_length: u32) -> Self {
        Self { md5, total_length }
    }

    /// Lowercase hex rendering of the content hash.
    pub fn md5_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in &self.md5 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Stable string id, e.g. `d41d8cd98f00b204e9800998ecf8427e-1048576`.
    /// Used by filesystem-backed stores to key cache directories.
    pub fn id(&self) -> String {
        format!("{}-{}", self.md5_hex(), self.total_length)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.id())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Initial negotiation: may this file be sent, in segments of at most
/// `segment_max_length` bytes?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandRequest {
    pub key: SessionKey,
    pub segment_max_length: u32,
}

impl DemandRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEMAND_FRAME_LEN);
        buf.push(command::DEMAND_REQUEST);
        buf.extend_from_slice(&self.key.md5);
        buf.extend_from_slice(&self.key.total_length.to_be_bytes());
        buf.extend_from_slice(&self.segment_max_length.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DEMAND_FRAME_LEN {
            bail!(
                "demand request must be {} bytes, got {}",
                DEMAND_FRAME_LEN,
                bytes.len()
            );
        }
        if bytes[0] != command::DEMAND_REQUEST {
            bail!("not a demand request: command 0x{:02X}", bytes[0]);
        }
        Ok(Self {
            key: read_key(bytes),
            segment_max_length: read_u32(bytes, 21),
        })
    }
}

/// One segment of file content (function Send), or a cancellation of the
/// whole transfer (function Cancel, empty payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub key: SessionKey,
    pub function: FunctionCode,
    pub segment_count: u16,
    pub segment_index: u16,
    pub data: Vec<u8>,
}

impl TransferRequest {
    /// A Cancel-function request for `key`; carries no segment fields.
    pub fn cancel(key: SessionKey) -> Self {
        Self {
            key,
            function: FunctionCode::Cancel,
            segment_count: 0,
            segment_index: 0,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TRANSFER_HEADER_LEN + self.data.len());
        buf.push(command::TRANSFER_REQUEST);
        buf.extend_from_slice(&self.key.md5);
        buf.extend_from_slice(&self.key.total_length.to_be_bytes());
        buf.push(self.function as u8);
        buf.extend_from_slice(&self.segment_count.to_be_bytes());
        buf.extend_from_slice(&self.segment_index.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TRANSFER_HEADER_LEN {
            bail!(
                "transfer request header needs {} bytes, got {}",
                TRANSFER_HEADER_LEN,
                bytes.len()
            );
        }
        if bytes[0] != command::TRANSFER_REQUEST {
            bail!("not a transfer request: command 0x{:02X}", bytes[0]);
        }
        let payload_len = read_u32(bytes, 26) as usize;
        if bytes.len() != TRANSFER_HEADER_LEN + payload_len {
            bail!(
                "transfer request declares {} payload bytes but frame holds {}",
                payload_len,
                bytes.len() - TRANSFER_HEADER_LEN
            );
        }
        Ok(Self {
            key: read_key(bytes),
            function: FunctionCode::from_u8(bytes[21])?,
            segment_count: read_u16(bytes, 22),
            segment_index: read_u16(bytes, 24),
            data: bytes[TRANSFER_HEADER_LEN..].to_vec(),
        })
    }

    /// True for the final segment of the negotiated run.
    pub fn is_last_segment(&self) -> bool {
        self.segment_index as u32 + 1 == self.segment_count as u32
    }
}

/// Outcome of a demand or transfer exchange, with optional diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub key: SessionKey,
    pub result: ResultCode,
    pub message: String,
}

impl TransferResponse {
    pub fn new(key: SessionKey, result: ResultCode) -> Self {
        Self {
            key,
            result,
            message: String::new(),
        }
    }

    pub fn with_message(key: SessionKey, result: ResultCode, message: impl Into<String>) -> Self {
        Self {
            key,
            result,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // The length field is one byte; clip oversized diagnostics on a
        // char boundary rather than wrapping the length.
        let mut msg = self.message.as_str();
        if msg.len() > MAX_MESSAGE_LEN {
            let mut end = MAX_MESSAGE_LEN;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            msg = &msg[..end];
        }
        let mut buf = Vec::with_capacity(RESPONSE_HEADER_LEN + msg.len());
        buf.push(command::TRANSFER_RESPONSE);
        buf.extend_from_slice(&self.key.md5);
        buf.extend_from_slice(&self.key.total_length.to_be_bytes());
        buf.push(self.result as u8);
        buf.push(msg.len() as u8);
        buf.extend_from_slice(msg.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            bail!(
                "transfer response header needs {} bytes, got {}",
                RESPONSE_HEADER_LEN,
                bytes.len()
            );
        }
        if bytes[0] != command::TRANSFER_RESPONSE {
            bail!("not a transfer response: command 0x{:02X}", bytes[0]);
        }
        let message_len = bytes[22] as usize;
        if bytes.len() != RESPONSE_HEADER_LEN + message_len {
            bail!(
                "transfer response declares {} message bytes but frame holds {}",
                message_len,
                bytes.len() - RESPONSE_HEADER_LEN
            );
        }
        Ok(Self {
            key: read_key(bytes),
            result: ResultCode::from_u8(bytes[21])?,
            message: String::from_utf8_lossy(&bytes[RESPONSE_HEADER_LEN..]).into_owned(),
        })
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Demand(DemandRequest),
    Transfer(TransferRequest),
    Response(TransferResponse),
}

impl Frame {
    /// Decode a complete frame as sliced by the stream framer.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        match bytes.first() {
            Some(&command::DEMAND_REQUEST) => Ok(Frame::Demand(DemandRequest::decode(bytes)?)),
            Some(&command::TRANSFER_REQUEST) => Ok(Frame::Transfer(TransferRequest::decode(bytes)?)),
            Some(&command::TRANSFER_RESPONSE) => {
                Ok(Frame::Response(TransferResponse::decode(bytes)?))
            }
            Some(&other) => bail!("unknown command code 0x{:02X}", other),
            None => bail!("empty frame"),
        }
    }

    /// Session key carried by every frame kind.
    pub fn key(&self) -> SessionKey {
        match self {
            Frame::Demand(m) => m.key,
            Frame::Transfer(m) => m.key,
            Frame::Response(m) => m.key,
        }
    }
}

// All frames share the same leading layout: cmd(1) + md5(16) + totalLength(4).
fn read_key(bytes: &[u8]) -> SessionKey {
    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&bytes[1..17]);
    SessionKey::new(md5, read_u32(bytes, 17))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}
