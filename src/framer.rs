//! Incremental framing of the raw byte stream
//!
//! The transport hands over bytes in arbitrary slices; the framer buffers
//! them and slices out exactly one complete frame at a time. Frame length is
//! derived only from the command byte and the fixed-offset length fields,
//! never from content past the declared boundary. An unknown command byte is
//! connection-fatal: there is no resynchronization point mid-stream.

use anyhow::{bail, Result};

use crate::protocol::{
    command, DEMAND_FRAME_LEN, MAX_FRAME_SIZE, RESPONSE_HEADER_LEN, TRANSFER_HEADER_LEN,
};

/// Total length of the frame starting at `buf[0]`, or `None` while the
/// buffered bytes do not yet cover the relevant header fields.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&cmd) = buf.first() else {
        return Ok(None);
    };
    match cmd {
        command::DEMAND_REQUEST => Ok(Some(DEMAND_FRAME_LEN)),
        command::TRANSFER_REQUEST => {
            if buf.len() < TRANSFER_HEADER_LEN {
                return Ok(None);
            }
            let payload =
                u32::from_be_bytes([buf[26], buf[27], buf[28], buf[29]]) as usize;
            let total = TRANSFER_HEADER_LEN + payload;
            if total > MAX_FRAME_SIZE {
                bail!(
                    "frame too large: {} bytes (max: {})",
                    total,
                    MAX_FRAME_SIZE
                );
            }
            Ok(Some(total))
        }
        command::TRANSFER_RESPONSE => {
            if buf.len() < RESPONSE_HEADER_LEN {
                return Ok(None);
            }
            Ok(Some(RESPONSE_HEADER_LEN + buf[22] as usize))
        }
        other => bail!("unknown command code 0x{:02X} in stream", other),
    }
}

/// Per-connection frame boundary tracker.
///
/// Feed raw bytes with [`push`](Self::push), then drain complete frames with
/// [`next_frame`](Self::next_frame) until it returns `Ok(None)`. Any error is
/// fatal for the connection; the framer holds no recovery state.
#[derive(Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append transport bytes to the buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Slice off the next complete frame, leaving any trailing partial frame
    /// buffered for later.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match frame_len(&self.buf)? {
            Some(len) if self.buf.len() >= len => {
                let frame = self.buf.drain(..len).collect();
                Ok(Some(frame))
            }
            _ => Ok(None),
        }
    }

    /// Bytes currently buffered (complete or partial).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
