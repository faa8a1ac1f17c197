//! Shared protocol constants for the ApeFtp framed transport

use anyhow::{bail, Result};

// Command codes (first byte of every frame, keep numeric stable for compat)
pub mod command {
    pub const DEMAND_REQUEST: u8 = 0xA0;
    pub const TRANSFER_REQUEST: u8 = 0xA1;
    pub const TRANSFER_RESPONSE: u8 = 0xF0;
}

/// Fixed size of a Demand Request frame:
/// cmd(1) + md5(16) + totalLength(4) + segmentMaxLength(4).
pub const DEMAND_FRAME_LEN: usize = 25;

/// Header size of a Transfer Request frame, payload follows:
/// cmd(1) + md5(16) + totalLength(4) + function(1) + segmentCount(2) +
/// segmentIndex(2) + segmentPayloadLength(4).
pub const TRANSFER_HEADER_LEN: usize = 30;

/// Header size of a Transfer Response frame, message text follows:
/// cmd(1) + md5(16) + totalLength(4) + resultCode(1) + messageLength(1).
pub const RESPONSE_HEADER_LEN: usize = 23;

// Maximum frame size (64MB) - prevents DoS via memory exhaustion from a
// hostile declared payload length
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// The response message length field is a single byte.
pub const MAX_MESSAGE_LEN: usize = 255;

/// Default segment length proposed by the sender (512KB).
pub const DEFAULT_SEGMENT_SIZE: u32 = 512 * 1024;

/// Default receiver cap on a single segment (512KB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 512 * 1024;

/// Default receiver cap on a whole file (1GB).
pub const DEFAULT_MAX_FILE_SIZE: u32 = 1024 * 1024 * 1024;

/// Factor applied to the segment length on each failed negotiation.
pub const DEFAULT_SHRINK_FACTOR: f64 = 0.75;

/// Renegotiation gives up once the shrunk segment length falls to this.
pub const DEFAULT_MIN_SEGMENT_SIZE: u32 = 1;

/// Function code of a Transfer Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Abort the in-flight transfer for this key.
    Cancel = 0,
    /// Deliver one segment of file content.
    Send = 1,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FunctionCode::Cancel),
            1 => Ok(FunctionCode::Send),
            other => bail!("unknown function code {}", other),
        }
    }
}

/// Result code carried by a Transfer Response.
///
/// 0-99 are ordinary outcomes; 100-149 reject a demand; 150-199 reject a
/// transfer; 200+ report post-transfer verification failures.
/// `InvalidCancelCommand` historically shared 151 with `InvalidSegmentIndex`;
/// it is 152 here so the two outcomes stay distinguishable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Continue = 0,
    Completed = 1,
    Cancelled = 2,
    /// Proposed segment length exceeds the receiver's cap.
    SegmentSizeTooLarge = 100,
    /// Cache storage could not be created or written.
    InsufficientDiskSpace = 101,
    /// Declared total length exceeds the receiver's cap.
    FileSizeTooLarge = 102,
    /// A transfer for the same (md5, length) key is already in flight.
    SameFileTransmitting = 103,
    /// Transfer Request for a key that was never admitted.
    InvalidTransferTask = 150,
    /// Segment index not below the declared segment count.
    InvalidSegmentIndex = 151,
    /// Cancel is only valid while a transfer is in flight.
    InvalidCancelCommand = 152,
    /// Stored bytes failed length or hash verification.
    Md5Mismatching = 200,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        use ResultCode::*;
        Ok(match value {
            0 => Continue,
            1 => Completed,
            2 => Cancelled,
            100 => SegmentSizeTooLarge,
            101 => InsufficientDiskSpace,
            102 => FileSizeTooLarge,
            103 => SameFileTransmitting,
            150 => InvalidTransferTask,
            151 => InvalidSegmentIndex,
            152 => InvalidCancelCommand,
            200 => Md5Mismatching,
            other => bail!("unknown result code {}", other),
        })
    }

    /// True for codes in the error ranges (100+).
    pub fn is_error(self) -> bool {
        self as u8 >= 100
    }
}
