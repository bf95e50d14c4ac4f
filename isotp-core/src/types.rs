//! Core types for the ISO-TP transport core
//!
//! This module defines the error taxonomy shared by every layer of the core:
//! parameter validation, frame encoding/decoding and the transfer state
//! machines. Errors from each layer convert into [`IsoTpError`] so callers can
//! propagate them with `?`.

use std::fmt;
use std::time::Duration;

/// Result type for ISO-TP operations
pub type Result<T> = std::result::Result<T, IsoTpError>;

/// Top-level error returned by sessions and engines
#[derive(Debug, thiserror::Error)]
pub enum IsoTpError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl IsoTpError {
    /// The protocol error behind this error, if any
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            IsoTpError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid protocol parameters
///
/// Raised at construction time. Values are never clamped into range.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The block size can be no more than 255, got {0}")]
    BlockSizeTooLarge(u32),

    #[error("The separation time must be no more than 127 milliseconds, got {0:?}")]
    SeparationTimeTooLarge(Duration),

    #[error("Failed to read parameters file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse parameters file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Malformed or oversized PDU
///
/// Decoding never yields a partial PDU; the offending frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Empty link frame")]
    EmptyFrame,

    #[error("Unknown frame type nibble 0x{0:X}")]
    UnknownFrameType(u8),

    #[error("Truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unknown flow status {0}")]
    InvalidFlowStatus(u8),

    #[error("Payload of {len} bytes exceeds frame capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("Sequence number {0} is out of range 0..=15")]
    InvalidSequenceNumber(u8),

    #[error("First frame chunk of {chunk} bytes exceeds declared length {total}")]
    LengthMismatch { chunk: usize, total: u32 },
}

/// Which wait ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No Flow-Control frame after a First Frame or a completed block
    FlowControl,
    /// No Consecutive Frame while reassembling
    ConsecutiveFrame,
    /// The peer kept answering with Wait beyond the configured limit
    WaitFrameLimit,
    /// Nothing arrived while waiting for a transfer to start
    NoMessage,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::FlowControl => write!(f, "flow control"),
            TimeoutKind::ConsecutiveFrame => write!(f, "consecutive frame"),
            TimeoutKind::WaitFrameLimit => write!(f, "wait frame limit"),
            TimeoutKind::NoMessage => write!(f, "no message"),
        }
    }
}

/// Transfer-level failure
///
/// Each of these aborts the transfer in progress and returns the affected
/// direction to idle. None of them is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("Peer reported buffer overflow")]
    Overflow,

    #[error("Inbound message of {declared} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { declared: u32, limit: u32 },

    #[error("A transfer is already in progress")]
    Busy,
}
