//! Error types for stmboot.

use crate::protocol::frame::{Opcode, Stage};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for stmboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single protocol stage did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// The device answered with NACK (`0x1F`).
    Nack,
    /// Nothing arrived before the read timeout.
    Timeout,
    /// The device answered with a byte that is neither ACK nor NACK.
    Unexpected(u8),
    /// Fewer bytes than the stage requires arrived before the timeout.
    ShortRead {
        /// Number of bytes the stage needed.
        expected: usize,
        /// Bytes actually received.
        received: Vec<u8>,
    },
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nack => write!(f, "NACK (last byte: 0x1F)"),
            Self::Timeout => write!(f, "timeout (last byte: none)"),
            Self::Unexpected(byte) => write!(f, "unexpected byte (last byte: 0x{byte:02X})"),
            Self::ShortRead { expected, received } => {
                write!(
                    f,
                    "short read: expected {expected} bytes, got {}",
                    received.len()
                )?;
                match received.last() {
                    Some(byte) => write!(f, " (last byte: 0x{byte:02X})"),
                    None => write!(f, " (last byte: none)"),
                }
            },
        }
    }
}

/// Step of a reconnect attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Closing the previous transport.
    Close,
    /// Reopening the transport.
    Open,
    /// Liveness check on the reopened transport.
    Liveness,
}

impl fmt::Display for ReconnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Close => write!(f, "close"),
            Self::Open => write!(f, "open"),
            Self::Liveness => write!(f, "liveness check"),
        }
    }
}

/// Error type for stmboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A protocol stage was rejected or not answered.
    #[error("{opcode} {stage} stage failed: {failure}")]
    Stage {
        /// Command being executed.
        opcode: Opcode,
        /// Stage that failed.
        stage: Stage,
        /// What went wrong.
        failure: StageFailure,
    },

    /// Payload outside the 1..=256 bytes a single block can carry.
    #[error("Payload of {len} bytes does not fit a block (1..=256 bytes)")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
    },

    /// A chunked memory transfer stopped at a chunk.
    #[error("Transfer failed at chunk {chunk}/{total} (0x{address:08X}): {source}")]
    Transfer {
        /// Start address of the failing chunk.
        address: u32,
        /// One-based index of the failing chunk.
        chunk: usize,
        /// Total number of chunks in the transfer.
        total: usize,
        /// Bytes read before the failure (always empty for writes).
        partial: Vec<u8>,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The device did not report erase completion in time.
    #[error("Erase did not complete within {elapsed:?}")]
    EraseTimeout {
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// Region does not fit the 32-bit address space.
    #[error("Region 0x{address:08X} + {length} bytes exceeds the address space")]
    InvalidRange {
        /// Start address.
        address: u32,
        /// Requested length.
        length: usize,
    },

    /// Read-back data differs from what was written.
    #[error("Verify failed at 0x{address:08X}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    VerifyMismatch {
        /// First mismatching address.
        address: u32,
        /// Expected byte.
        expected: u8,
        /// Byte read back.
        actual: u8,
    },

    /// Opening the transport failed.
    #[error("Failed to open {endpoint}: {source}")]
    Connect {
        /// Endpoint identifier.
        endpoint: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Reconnect failed at a given step.
    #[error("Reconnect failed during {step}: {source}")]
    Reconnect {
        /// Step that failed.
        step: ReconnectStep,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// No transport is open.
    #[error("Not connected")]
    NotConnected,

    /// Operation interrupted by the embedding application.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a stage failure.
    pub(crate) fn stage(opcode: Opcode, stage: Stage, failure: StageFailure) -> Self {
        Self::Stage {
            opcode,
            stage,
            failure,
        }
    }

    /// Innermost error, looking through transfer and connection wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Transfer { source, .. }
            | Self::Connect { source, .. }
            | Self::Reconnect { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the device explicitly rejected a stage.
    pub fn is_nack(&self) -> bool {
        matches!(
            self.root(),
            Self::Stage {
                failure: StageFailure::Nack,
                ..
            }
        )
    }

    /// Whether the device failed to answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Self::Stage {
                failure: StageFailure::Timeout | StageFailure::ShortRead { .. },
                ..
            } | Self::EraseTimeout { .. }
        )
    }

    /// Whether this is a link-level failure of the transport itself.
    pub fn is_transport(&self) -> bool {
        match self.root() {
            Self::Io(_) | Self::NotConnected => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}
