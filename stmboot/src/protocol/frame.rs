//! Wire-level framing for the STM32 UART bootloader (AN3155).
//!
//! Every exchange starts with a single opcode byte, after which the device
//! answers ACK or NACK. Multi-byte blocks that follow are terminated by an
//! XOR checksum:
//!
//! ```text
//! Address block:
//! +----+----+----+----+----------+
//! | A3 | A2 | A1 | A0 | A3^..^A0 |      big-endian address
//! +----+----+----+----+----------+
//!
//! Data block:
//! +-----+---------------+-------------------+
//! | N-1 |  N data bytes | (N-1)^D0^..^D(N-1)|
//! +-----+---------------+-------------------+
//!
//! Read length / erase count:
//! +-------+------------+
//! | value | 0xFF^value |
//! +-------+------------+
//! ```
//!
//! Nothing here performs I/O.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Acknowledge byte.
pub const ACK: u8 = 0x79;

/// Not-acknowledge byte.
pub const NACK: u8 = 0x1F;

/// Largest number of bytes a single read or write transaction carries.
pub const MAX_CHUNK: usize = 256;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Bootloader version (0x01).
    GetVersion = 0x01,

    /// Chip ID (0x02).
    GetId = 0x02,

    /// Read up to 256 bytes of memory (0x11).
    ReadMemory = 0x11,

    /// Jump to application code (0x21).
    Go = 0x21,

    /// Write up to 256 bytes of memory (0x31).
    WriteMemory = 0x31,

    /// Erase flash sectors (0x44).
    EraseMemory = 0x44,
}

impl Opcode {
    /// Opcode byte as sent on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Whether the command only reads device state and may be resent.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::GetVersion | Self::GetId)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetVersion => "GET_VERSION",
            Self::GetId => "GET_ID",
            Self::ReadMemory => "READ_MEMORY",
            Self::Go => "GO",
            Self::WriteMemory => "WRITE_MEMORY",
            Self::EraseMemory => "ERASE_MEMORY",
        };
        f.write_str(name)
    }
}

/// One unit of a multi-part command exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The opcode byte.
    Command,
    /// Address block.
    Address,
    /// Read-length block.
    Length,
    /// Write data block.
    Data,
    /// Erase sector-count block and the completion wait.
    Erase,
    /// Payload bytes produced by the device (version, id, memory).
    Response,
    /// Trailing ACK closing an identification exchange.
    Completion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Address => "address",
            Self::Length => "length",
            Self::Data => "data",
            Self::Erase => "erase",
            Self::Response => "response",
            Self::Completion => "completion",
        };
        f.write_str(name)
    }
}

/// Classification of a single handshake byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// `0x79`.
    Ack,
    /// `0x1F`.
    Nack,
    /// Anything else.
    Unexpected(u8),
}

impl Reply {
    /// Classify a byte received where a handshake was expected.
    pub fn classify(byte: u8) -> Self {
        match byte {
            ACK => Self::Ack,
            NACK => Self::Nack,
            other => Self::Unexpected(other),
        }
    }
}

/// Whether `byte` is the ACK value.
pub fn is_ack(byte: u8) -> bool {
    byte == ACK
}

/// Whether `byte` is the NACK value.
pub fn is_nack(byte: u8) -> bool {
    byte == NACK
}

/// Running XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Encode an address block: 4 big-endian bytes plus their XOR.
pub fn encode_address(addr: u32) -> [u8; 5] {
    let mut block = [0u8; 5];
    BigEndian::write_u32(&mut block[..4], addr);
    block[4] = xor_checksum(&block[..4]);
    block
}

/// Length byte (`len - 1`) for a 1..=256 byte block.
#[allow(clippy::cast_possible_truncation)] // Range checked before the cast
fn length_byte(len: usize) -> Result<u8> {
    if len == 0 || len > MAX_CHUNK {
        return Err(Error::PayloadTooLarge { len });
    }
    Ok((len - 1) as u8)
}

/// Encode a write data block: `N-1`, the bytes, then the XOR of everything before it.
pub fn encode_data(bytes: &[u8]) -> Result<Vec<u8>> {
    let n = length_byte(bytes.len())?;

    let mut buf = Vec::with_capacity(bytes.len() + 2);
    buf.push(n);
    buf.extend_from_slice(bytes);
    buf.push(xor_checksum(&buf));
    Ok(buf)
}

/// Encode the READ_MEMORY length block: `N-1` and its complement.
pub fn encode_read_length(len: usize) -> Result<[u8; 2]> {
    let n = length_byte(len)?;
    Ok([n, 0xFF ^ n])
}

/// Encode the ERASE_MEMORY sector-count block.
pub fn encode_erase_count(count: u8) -> [u8; 2] {
    [count, 0xFF ^ count]
}
