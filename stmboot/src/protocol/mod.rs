//! Bootloader protocol.
//!
//! - [`frame`]: byte-level blocks and checksums
//! - [`command`]: single-command exchanges with ACK handling
//! - [`transfer`]: chunked memory reads and writes
//! - [`erase`]: sector erase with completion polling

pub mod command;
pub mod erase;
pub mod frame;
pub mod transfer;

// Re-export common types
pub use command::{CommandConfig, CommandEngine};
pub use erase::{APP_SECTOR_COUNT, EraseConfig};
pub use frame::{ACK, MAX_CHUNK, NACK, Opcode, Reply, Stage};
pub use transfer::{Chunk, check_region, plan_chunks};
