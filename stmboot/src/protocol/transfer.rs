//! Chunked memory transfers.
//!
//! READ_MEMORY and WRITE_MEMORY move at most [`MAX_CHUNK`] bytes per
//! transaction. Larger regions are split into contiguous chunks that are
//! sent strictly in increasing address order, one transaction at a time.

use crate::error::{Error, Result};
use crate::event::{Event, Operation};
use crate::port::Port;
use crate::protocol::command::CommandEngine;
use crate::protocol::frame::{MAX_CHUNK, Opcode};
use log::{debug, info};
use std::ops::Range;

/// One transaction of a chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Device address of the first byte.
    pub address: u32,
    /// Offset range within the region.
    pub range: Range<usize>,
}

impl Chunk {
    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the chunk is empty (never true for planned chunks).
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Reject regions that run past the end of the 32-bit address space.
pub fn check_region(address: u32, length: usize) -> Result<()> {
    let end = u64::from(address) + length as u64;
    if end > 1 << 32 {
        return Err(Error::InvalidRange { address, length });
    }
    Ok(())
}

/// Split `length` bytes starting at `address` into transaction-sized chunks.
///
/// Fails with [`Error::InvalidRange`] if the region runs past the end of
/// the 32-bit address space.
#[allow(clippy::cast_possible_truncation)] // Offsets are bounded by the range check
pub fn plan_chunks(address: u32, length: usize) -> Result<Vec<Chunk>> {
    check_region(address, length)?;

    Ok((0..length)
        .step_by(MAX_CHUNK)
        .map(|offset| Chunk {
            address: address + offset as u32,
            range: offset..(offset + MAX_CHUNK).min(length),
        })
        .collect())
}

impl<P: Port> CommandEngine<'_, P> {
    /// Read `length` bytes starting at `address`.
    ///
    /// On failure the returned [`Error::Transfer`] carries every byte read
    /// before the failing chunk.
    pub fn read_region(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.read_region_as(Operation::Read, address, length)
    }

    /// Write `data` starting at `address`.
    ///
    /// The first failing chunk aborts the transfer. Flash contents are then
    /// undefined and the region should be erased before trying again.
    pub fn write_region(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let chunks = plan_chunks(address, data.len())?;
        let total = chunks.len();
        if total == 0 {
            debug!("Nothing to write at 0x{address:08X}");
            return Ok(());
        }

        info!(
            "Writing {} bytes to 0x{address:08X} in {total} chunks",
            data.len()
        );

        for (index, chunk) in chunks.iter().enumerate() {
            let result = if crate::is_interrupted_requested() {
                Err(Error::Cancelled)
            } else {
                self.write_chunk(chunk.address, &data[chunk.range.clone()])
            };

            if let Err(source) = result {
                return Err(Error::Transfer {
                    address: chunk.address,
                    chunk: index + 1,
                    total,
                    partial: Vec::new(),
                    source: Box::new(source),
                });
            }

            self.events.emit(Event::Progress {
                operation: Operation::Write,
                done: index + 1,
                total,
            });
        }

        info!("Wrote {} bytes", data.len());
        Ok(())
    }

    /// Read the region back and compare it with `expected`.
    pub fn verify_region(&mut self, address: u32, expected: &[u8]) -> Result<()> {
        let actual = self.read_region_as(Operation::Verify, address, expected.len())?;

        match expected
            .iter()
            .zip(&actual)
            .position(|(want, got)| want != got)
        {
            Some(offset) => {
                #[allow(clippy::cast_possible_truncation)] // Offset is inside a checked region
                let address = address + offset as u32;
                Err(Error::VerifyMismatch {
                    address,
                    expected: expected[offset],
                    actual: actual[offset],
                })
            },
            None => {
                info!("Verified {} bytes at 0x{address:08X}", expected.len());
                Ok(())
            },
        }
    }

    fn read_region_as(
        &mut self,
        operation: Operation,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>> {
        let chunks = plan_chunks(address, length)?;
        let total = chunks.len();
        let mut data = Vec::with_capacity(length);
        if total == 0 {
            return Ok(data);
        }

        info!("Reading {length} bytes from 0x{address:08X} in {total} chunks");

        for (index, chunk) in chunks.iter().enumerate() {
            let result = if crate::is_interrupted_requested() {
                Err(Error::Cancelled)
            } else {
                self.read_chunk(chunk.address, chunk.len())
            };

            match result {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(source) => {
                    return Err(Error::Transfer {
                        address: chunk.address,
                        chunk: index + 1,
                        total,
                        partial: data,
                        source: Box::new(source),
                    });
                },
            }

            self.events.emit(Event::Progress {
                operation,
                done: index + 1,
                total,
            });
        }

        Ok(data)
    }

    fn read_chunk(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        debug!("Reading {len} bytes at 0x{address:08X}");
        self.send_command(Opcode::ReadMemory)?;
        self.send_address_stage(Opcode::ReadMemory, address)?;
        self.send_read_length_stage(Opcode::ReadMemory, len)?;
        self.read_response(Opcode::ReadMemory, len)
    }

    fn write_chunk(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        debug!("Writing {} bytes at 0x{address:08X}", bytes.len());
        self.send_command(Opcode::WriteMemory)?;
        self.send_address_stage(Opcode::WriteMemory, address)?;
        self.send_data_stage(Opcode::WriteMemory, bytes)
    }
}
