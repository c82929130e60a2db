//! Single-command exchanges.
//!
//! [`CommandEngine`] borrows a port for the duration of one logical
//! operation and drives the stage-by-stage handshake of each command:
//!
//! ```text
//! host                         device
//!  | -- opcode ------------------> |
//!  | <------------------ ACK/NACK  |
//!  | -- block + checksum --------> |   (address / length / data)
//!  | <------------------ ACK/NACK  |
//!  | <------------- response bytes |   (version / id / memory)
//!  | <---------------------- ACK   |   (identification only)
//! ```
//!
//! Only GET_VERSION and GET_ID are resent on failure. Writes, erases and
//! GO may already have been partly consumed by the device, so a failed
//! stage is always surfaced as is.

use crate::error::{Error, Result, StageFailure};
use crate::event::{Event, EventSink};
use crate::port::Port;
use crate::protocol::frame::{
    Opcode, Reply, Stage, encode_address, encode_data, encode_read_length,
};
use crate::target::{BootloaderVersion, ChipIdentity};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Total attempts for identification commands.
pub const IDENTIFY_ATTEMPTS: u32 = 3;

/// Pause before an identification opcode is resent.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retry policy for identification commands.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    /// Delay before each resend.
    pub retry_delay: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_attempts: IDENTIFY_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Executes bootloader commands over a borrowed port.
pub struct CommandEngine<'a, P: Port> {
    pub(crate) port: &'a mut P,
    pub(crate) events: &'a EventSink,
    config: CommandConfig,
}

impl<'a, P: Port> CommandEngine<'a, P> {
    /// Create an engine with the default retry policy.
    pub fn new(port: &'a mut P, events: &'a EventSink) -> Self {
        Self::with_config(port, events, CommandConfig::default())
    }

    /// Create an engine with a custom retry policy.
    pub fn with_config(port: &'a mut P, events: &'a EventSink, config: CommandConfig) -> Self {
        Self {
            port,
            events,
            config,
        }
    }

    /// Send a bare opcode and wait for its ACK. Never retried.
    pub fn send_command(&mut self, opcode: Opcode) -> Result<()> {
        self.send_stage(opcode, Stage::Command, &[opcode.byte()])
    }

    /// Send an address block and wait for its ACK.
    pub fn send_address_stage(&mut self, opcode: Opcode, address: u32) -> Result<()> {
        self.send_stage(opcode, Stage::Address, &encode_address(address))
    }

    /// Send a write data block and wait for its ACK.
    ///
    /// Oversized or empty payloads are rejected before anything is written.
    pub fn send_data_stage(&mut self, opcode: Opcode, bytes: &[u8]) -> Result<()> {
        let block = encode_data(bytes)?;
        self.send_stage(opcode, Stage::Data, &block)
    }

    /// Send the READ_MEMORY length block and wait for its ACK.
    pub fn send_read_length_stage(&mut self, opcode: Opcode, len: usize) -> Result<()> {
        let block = encode_read_length(len)?;
        self.send_stage(opcode, Stage::Length, &block)
    }

    /// Read exactly `len` payload bytes produced by the device.
    pub fn read_response(&mut self, opcode: Opcode, len: usize) -> Result<Vec<u8>> {
        let received = self.port.read_up_to(len)?;
        if received.len() == len {
            return Ok(received);
        }

        let failure = if received.is_empty() {
            StageFailure::Timeout
        } else {
            StageFailure::ShortRead {
                expected: len,
                received,
            }
        };
        Err(stage_failed(self.events, opcode, Stage::Response, failure))
    }

    /// Read GET_VERSION.
    pub fn get_version(&mut self) -> Result<BootloaderVersion> {
        self.send_identification(Opcode::GetVersion)?;

        let raw = self.read_response(Opcode::GetVersion, 1)?;
        let version = BootloaderVersion::from_raw(raw[0]);
        debug!("Bootloader version byte 0x{:02X} ({version})", raw[0]);

        self.expect_trailing_ack(Opcode::GetVersion)?;
        Ok(version)
    }

    /// Read GET_ID and resolve the chip name.
    pub fn get_id(&mut self) -> Result<ChipIdentity> {
        self.send_identification(Opcode::GetId)?;

        let raw = self.read_response(Opcode::GetId, 4)?;
        let chip = ChipIdentity::new(BigEndian::read_u32(&raw));
        debug!("Chip id {chip}");

        self.expect_trailing_ack(Opcode::GetId)?;
        Ok(chip)
    }

    /// Jump to the application at `address`.
    ///
    /// Success is the ACK of the address block; the device may leave the
    /// bootloader right after it, so nothing further is read.
    pub fn go(&mut self, address: u32) -> Result<()> {
        info!("Starting application at 0x{address:08X}");
        self.send_command(Opcode::Go)?;
        self.send_address_stage(Opcode::Go, address)
    }

    /// Send an identification opcode, resending it on NACK, timeout or noise.
    fn send_identification(&mut self, opcode: Opcode) -> Result<()> {
        self.port.reset_input_buffer()?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_command(opcode) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_attempts && !e.is_transport() => {
                    attempt += 1;
                    warn!("{opcode} not acknowledged ({e}), retrying ({attempt}/{max_attempts})");
                    self.events.emit(Event::Retry {
                        opcode,
                        attempt,
                        max_attempts,
                    });
                    thread::sleep(self.config.retry_delay);
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume the ACK that closes an identification reply.
    ///
    /// The payload has already been read at this point, so a missing or
    /// wrong byte is only reported. Link failures still propagate.
    fn expect_trailing_ack(&mut self, opcode: Opcode) -> Result<()> {
        match self.expect_ack(opcode, Stage::Completion) {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                warn!("{e}; keeping the value already received");
                self.events.emit(Event::Warning {
                    message: e.to_string(),
                });
                Ok(())
            },
        }
    }

    /// Write one stage and wait for the device to acknowledge it.
    fn send_stage(&mut self, opcode: Opcode, stage: Stage, bytes: &[u8]) -> Result<()> {
        trace!("{opcode} {stage}: {} bytes", bytes.len());
        self.events.emit(Event::StageStarted { opcode, stage });
        self.port.write_all_bytes(bytes)?;
        self.expect_ack(opcode, stage)
    }

    fn expect_ack(&mut self, opcode: Opcode, stage: Stage) -> Result<()> {
        let reply = self.port.read_up_to(1)?;
        let failure = match reply.first().copied().map(Reply::classify) {
            Some(Reply::Ack) => {
                trace!("{opcode} {stage}: ACK");
                self.events.emit(Event::StageCompleted { opcode, stage });
                return Ok(());
            },
            Some(Reply::Nack) => StageFailure::Nack,
            Some(Reply::Unexpected(byte)) => StageFailure::Unexpected(byte),
            None => StageFailure::Timeout,
        };
        Err(stage_failed(self.events, opcode, stage, failure))
    }
}

/// Log and publish a stage failure, returning the matching error.
pub(crate) fn stage_failed(
    events: &EventSink,
    opcode: Opcode,
    stage: Stage,
    failure: StageFailure,
) -> Error {
    let err = Error::stage(opcode, stage, failure);
    debug!("{err}");
    events.emit(Event::StageFailed {
        opcode,
        stage,
        reason: err.to_string(),
    });
    err
}
