//! Connection lifecycle and the operations callers use.
//!
//! A [`Session`] owns at most one open port. Identification and reads are
//! preceded by a liveness check, and a dead link gets exactly one
//! reconnect before the operation runs. Mutating commands (write, erase,
//! GO) carry no probe traffic of their own: they flush stale input, or
//! reconnect first when an earlier failure left the session degraded.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stmboot::Session;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let mut session = Session::open("/dev/ttyUSB0", 115200)?;
//!
//!         let info = session.identify()?;
//!         println!("{info}");
//!
//!         session.erase()?;
//!         session.write_memory(0x0800_8000, &std::fs::read("app.bin")?)?;
//!         session.go(0x0800_8000)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, ReconnectStep, Result};
use crate::event::{Event, EventSink};
use crate::port::{Port, PortOpener, SerialConfig};
use crate::protocol::command::{CommandConfig, CommandEngine};
use crate::protocol::erase::EraseConfig;
use crate::protocol::transfer::check_region;
use crate::target::{BootloaderVersion, ChipIdentity};

/// Pause between closing and reopening the port on reconnect.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port is open.
    Disconnected,
    /// Port open and idle.
    Connected,
    /// A command is in flight.
    Busy,
    /// A liveness or transport failure was seen; a reconnect is due.
    Degraded,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Busy => write!(f, "busy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Retry policy for identification commands.
    pub command: CommandConfig,
    /// Erase sector count and timing.
    pub erase: EraseConfig,
    /// Pause between close and reopen on reconnect.
    pub settle_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command: CommandConfig::default(),
            erase: EraseConfig::default(),
            settle_delay: SETTLE_DELAY,
        }
    }
}

impl SessionOptions {
    /// Set the number of sectors erased by [`Session::erase`].
    #[must_use]
    pub fn with_erase_sectors(mut self, sector_count: u8) -> Self {
        self.erase.sector_count = sector_count;
        self
    }
}

/// Bootloader version and chip identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// GET_VERSION result.
    pub version: BootloaderVersion,
    /// GET_ID result.
    pub chip: ChipIdentity,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bootloader {}, chip {}", self.version, self.chip)
    }
}

/// An open connection to the bootloader.
///
/// Generic over the [`PortOpener`] so the same session logic runs on a real
/// serial port or on a scripted one.
pub struct Session<O: PortOpener> {
    opener: O,
    config: SerialConfig,
    port: Option<O::Port>,
    state: SessionState,
    options: SessionOptions,
    events: EventSink,
}

impl<O: PortOpener> Session<O> {
    /// Open the port described by `config`.
    ///
    /// The bootloader is not probed; the first identification or read does
    /// that.
    pub fn connect(mut opener: O, config: SerialConfig, options: SessionOptions) -> Result<Self> {
        info!(
            "Opening {} at {} baud",
            config.port_name, config.baud_rate
        );

        let port = opener.open(&config).map_err(|e| Error::Connect {
            endpoint: config.port_name.clone(),
            source: Box::new(e),
        })?;

        Ok(Self {
            opener,
            config,
            port: Some(port),
            state: SessionState::Connected,
            options,
            events: EventSink::none(),
        })
    }

    /// Publish events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serial configuration used to (re)open the port.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Session tunables.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Whether a port is currently open.
    pub fn is_connected(&self) -> bool {
        self.port.as_ref().is_some_and(Port::is_open)
    }

    /// Run a GET_VERSION exchange and report whether it succeeded.
    ///
    /// The reply is discarded. A failure marks the session degraded.
    pub fn check_alive(&mut self) -> bool {
        match self.probe() {
            Ok(()) => true,
            Err(e) => {
                warn!("Liveness check failed: {e}");
                if self.port.is_some() {
                    self.set_state(SessionState::Degraded);
                }
                false
            },
        }
    }

    /// Close the port, wait for the device to settle, reopen and probe it.
    pub fn reconnect(&mut self) -> Result<()> {
        info!("Reconnecting to {}", self.config.port_name);

        if let Some(mut port) = self.port.take() {
            self.set_state(SessionState::Disconnected);
            port.close().map_err(|e| Error::Reconnect {
                step: ReconnectStep::Close,
                source: Box::new(e),
            })?;
        }

        thread::sleep(self.options.settle_delay);

        let port = self.opener.open(&self.config).map_err(|e| Error::Reconnect {
            step: ReconnectStep::Open,
            source: Box::new(e),
        })?;
        self.port = Some(port);
        self.set_state(SessionState::Connected);

        if let Err(e) = self.probe() {
            self.set_state(SessionState::Degraded);
            return Err(Error::Reconnect {
                step: ReconnectStep::Liveness,
                source: Box::new(e),
            });
        }

        info!("Reconnected to {}", self.config.port_name);
        Ok(())
    }

    /// Read the bootloader version.
    ///
    /// A dead link is reconnected once first; if that fails the
    /// [`Error::Reconnect`] is returned instead of running the command.
    pub fn get_version(&mut self) -> Result<BootloaderVersion> {
        self.ensure_alive()?;
        self.with_engine(|engine| engine.get_version())
    }

    /// Read the chip identity.
    pub fn get_id(&mut self) -> Result<ChipIdentity> {
        self.ensure_alive()?;
        self.with_engine(|engine| engine.get_id())
    }

    /// Read the bootloader version and chip identity.
    pub fn identify(&mut self) -> Result<DeviceInfo> {
        self.ensure_alive()?;
        let info = self.with_engine(|engine| {
            Ok(DeviceInfo {
                version: engine.get_version()?,
                chip: engine.get_id()?,
            })
        })?;
        info!("Found {info}");
        Ok(info)
    }

    /// Read `length` bytes starting at `address`.
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        check_region(address, length)?;
        if length == 0 {
            return Ok(Vec::new());
        }
        self.ensure_alive()?;
        self.with_engine(|engine| engine.read_region(address, length))
    }

    /// Write `data` starting at `address`. The region must already be erased.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_region(address, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.resync()?;
        self.with_engine(|engine| engine.write_region(address, data))
    }

    /// Read the region back and compare it with `expected`.
    pub fn verify_memory(&mut self, address: u32, expected: &[u8]) -> Result<()> {
        check_region(address, expected.len())?;
        if expected.is_empty() {
            return Ok(());
        }
        self.ensure_alive()?;
        self.with_engine(|engine| engine.verify_region(address, expected))
    }

    /// Erase the application sectors.
    ///
    /// Cancelling while the device is still erasing leaves its completion
    /// ACK on the line, so the session is marked degraded and the next
    /// command reconnects first.
    pub fn erase(&mut self) -> Result<()> {
        self.resync()?;
        let config = self.options.erase.clone();
        let result = self.with_engine(|engine| engine.erase_application_region(&config));
        if matches!(result, Err(Error::Cancelled)) {
            self.set_state(SessionState::Degraded);
        }
        result
    }

    /// Start the application at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.resync()?;
        self.with_engine(|engine| engine.go(address))
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            debug!("Closing {}", port.name());
            self.set_state(SessionState::Disconnected);
            port.close()?;
        }
        Ok(())
    }

    /// Probe the link and reconnect once if it is dead.
    ///
    /// If the reconnect fails the caller gets that [`Error::Reconnect`],
    /// whose source is the failure of the failing step, and the operation
    /// is not attempted.
    fn ensure_alive(&mut self) -> Result<()> {
        if self.check_alive() {
            return Ok(());
        }
        self.reconnect()
    }

    /// Get the line back in step before a mutating command.
    ///
    /// A degraded session is reconnected; otherwise stale input is dropped.
    fn resync(&mut self) -> Result<()> {
        if self.state == SessionState::Degraded {
            warn!("Session degraded, reconnecting before the next command");
            return self.reconnect();
        }
        match self.port.as_mut() {
            Some(port) => port.reset_input_buffer(),
            None => Err(Error::NotConnected),
        }
    }

    fn probe(&mut self) -> Result<()> {
        self.with_engine(|engine| engine.get_version()).map(|version| {
            debug!("Device alive, bootloader {version}");
        })
    }

    /// Run `op` with a command engine on the open port, tracking state.
    fn with_engine<T>(
        &mut self,
        op: impl FnOnce(&mut CommandEngine<'_, O::Port>) -> Result<T>,
    ) -> Result<T> {
        if self.port.is_none() {
            return Err(Error::NotConnected);
        }
        self.set_state(SessionState::Busy);

        let result = match self.port.as_mut() {
            Some(port) => {
                let mut engine =
                    CommandEngine::with_config(port, &self.events, self.options.command.clone());
                op(&mut engine)
            },
            None => Err(Error::NotConnected),
        };

        match &result {
            Err(e) if e.is_transport() || e.is_timeout() => {
                self.set_state(SessionState::Degraded);
            },
            _ => self.set_state(SessionState::Connected),
        }
        result
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {} -> {state}", self.state);
            self.state = state;
            self.events.emit(Event::StateChanged(state));
        }
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{Session, SessionOptions};
    use crate::error::Result;
    use crate::port::{NativeOpener, SerialConfig};

    impl Session<NativeOpener> {
        /// Open a native serial port with default settings.
        ///
        /// # Arguments
        ///
        /// * `port_name` - Serial port name (e.g., "/dev/ttyUSB0" or "COM3")
        /// * `baud_rate` - Baud rate the bootloader listens on
        pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
            Self::open_with(SerialConfig::new(port_name, baud_rate), SessionOptions::default())
        }

        /// Open a native serial port with explicit settings.
        pub fn open_with(config: SerialConfig, options: SessionOptions) -> Result<Self> {
            Self::connect(NativeOpener, config, options)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockOpener, MockPort};
    use crate::protocol::frame::{ACK, NACK};

    fn fast() -> SessionOptions {
        SessionOptions {
            command: CommandConfig {
                max_attempts: 3,
                retry_delay: Duration::from_millis(1),
            },
            erase: EraseConfig {
                poll_interval: Duration::from_millis(1),
                ..EraseConfig::default()
            },
            settle_delay: Duration::from_millis(1),
        }
    }

    fn alive() -> MockPort {
        let mut port = MockPort::new();
        port.reply(&[ACK, 0x31, ACK]);
        port
    }

    fn session(ports: impl IntoIterator<Item = Option<MockPort>>) -> Session<MockOpener> {
        Session::connect(
            MockOpener::new(ports),
            SerialConfig::new("/dev/ttyMOCK", 115200),
            fast(),
        )
        .unwrap()
    }

    fn port_of(session: &Session<MockOpener>) -> &MockPort {
        session.port.as_ref().unwrap()
    }

    #[test]
    fn test_connect_failure_names_endpoint() {
        let err = Session::connect(
            MockOpener::new([None]),
            SerialConfig::new("/dev/ttyNONE", 115200),
            fast(),
        )
        .err()
        .unwrap();

        match &err {
            Error::Connect { endpoint, .. } => assert_eq!(endpoint, "/dev/ttyNONE"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_transport());
    }

    #[test]
    fn test_connect_does_not_probe() {
        let session = session([Some(MockPort::new())]);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_connected());
        assert!(port_of(&session).written().is_empty());
    }

    #[test]
    fn test_check_alive() {
        let mut ok = session([Some(alive())]);
        assert!(ok.check_alive());
        assert_eq!(ok.state(), SessionState::Connected);

        let mut dead = session([Some(MockPort::new())]);
        assert!(!dead.check_alive());
        assert_eq!(dead.state(), SessionState::Degraded);
        assert_eq!(port_of(&dead).written(), &[0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_read_reconnects_once_then_runs() {
        let mut fresh = alive();
        fresh.reply(&[ACK]).reply(&[ACK]).reply(&[ACK]).reply(&[0xDE, 0xAD]);
        let mut session = session([Some(MockPort::new()), Some(fresh)]);

        let data = session.read_memory(0x0800_0000, 2).unwrap();

        assert_eq!(data, vec![0xDE, 0xAD]);
        assert_eq!(session.opener.opened.len(), 2);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_reconnect_open_failure() {
        let mut session = session([Some(MockPort::new()), None]);

        let err = session.get_version().unwrap_err();

        assert!(matches!(
            err,
            Error::Reconnect {
                step: ReconnectStep::Open,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_reconnect_liveness_failure() {
        let mut session = session([Some(MockPort::new()), Some(MockPort::new())]);

        let err = session.get_id().unwrap_err();

        assert!(matches!(
            err,
            Error::Reconnect {
                step: ReconnectStep::Liveness,
                ..
            }
        ));
        assert!(err.is_timeout());
        assert_eq!(session.state(), SessionState::Degraded);
    }

    #[test]
    fn test_identify() {
        let mut port = alive();
        port.reply(&[ACK, 0x31, ACK]);
        port.reply(&[ACK, 0x00, 0x00, 0x04, 0x13, ACK]);
        let mut session = session([Some(port)]);

        let info = session.identify().unwrap();

        assert_eq!(info.version.raw(), 0x31);
        assert_eq!(info.chip.id, 0x0413);
        assert_eq!(
            info.to_string(),
            "bootloader 3.1, chip 0x00000413 (STM32F405/407/415/417)"
        );
    }

    #[test]
    fn test_write_sends_no_probe() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[ACK]).reply(&[ACK]);
        let mut session = session([Some(port)]);

        session.write_memory(0x0800_8000, &[1, 2, 3, 4]).unwrap();

        let written = port_of(&session).written();
        assert_eq!(written[0], 0x31);
        assert_eq!(&written[6..], &[0x03, 1, 2, 3, 4, 0x07]);
    }

    #[test]
    fn test_empty_transfers_do_no_io() {
        let mut session = session([Some(MockPort::new())]);

        assert!(session.read_memory(0x0800_0000, 0).unwrap().is_empty());
        session.write_memory(0x0800_0000, &[]).unwrap();

        assert!(port_of(&session).written().is_empty());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_invalid_range_rejected_before_io() {
        let mut session = session([Some(MockPort::new())]);

        let err = session.read_memory(0xFFFF_FFF0, 32).unwrap_err();

        assert!(matches!(err, Error::InvalidRange { .. }));
        assert!(port_of(&session).written().is_empty());
    }

    #[test]
    fn test_operations_require_open_port() {
        let mut session = session([Some(MockPort::new())]);
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert!(matches!(session.go(0x0800_8000), Err(Error::NotConnected)));
        assert!(matches!(session.erase(), Err(Error::NotConnected)));
        assert!(matches!(
            session.write_memory(0x0800_8000, &[0]),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_state_after_failures() {
        let mut port = MockPort::new();
        port.reply(&[NACK]);
        let mut session = session([Some(port)]);

        assert!(session.go(0x0800_8000).unwrap_err().is_nack());
        assert_eq!(session.state(), SessionState::Connected);

        assert!(session.go(0x0800_8000).unwrap_err().is_timeout());
        assert_eq!(session.state(), SessionState::Degraded);
    }

    #[test]
    fn test_state_events() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[ACK]);
        let (events, rx) = EventSink::channel();
        let mut session = session([Some(port)]).with_events(events);

        session.go(0x0800_8000).unwrap();
        drop(session);

        let states: Vec<SessionState> = rx
            .iter()
            .filter_map(|e| match e {
                Event::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::Busy, SessionState::Connected]);
    }

    #[test]
    fn test_write_after_short_read_reconnects() {
        let mut stale = alive();
        stale.reply(&[ACK]).reply(&[ACK]).reply(&[ACK]);
        stale.reply(&[0xAA]).stall().reply(&[0xBB]);
        let mut fresh = alive();
        fresh.reply(&[ACK]).reply(&[ACK]).reply(&[ACK]);
        let mut session = session([Some(stale), Some(fresh)]);

        let err = session.read_memory(0x0800_0000, 2).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(session.state(), SessionState::Degraded);

        session.write_memory(0x0800_8000, &[1, 2, 3, 4]).unwrap();

        assert_eq!(session.opener.opened.len(), 2);
        assert_eq!(session.state(), SessionState::Connected);
        let written = port_of(&session).written();
        assert_eq!(&written[..2], &[0x01, 0x31]);
        assert_eq!(port_of(&session).pending(), 0);
    }

    #[test]
    fn test_mutation_flushes_stale_input() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[ACK]);
        let mut session = session([Some(port)]);

        session.go(0x0800_8000).unwrap();

        assert_eq!(port_of(&session).input_resets(), 1);
        assert_eq!(session.opener.opened.len(), 1);
    }

    #[test]
    fn test_cancelled_erase_degrades_session() {
        let mut busy = MockPort::new();
        // Command ACK, then the completion ACK that arrives after cancelling
        busy.reply(&[ACK]).reply(&[ACK]);
        let mut fresh = alive();
        fresh.reply(&[ACK]).reply(&[ACK]).reply(&[ACK]);
        let mut session = session([Some(busy), Some(fresh)]);

        crate::test_set_interrupted(true);
        let err = session.erase().unwrap_err();
        crate::test_set_interrupted(false);

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(session.state(), SessionState::Degraded);

        session.write_memory(0x0800_8000, &[1, 2, 3, 4]).unwrap();

        assert_eq!(session.opener.opened.len(), 2);
        assert_eq!(port_of(&session).pending(), 0);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_erase_uses_configured_sector_count() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[ACK]);
        let options = fast().with_erase_sectors(2);
        let mut session = Session::connect(
            MockOpener::new([Some(port)]),
            SerialConfig::new("/dev/ttyMOCK", 115200),
            options,
        )
        .unwrap();

        session.erase().unwrap();

        assert_eq!(port_of(&session).written(), &[0x44, 0x02, 0xFD]);
    }
}
