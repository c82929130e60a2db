//! # stmboot
//!
//! A host-side library for the STM32 UART bootloader protocol.
//!
//! This crate talks to a device sitting in its serial bootloader and
//! provides:
//!
//! - Byte-exact command framing with XOR checksums
//! - Identification (bootloader version, chip id) with bounded retries
//! - Chunked memory reads and writes of arbitrary regions
//! - Application-sector erase with completion polling
//! - Liveness checks and reconnect after the device resets
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - Anything else that implements [`port::Port`]
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use stmboot::{Session, SerialConfig, SessionOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let config = SerialConfig::new("/dev/ttyUSB0", 115200);
//!         let mut session = Session::open_with(config, SessionOptions::default())?;
//!
//!         let info = session.identify()?;
//!         println!("Connected: {info}");
//!
//!         let firmware = std::fs::read("app.bin")?;
//!         session.erase()?;
//!         session.write_memory(0x0800_8000, &firmware)?;
//!         session.verify_memory(0x0800_8000, &firmware)?;
//!         session.go(0x0800_8000)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod event;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). It is polled
/// between transfer chunks and between erase polls. Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
thread_local! {
    static TEST_INTERRUPTED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Request interruption for the calling test thread only.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| {
        set_interrupt_checker(|| TEST_INTERRUPTED.with(std::cell::Cell::get));
    });
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
pub use {
    error::{Error, ReconnectStep, Result, StageFailure},
    event::{Event, EventSink, Operation},
    port::{Parity, Port, PortOpener, ScopedTimeout, SerialConfig},
    protocol::{CommandConfig, CommandEngine, EraseConfig, Opcode, Stage},
    session::{DeviceInfo, Session, SessionOptions, SessionState},
    target::{BootloaderVersion, ChipIdentity, ChipModel},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_flag_is_per_thread() {
        test_set_interrupted(true);
        let other = std::thread::spawn(|| {
            test_set_interrupted(false);
            is_interrupted_requested()
        })
        .join()
        .unwrap();
        assert!(!other);
        assert!(is_interrupted_requested());
        test_set_interrupted(false);
    }
}
