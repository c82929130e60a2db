//! ERASE_MEMORY with completion polling.
//!
//! The device only acknowledges the sector-count block once the erase has
//! finished, which takes seconds. Rather than one long blocking read the
//! port timeout is shortened and the line is polled, so progress can be
//! reported and cancellation honoured while the flash is busy.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result, StageFailure};
use crate::event::Event;
use crate::port::{Port, ScopedTimeout};
use crate::protocol::command::{CommandEngine, stage_failed};
use crate::protocol::frame::{Opcode, Reply, Stage, encode_erase_count};

/// Sectors erased by default (sectors 2..=7, the application range).
pub const APP_SECTOR_COUNT: u8 = 6;

/// Highest percentage reported before the device confirms completion.
const ESTIMATE_CEILING: u8 = 90;

/// Erase timing parameters.
#[derive(Debug, Clone)]
pub struct EraseConfig {
    /// Number of sectors to erase.
    pub sector_count: u8,
    /// Expected erase time per sector, used for the progress estimate only.
    pub per_sector_estimate: Duration,
    /// Port timeout while polling for the final ACK.
    pub poll_interval: Duration,
    /// Give up after this long without an answer.
    pub max_wait: Duration,
}

impl Default for EraseConfig {
    fn default() -> Self {
        Self {
            sector_count: APP_SECTOR_COUNT,
            per_sector_estimate: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(20),
        }
    }
}

impl EraseConfig {
    /// Expected duration of the whole erase.
    pub fn estimated_duration(&self) -> Duration {
        self.per_sector_estimate * u32::from(self.sector_count)
    }

    /// Estimated progress after `elapsed`, capped below completion.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped to 0..=90
    pub fn progress_percent(&self, elapsed: Duration) -> u8 {
        let estimate = self.estimated_duration().as_secs_f64();
        if estimate <= 0.0 {
            return ESTIMATE_CEILING;
        }
        let percent = elapsed.as_secs_f64() / estimate * f64::from(ESTIMATE_CEILING);
        percent.min(f64::from(ESTIMATE_CEILING)) as u8
    }
}

impl<P: Port> CommandEngine<'_, P> {
    /// Erase the application sectors and wait for the device to finish.
    ///
    /// Never retried. A NACK or stray byte during polling is a stage
    /// failure; running past `max_wait` is [`Error::EraseTimeout`].
    pub fn erase_application_region(&mut self, config: &EraseConfig) -> Result<()> {
        info!(
            "Erasing {} sectors (estimated {:?})",
            config.sector_count,
            config.estimated_duration()
        );

        self.send_command(Opcode::EraseMemory)?;

        let events = self.events;
        events.emit(Event::StageStarted {
            opcode: Opcode::EraseMemory,
            stage: Stage::Erase,
        });
        self.port
            .write_all_bytes(&encode_erase_count(config.sector_count))?;

        let mut port = ScopedTimeout::new(&mut *self.port, config.poll_interval)?;
        let started = Instant::now();
        let mut reported = 0u8;

        loop {
            if crate::is_interrupted_requested() {
                warn!("Erase interrupted while the device is still busy");
                return Err(Error::Cancelled);
            }

            let poll_started = Instant::now();
            let reply = port.read_up_to(1)?;
            let failure = match reply.first().copied().map(Reply::classify) {
                Some(Reply::Ack) => {
                    events.emit(Event::EraseProgress { percent: 100 });
                    events.emit(Event::StageCompleted {
                        opcode: Opcode::EraseMemory,
                        stage: Stage::Erase,
                    });
                    info!("Erase complete after {:?}", started.elapsed());
                    return Ok(());
                },
                Some(Reply::Nack) => Some(StageFailure::Nack),
                Some(Reply::Unexpected(byte)) => Some(StageFailure::Unexpected(byte)),
                None => None,
            };
            if let Some(failure) = failure {
                return Err(stage_failed(events, Opcode::EraseMemory, Stage::Erase, failure));
            }

            let elapsed = started.elapsed();
            if elapsed > config.max_wait {
                warn!("No erase confirmation after {elapsed:?}");
                return Err(Error::EraseTimeout { elapsed });
            }

            let percent = config.progress_percent(elapsed).max(reported);
            if percent != reported {
                debug!("Erase {percent}%");
            }
            reported = percent;
            events.emit(Event::EraseProgress { percent });

            // Some drivers return immediately when idle
            if let Some(rest) = config.poll_interval.checked_sub(poll_started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSink;
    use crate::port::mock::MockPort;
    use crate::protocol::frame::{ACK, NACK};

    fn fast(max_wait: Duration) -> EraseConfig {
        EraseConfig {
            poll_interval: Duration::from_millis(1),
            max_wait,
            ..EraseConfig::default()
        }
    }

    fn erase_percents(rx: std::sync::mpsc::Receiver<Event>) -> Vec<u8> {
        rx.iter()
            .filter_map(|e| match e {
                Event::EraseProgress { percent } => Some(percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_progress_estimate() {
        let config = EraseConfig::default();
        assert_eq!(config.estimated_duration(), Duration::from_secs(12));
        assert_eq!(config.progress_percent(Duration::ZERO), 0);
        assert_eq!(config.progress_percent(Duration::from_secs(6)), 45);
        assert_eq!(config.progress_percent(Duration::from_secs(12)), 90);
        assert_eq!(config.progress_percent(Duration::from_secs(19)), 90);
    }

    #[test]
    fn test_erase_success_reports_completion() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).stall().stall().reply(&[ACK]);
        let (events, rx) = EventSink::channel();

        CommandEngine::new(&mut port, &events)
            .erase_application_region(&fast(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(port.written(), &[0x44, 0x06, 0xF9]);
        drop(events);
        let percents = erase_percents(rx);
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents[..percents.len() - 1].iter().all(|p| *p <= 90));
    }

    #[test]
    fn test_erase_restores_timeout() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[ACK]);
        let events = EventSink::none();
        let before = port.timeout();

        CommandEngine::new(&mut port, &events)
            .erase_application_region(&fast(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(port.timeout(), before);
        assert_eq!(port.timeouts(), &[Duration::from_millis(1), before]);
    }

    #[test]
    fn test_erase_timeout_is_distinct_from_nack() {
        let mut port = MockPort::new();
        port.reply(&[ACK]);
        let events = EventSink::none();
        let before = port.timeout();

        let err = CommandEngine::new(&mut port, &events)
            .erase_application_region(&fast(Duration::from_millis(30)))
            .unwrap_err();

        assert!(matches!(err, Error::EraseTimeout { .. }));
        assert!(!err.is_nack());
        assert_eq!(port.timeout(), before);
    }

    #[test]
    fn test_erase_nack_during_polling() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).stall().reply(&[NACK]);
        let events = EventSink::none();

        let err = CommandEngine::new(&mut port, &events)
            .erase_application_region(&fast(Duration::from_secs(5)))
            .unwrap_err();

        assert!(err.is_nack());
        assert!(matches!(
            err,
            Error::Stage {
                opcode: Opcode::EraseMemory,
                stage: Stage::Erase,
                ..
            }
        ));
    }

    #[test]
    fn test_erase_command_nack_sends_no_count() {
        let mut port = MockPort::new();
        port.reply(&[NACK]);
        let events = EventSink::none();

        let err = CommandEngine::new(&mut port, &events)
            .erase_application_region(&EraseConfig::default())
            .unwrap_err();

        assert!(err.is_nack());
        assert_eq!(port.written(), &[0x44]);
        assert!(port.timeouts().is_empty());
    }

    #[test]
    fn test_erase_stray_byte_aborts() {
        let mut port = MockPort::new();
        port.reply(&[ACK]).reply(&[0x00]);
        let events = EventSink::none();

        let err = CommandEngine::new(&mut port, &events)
            .erase_application_region(&fast(Duration::from_secs(5)))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Stage {
                failure: StageFailure::Unexpected(0x00),
                ..
            }
        ));
    }
}
