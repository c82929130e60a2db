//! Structured progress and status notifications.
//!
//! The engine never waits on whoever consumes these: events go through an
//! unbounded [`std::sync::mpsc`] channel and a dropped receiver is ignored.
//!
//! ```rust,no_run
//! use stmboot::event::{Event, EventSink};
//!
//! let (sink, events) = EventSink::channel();
//! // hand `sink` to a Session, then on another thread:
//! for event in events {
//!     if let Event::Progress { done, total, .. } = event {
//!         println!("{done}/{total}");
//!     }
//! }
//! # drop(sink);
//! ```

use std::sync::mpsc::{self, Receiver, Sender};

use crate::protocol::frame::{Opcode, Stage};
use crate::session::SessionState;

/// Multi-chunk operation a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Reading memory.
    Read,
    /// Writing memory.
    Write,
    /// Reading memory back for comparison.
    Verify,
}

/// Notification emitted by the protocol engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A stage is about to be sent.
    StageStarted {
        /// Command in progress.
        opcode: Opcode,
        /// Stage being sent.
        stage: Stage,
    },
    /// A stage was acknowledged.
    StageCompleted {
        /// Command in progress.
        opcode: Opcode,
        /// Acknowledged stage.
        stage: Stage,
    },
    /// A stage failed; `reason` carries the rendered failure.
    StageFailed {
        /// Command in progress.
        opcode: Opcode,
        /// Failing stage.
        stage: Stage,
        /// Human-readable failure, including the last byte observed.
        reason: String,
    },
    /// An identification command is being resent.
    Retry {
        /// Command being retried.
        opcode: Opcode,
        /// Attempt about to be made (2 or 3).
        attempt: u32,
        /// Attempt limit.
        max_attempts: u32,
    },
    /// A soft failure that did not abort the operation.
    Warning {
        /// Description.
        message: String,
    },
    /// A chunk of a multi-chunk transfer completed.
    Progress {
        /// Operation in progress.
        operation: Operation,
        /// Chunks completed.
        done: usize,
        /// Total chunks.
        total: usize,
    },
    /// Estimated erase progress (0..=100); 100 only once the device ACKs.
    EraseProgress {
        /// Percentage estimate.
        percent: u8,
    },
    /// The session changed state.
    StateChanged(SessionState),
}

impl Event {
    /// Fraction of work done, for progress-type events.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f32> {
        match self {
            Self::Progress { done, total, .. } if *total > 0 => {
                Some(*done as f32 / *total as f32)
            },
            Self::EraseProgress { percent } => Some(f32::from(*percent) / 100.0),
            _ => None,
        }
    }
}

/// Sending half of the event stream. Cloning shares the same channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<Event>>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Create a connected sink/receiver pair.
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Emit an event without blocking.
    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            // A receiver that went away must not stop the engine
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receiver_is_harmless() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(Event::EraseProgress { percent: 10 });
        EventSink::none().emit(Event::EraseProgress { percent: 10 });
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, rx) = EventSink::channel();
        sink.emit(Event::Progress {
            operation: Operation::Write,
            done: 1,
            total: 2,
        });
        sink.clone().emit(Event::EraseProgress { percent: 100 });
        drop(sink);

        let events: Vec<Event> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].fraction(), Some(0.5));
        assert_eq!(events[1].fraction(), Some(1.0));
    }
}
