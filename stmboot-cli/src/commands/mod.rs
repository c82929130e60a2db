//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.
//! Device commands run their [`Session`] on a worker thread while the main
//! thread turns the session's events into progress bars.

pub(crate) mod flash;
pub(crate) mod info;
pub(crate) mod read;

use anyhow::{Result, anyhow};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, warn};
use std::thread;
use stmboot::{Event, EventSink, NativeOpener, Operation, Session};

use crate::serial::Settings;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Stop a multi-step job between steps once Ctrl-C was pressed.
pub(crate) fn checkpoint() -> stmboot::Result<()> {
    if stmboot::is_interrupted_requested() {
        Err(stmboot::Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Print a status line to stderr unless quiet.
pub(crate) fn status(cli: &Cli, symbol: &str, message: impl std::fmt::Display) {
    if !cli.quiet {
        eprintln!("{} {message}", style(symbol).cyan());
    }
}

/// Print a success line to stderr unless quiet.
pub(crate) fn done(cli: &Cli, message: impl std::fmt::Display) {
    if !cli.quiet {
        eprintln!("{} {message}", style("✓").green().bold());
    }
}

/// Open a session on a worker thread and run `job` on it.
///
/// The port is closed when the job returns, whatever the outcome.
pub(crate) fn run_session<T, F>(settings: &Settings, quiet: bool, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Session<NativeOpener>) -> stmboot::Result<T> + Send + 'static,
{
    ensure_not_interrupted()?;

    let (events, rx) = EventSink::channel();
    let config = settings.serial.clone();
    let options = settings.options.clone();

    let worker = thread::spawn(move || -> stmboot::Result<T> {
        let mut session = Session::open_with(config, options)?.with_events(events);
        let result = job(&mut session);
        if let Err(e) = session.close() {
            warn!("Failed to close port: {e}");
        }
        result
    });

    // Ends once the worker drops the session and with it the sink
    let mut ui = ProgressUi::new(quiet);
    for event in rx {
        ui.handle(&event);
    }
    ui.finish();

    let result = worker
        .join()
        .map_err(|_| anyhow!("Session thread panicked"))?;
    result.map_err(into_cli_error)
}

fn into_cli_error(err: stmboot::Error) -> anyhow::Error {
    if matches!(err.root(), stmboot::Error::Cancelled) {
        CliError::Cancelled(err.to_string()).into()
    } else {
        err.into()
    }
}

/// Which bar is currently shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Transfer(Operation),
    Erase,
}

/// Renders session events on stderr.
struct ProgressUi {
    quiet: bool,
    current: Option<(Phase, ProgressBar)>,
}

impl ProgressUi {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            current: None,
        }
    }

    #[allow(clippy::cast_possible_truncation)] // Chunk counts fit in u64
    fn handle(&mut self, event: &Event) {
        match event {
            Event::Progress {
                operation,
                done,
                total,
            } => {
                self.bar(Phase::Transfer(*operation), *total as u64)
                    .set_position(*done as u64);
            },
            Event::EraseProgress { percent } => {
                self.bar(Phase::Erase, 100)
                    .set_position(u64::from(*percent));
            },
            Event::Retry {
                opcode,
                attempt,
                max_attempts,
            } => self.note(&format!(
                "{opcode} not acknowledged, retrying ({attempt}/{max_attempts})"
            )),
            Event::Warning { message } => self.note(message),
            Event::StageFailed { reason, .. } => debug!("{reason}"),
            Event::StateChanged(state) => debug!("Session {state}"),
            Event::StageStarted { .. } | Event::StageCompleted { .. } => {},
        }
    }

    /// Bar for `phase`, replacing the previous one when the phase changes.
    fn bar(&mut self, phase: Phase, len: u64) -> &ProgressBar {
        if !matches!(&self.current, Some((shown, _)) if *shown == phase) {
            self.finish();
        }
        let quiet = self.quiet;
        &self
            .current
            .get_or_insert_with(|| (phase, new_bar(phase, len, quiet)))
            .1
    }

    fn note(&self, message: &str) {
        if self.quiet {
            return;
        }
        let line = format!("{} {message}", style("⚠").yellow());
        match &self.current {
            Some((_, bar)) if !bar.is_hidden() => bar.println(line),
            _ => eprintln!("{line}"),
        }
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }
}

fn new_bar(phase: Phase, len: u64, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let (label, template) = match phase {
        Phase::Erase => (
            "Erasing",
            "{spinner:.green} {msg:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}%",
        ),
        Phase::Transfer(operation) => (
            match operation {
                Operation::Read => "Reading",
                Operation::Write => "Writing",
                Operation::Verify => "Verifying",
            },
            "{spinner:.green} {msg:10} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks",
        ),
    };

    let pb = ProgressBar::new(len);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(label);
    pb
}
