//! Scripted in-memory port for protocol tests.
//!
//! Unlike `Cursor<Vec<u8>>`, this keeps reads and writes independent and
//! can simulate the device going quiet for one read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};

enum Scripted {
    Bytes(Vec<u8>),
    Stall,
    Fail(io::ErrorKind),
}

/// Mock serial port with a scripted receive side.
pub(crate) struct MockPort {
    replies: VecDeque<Scripted>,
    written: Vec<u8>,
    timeout: Duration,
    timeouts: Vec<Duration>,
    input_resets: usize,
    open: bool,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            written: Vec::new(),
            timeout: Duration::from_millis(20),
            timeouts: Vec::new(),
            input_resets: 0,
            open: true,
        }
    }

    /// Queue bytes the device will send.
    pub(crate) fn reply(&mut self, bytes: &[u8]) -> &mut Self {
        self.replies.push_back(Scripted::Bytes(bytes.to_vec()));
        self
    }

    /// Queue one read that times out.
    pub(crate) fn stall(&mut self) -> &mut Self {
        self.replies.push_back(Scripted::Stall);
        self
    }

    /// Queue one read that fails with a link error.
    pub(crate) fn fail(&mut self, kind: io::ErrorKind) -> &mut Self {
        self.replies.push_back(Scripted::Fail(kind));
        self
    }

    /// Everything written so far.
    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    /// Every timeout passed to `set_timeout`, in order.
    pub(crate) fn timeouts(&self) -> &[Duration] {
        &self.timeouts
    }

    pub(crate) fn input_resets(&self) -> usize {
        self.input_resets
    }

    /// Number of scripted replies not yet consumed.
    pub(crate) fn pending(&self) -> usize {
        self.replies.len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        match self.replies.pop_front() {
            Some(Scripted::Bytes(mut bytes)) => {
                let n = buf.len().min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    bytes.drain(..n);
                    self.replies.push_front(Scripted::Bytes(bytes));
                }
                Ok(n)
            },
            Some(Scripted::Fail(kind)) => Err(io::Error::new(kind, "link failure")),
            Some(Scripted::Stall) | None => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        self.timeouts.push(timeout);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        115200
    }

    fn reset_input_buffer(&mut self) -> Result<()> {
        self.input_resets += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Hands out pre-built mock ports; `None` entries fail to open.
pub(crate) struct MockOpener {
    ports: VecDeque<Option<MockPort>>,
    pub(crate) opened: Vec<String>,
}

impl MockOpener {
    pub(crate) fn new(ports: impl IntoIterator<Item = Option<MockPort>>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            opened: Vec::new(),
        }
    }
}

impl PortOpener for MockOpener {
    type Port = MockPort;

    fn open(&mut self, config: &SerialConfig) -> Result<MockPort> {
        self.opened.push(config.port_name.clone());
        match self.ports.pop_front() {
            Some(Some(port)) => Ok(port),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such device",
            ))),
        }
    }
}
