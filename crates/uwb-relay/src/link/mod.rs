//! # Serial Link Manager
//!
//! [`SerialLink`] owns exactly one serial connection and its lifecycle:
//!
//! ```text
//! Closed ──initial open──▶ Open ──I/O error──▶ Faulted
//!   ▲                       ▲                    │
//!   │                       └── backoff, reopen ─┘  (repeats until success)
//!   └──────────── close() (deliberate shutdown only) ────────────
//! ```
//!
//! A failed *initial* open is fatal and surfaces as [`LinkError::Open`].
//! After that, faults are never fatal: the failing operation returns
//! [`LinkError::Fault`] so callers can reset dependent state at once, and the
//! next operation sleeps the backoff and reopens, indefinitely. Both buffers
//! are cleared right after every successful open and at no other time.
//!
//! The port itself sits behind [`PortOpener`]/[`SerialStream`] so the same
//! manager drives real hardware ([`system`]), the simulator
//! ([`crate::sim`]) and scripted test ports ([`crate::test_util`]).

pub mod system;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::frame::ByteSource;
use crate::shutdown::Shutdown;
use crate::stats::{bump, LinkCounters};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_REOPEN_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Failed reopen attempts are logged on the first try and then every this many.
const REOPEN_LOG_EVERY: u64 = 50;

// ─── Port abstraction ───────────────────────────────────────────────────────

/// An open serial connection.
pub trait SerialStream: Send {
    /// Reads available bytes, waiting at most `timeout`. Returns `Ok(0)` if
    /// nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn clear_input(&mut self) -> io::Result<()>;
    fn clear_output(&mut self) -> io::Result<()>;
}

/// Opens (and reopens) one particular port.
pub trait PortOpener: Send {
    type Stream: SerialStream;

    /// Port name used in logs and errors.
    fn name(&self) -> &str;
    fn open(&mut self) -> io::Result<Self::Stream>;
}

/// Byte sink handed to downstream encoders.
pub trait LinkWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Open,
    Faulted,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Closed => "closed",
            LinkState::Open => "open",
            LinkState::Faulted => "faulted",
        }
    }
}

// ─── Link manager ───────────────────────────────────────────────────────────

pub struct SerialLink<O: PortOpener> {
    opener: O,
    port: Option<O::Stream>,
    state: LinkState,
    /// Set by [`SerialLink::close`]; `Closed` is terminal from then on.
    terminated: bool,
    backoff: Duration,
    generation: u64,
    shutdown: Shutdown,
    counters: Arc<LinkCounters>,
}

impl<O: PortOpener> SerialLink<O> {
    /// Creates a closed link. Nothing is opened until [`Self::ensure_open`]
    /// or the first I/O call.
    pub fn new(opener: O, backoff: Duration, shutdown: Shutdown) -> Self {
        Self {
            opener,
            port: None,
            state: LinkState::Closed,
            terminated: false,
            backoff,
            generation: 0,
            shutdown,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    /// Shares fault/reopen counters with the relay statistics.
    pub fn with_counters(mut self, counters: Arc<LinkCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn name(&self) -> &str {
        self.opener.name()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The signal that interrupts this link's reopen backoff.
    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Number of successful opens so far, initial open included.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Brings the link to `Open`.
    ///
    /// From the initial `Closed` state this is a single attempt whose failure
    /// is fatal. From `Faulted` it retries with the fixed backoff until it
    /// succeeds or shutdown is signalled.
    pub fn ensure_open(&mut self) -> Result<(), LinkError> {
        match self.state {
            LinkState::Open => Ok(()),
            LinkState::Closed if self.terminated => Err(self.shutdown_error()),
            LinkState::Closed => self.open_initial(),
            LinkState::Faulted => self.reopen(),
        }
    }

    /// Reads up to `n` bytes within `timeout`. A short result means the
    /// timeout elapsed.
    pub fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0u8; n];
        let got = self.fill(&mut buf, timeout)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.ensure_open()?;
        let result = match self.port.as_mut() {
            Some(port) => port.write_all(bytes),
            None => return Err(self.shutdown_error()),
        };
        result.map_err(|e| self.fault(e))
    }

    pub fn flush(&mut self) -> Result<(), LinkError> {
        self.with_port(|port| port.flush())
    }

    pub fn reset_input_buffer(&mut self) -> Result<(), LinkError> {
        self.with_port(|port| port.clear_input())
    }

    pub fn reset_output_buffer(&mut self) -> Result<(), LinkError> {
        self.with_port(|port| port.clear_output())
    }

    /// Closes the port for good. Later operations return
    /// [`LinkError::Shutdown`].
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.opener.name(), from = self.state.as_str(), "serial link closed");
        }
        self.state = LinkState::Closed;
        self.terminated = true;
    }

    // ── internals ───────────────────────────────────────────────────

    fn with_port(
        &mut self,
        op: impl FnOnce(&mut O::Stream) -> io::Result<()>,
    ) -> Result<(), LinkError> {
        self.ensure_open()?;
        let result = match self.port.as_mut() {
            Some(port) => op(port),
            None => return Err(self.shutdown_error()),
        };
        result.map_err(|e| self.fault(e))
    }

    fn open_initial(&mut self) -> Result<(), LinkError> {
        let stream = self.opener.open().map_err(|source| LinkError::Open {
            port: self.opener.name().to_string(),
            source,
        })?;
        self.attach(stream).map_err(|source| LinkError::Open {
            port: self.opener.name().to_string(),
            source,
        })?;
        info!(port = %self.opener.name(), "serial link opened");
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), LinkError> {
        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.sleep(self.backoff) {
                return Err(self.shutdown_error());
            }
            attempt += 1;

            let result = self.opener.open().and_then(|stream| self.attach(stream));
            match result {
                Ok(()) => {
                    bump(&self.counters.reopens);
                    info!(
                        port = %self.opener.name(),
                        attempt,
                        generation = self.generation,
                        "serial link reopened"
                    );
                    return Ok(());
                }
                Err(e) if attempt == 1 || attempt % REOPEN_LOG_EVERY == 0 => {
                    warn!(port = %self.opener.name(), attempt, error = %e, "serial link reopen failed");
                }
                Err(e) => {
                    debug!(port = %self.opener.name(), attempt, error = %e, "serial link reopen failed");
                }
            }
        }
    }

    /// Installs a freshly opened stream and clears both buffers.
    fn attach(&mut self, mut stream: O::Stream) -> io::Result<()> {
        stream.clear_input()?;
        stream.clear_output()?;
        self.port = Some(stream);
        self.state = LinkState::Open;
        self.generation += 1;
        Ok(())
    }

    fn fault(&mut self, source: io::Error) -> LinkError {
        self.port = None;
        self.state = LinkState::Faulted;
        bump(&self.counters.faults);
        warn!(port = %self.opener.name(), error = %source, "serial link faulted");
        LinkError::Fault {
            port: self.opener.name().to_string(),
            source,
        }
    }

    fn shutdown_error(&self) -> LinkError {
        LinkError::Shutdown {
            port: self.opener.name().to_string(),
        }
    }
}

impl<O: PortOpener> ByteSource for SerialLink<O> {
    fn fill(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match self.port.as_mut() {
                Some(port) => port.read(&mut buf[filled..], remaining),
                None => return Err(self.shutdown_error()),
            };
            match result {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fault(e)),
            }
            if filled == buf.len() || Instant::now() >= deadline {
                break;
            }
        }
        Ok(filled)
    }
}

impl<O: PortOpener> LinkWriter for SerialLink<O> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        SerialLink::write(self, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scripted;

    const BACKOFF: Duration = Duration::from_millis(5);
    const TIMEOUT: Duration = Duration::from_millis(20);

    // ─── Opening ────────────────────────────────────────────────────────

    #[test]
    fn starts_closed_and_opens_lazily() {
        let (opener, handle) = scripted("sensor");
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(handle.opens(), 0);

        link.ensure_open().unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(link.generation(), 1);
        assert_eq!(handle.opens(), 1);
        assert_eq!(handle.input_clears(), 1);
        assert_eq!(handle.output_clears(), 1);
    }

    #[test]
    fn initial_open_failure_is_fatal() {
        let (opener, handle) = scripted("/dev/missing");
        handle.fail_next_opens(1);
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());

        let err = link.ensure_open().unwrap_err();
        assert!(err.is_fatal(), "got {err}");
        assert_eq!(err.port(), "/dev/missing");
        assert_eq!(link.state(), LinkState::Closed);
    }

    // ─── Reading ────────────────────────────────────────────────────────

    #[test]
    fn read_collects_bytes_across_chunks() {
        let (opener, handle) = scripted("sensor");
        handle.push_bytes(&[1, 2]);
        handle.push_bytes(&[3, 4, 5]);
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());

        assert_eq!(link.read(3, TIMEOUT).unwrap(), vec![1, 2, 3]);
        assert_eq!(link.read(3, TIMEOUT).unwrap(), vec![4, 5]);
        assert!(link.read(1, TIMEOUT).unwrap().is_empty());
    }

    // ─── Faults ─────────────────────────────────────────────────────────

    #[test]
    fn fault_then_reopen_clears_buffers_once() {
        let (opener, handle) = scripted("sensor");
        handle.push_bytes(&[7]);
        handle.push_fault();
        handle.push_bytes(&[8]);
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());

        assert_eq!(link.read(1, TIMEOUT).unwrap(), vec![7]);
        let err = link.read(1, TIMEOUT).unwrap_err();
        assert!(matches!(err, LinkError::Fault { .. }), "got {err}");
        assert_eq!(link.state(), LinkState::Faulted);

        assert_eq!(link.read(1, TIMEOUT).unwrap(), vec![8]);
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(link.generation(), 2);
        assert_eq!(handle.opens(), 2);
        assert_eq!(handle.input_clears(), 2);
    }

    #[test]
    fn reopen_retries_until_port_returns() {
        let (opener, handle) = scripted("sensor");
        handle.push_fault();
        let counters = Arc::new(LinkCounters::default());
        let mut link =
            SerialLink::new(opener, BACKOFF, Shutdown::new()).with_counters(counters.clone());

        assert!(link.read(1, TIMEOUT).is_err());
        handle.fail_next_opens(3);
        link.ensure_open().unwrap();

        assert_eq!(handle.opens(), 2, "failed attempts do not count as opens");
        assert_eq!(handle.open_attempts(), 5);
        assert_eq!(counters.faults.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(counters.reopens.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn reopen_attempts_are_spaced_by_backoff() {
        let (opener, handle) = scripted("sensor");
        handle.push_fault();
        let mut link = SerialLink::new(opener, DEFAULT_REOPEN_BACKOFF, Shutdown::new());

        assert!(link.read(1, TIMEOUT).is_err());
        let faulted_at = Instant::now();
        handle.fail_next_opens(2);
        link.ensure_open().unwrap();

        // Initial open, two failed reopens, one successful reopen.
        let times = handle.open_attempt_times();
        assert_eq!(times.len(), 4);
        assert!(times[1] - faulted_at >= DEFAULT_REOPEN_BACKOFF);
        for pair in times[1..].windows(2) {
            assert!(
                pair[1] - pair[0] >= DEFAULT_REOPEN_BACKOFF,
                "attempts {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[test]
    fn shutdown_interrupts_reopen_loop() {
        let (opener, handle) = scripted("sensor");
        handle.push_fault();
        let shutdown = Shutdown::new();
        let mut link = SerialLink::new(opener, Duration::from_secs(30), shutdown.clone());

        assert!(link.read(1, TIMEOUT).is_err());
        shutdown.trigger();
        let start = Instant::now();
        let err = link.ensure_open().unwrap_err();
        assert!(matches!(err, LinkError::Shutdown { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn write_fault_marks_link_faulted() {
        let (opener, handle) = scripted("controller");
        handle.fail_next_writes(1);
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());

        assert!(matches!(link.write(b"x"), Err(LinkError::Fault { .. })));
        assert_eq!(link.state(), LinkState::Faulted);
        link.write(b"ok").unwrap();
        link.flush().unwrap();
        assert_eq!(handle.written(), b"ok".to_vec());
        assert_eq!(handle.flushes(), 1);
    }

    // ─── Closing ────────────────────────────────────────────────────────

    #[test]
    fn close_is_terminal() {
        let (opener, _handle) = scripted("sensor");
        let mut link = SerialLink::new(opener, BACKOFF, Shutdown::new());
        link.ensure_open().unwrap();
        link.close();

        assert_eq!(link.state(), LinkState::Closed);
        assert!(matches!(link.ensure_open(), Err(LinkError::Shutdown { .. })));
        assert!(matches!(link.write(b"x"), Err(LinkError::Shutdown { .. })));
    }
}
