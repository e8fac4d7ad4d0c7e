//! Scripted in-memory serial ports for tests.
//!
//! A [`ScriptHandle`] feeds inbound bytes and faults to the port and records
//! what the relay did to it (writes, flushes, buffer clears, opens). The
//! script survives reopens: every stream produced by a [`ScriptedOpener`]
//! shares the same state.
//!
//! Buffer clears are counted but do not discard scripted bytes; scripted
//! input models data arriving after the clear.
//!
//! Compiled for this crate's unit tests and, behind the `test-util` feature,
//! for its integration tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::frame::encode_frame;
use crate::link::{PortOpener, SerialStream};

/// Longest a scripted read sleeps when it has nothing to return.
const IDLE_POLL: Duration = Duration::from_millis(2);

enum Step {
    Bytes(VecDeque<u8>),
    Fault(io::ErrorKind),
}

#[derive(Default)]
struct ScriptState {
    inbound: VecDeque<Step>,
    written: Vec<u8>,
    fail_opens: usize,
    fail_writes: usize,
    open_attempts: usize,
    open_attempt_times: Vec<Instant>,
    write_fault_times: Vec<Instant>,
    opens: usize,
    flushes: usize,
    input_clears: usize,
    output_clears: usize,
}

#[derive(Clone, Default)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.lock()
            .inbound
            .push_back(Step::Bytes(bytes.iter().copied().collect()));
    }

    pub fn push_frame(&self, distance_mm: u16) {
        self.push_bytes(&encode_frame(distance_mm));
    }

    pub fn push_frames(&self, distance_mm: u16, count: usize) {
        for _ in 0..count {
            self.push_frame(distance_mm);
        }
    }

    /// The next read after all earlier scripted bytes fails with a broken pipe.
    pub fn push_fault(&self) {
        self.lock()
            .inbound
            .push_back(Step::Fault(io::ErrorKind::BrokenPipe));
    }

    pub fn fail_next_opens(&self, n: usize) {
        let mut state = self.lock();
        state.fail_opens = state.fail_opens.saturating_add(n);
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes += n;
    }

    /// Whether every scripted byte and fault has been read.
    pub fn drained(&self) -> bool {
        self.lock().inbound.is_empty()
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.lock().written).into_owned()
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    /// When each open attempt was made, successful or not.
    pub fn open_attempt_times(&self) -> Vec<Instant> {
        self.lock().open_attempt_times.clone()
    }

    /// When each scripted write failure was returned.
    pub fn write_fault_times(&self) -> Vec<Instant> {
        self.lock().write_fault_times.clone()
    }

    /// Successful opens.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn input_clears(&self) -> usize {
        self.lock().input_clears
    }

    pub fn output_clears(&self) -> usize {
        self.lock().output_clears
    }
}

pub struct ScriptedOpener {
    name: String,
    handle: ScriptHandle,
}

impl PortOpener for ScriptedOpener {
    type Stream = ScriptedPort;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<ScriptedPort> {
        let mut state = self.handle.lock();
        state.open_attempts += 1;
        state.open_attempt_times.push(Instant::now());
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "scripted open failure"));
        }
        state.opens += 1;
        Ok(ScriptedPort {
            handle: self.handle.clone(),
        })
    }
}

pub struct ScriptedPort {
    handle: ScriptHandle,
}

impl SerialStream for ScriptedPort {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        {
            let mut state = self.handle.lock();
            match state.inbound.front_mut() {
                Some(Step::Bytes(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    for (dst, src) in buf.iter_mut().zip(bytes.drain(..n)) {
                        *dst = src;
                    }
                    if bytes.is_empty() {
                        state.inbound.pop_front();
                    }
                    return Ok(n);
                }
                Some(Step::Fault(kind)) => {
                    let kind = *kind;
                    state.inbound.pop_front();
                    return Err(io::Error::new(kind, "scripted read fault"));
                }
                None => {}
            }
        }
        std::thread::sleep(timeout.min(IDLE_POLL));
        Ok(0)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.handle.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            state.write_fault_times.push(Instant::now());
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write fault"));
        }
        state.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.lock().flushes += 1;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.handle.lock().input_clears += 1;
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.handle.lock().output_clears += 1;
        Ok(())
    }
}

/// Creates a scripted port and the handle that drives it.
pub fn scripted(name: &str) -> (ScriptedOpener, ScriptHandle) {
    let handle = ScriptHandle::default();
    (
        ScriptedOpener {
            name: name.to_string(),
            handle: handle.clone(),
        },
        handle,
    )
}

/// A sample as the decoder would produce it, stamped now.
#[cfg(test)]
pub(crate) fn sample(distance_mm: u16) -> crate::frame::DistanceSample {
    crate::frame::DistanceSample::new(distance_mm, chrono::Utc::now())
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
