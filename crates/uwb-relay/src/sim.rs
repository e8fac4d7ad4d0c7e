//! Simulated sensor and controller ports for running without hardware.
//!
//! The sensor emits one frame per period carrying a slowly oscillating
//! distance with a little noise. A short burst of garbage precedes the first
//! frame, and roughly one frame in fifty has a corrupted end byte. The
//! controller parses `channel,distance` lines and logs each one.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::frame::{encode_frame, END_BYTE};
use crate::link::{PortOpener, SerialStream};

pub const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(20);

const BASE_MM: f64 = 1500.0;
const SWING_MM: f64 = 500.0;
/// Radians per second of the distance oscillation.
const SWING_RATE: f64 = 0.4;
const NOISE_MM: i32 = 5;
const CORRUPT_PROBABILITY: f64 = 0.02;
const BOOT_GARBAGE: usize = 7;

// ─── Sensor ─────────────────────────────────────────────────────────────────

pub struct SimulatedSensorOpener {
    name: String,
    period: Duration,
    seed: Option<u64>,
}

impl SimulatedSensorOpener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            period: DEFAULT_FRAME_PERIOD,
            seed: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Deterministic noise and corruption.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl PortOpener for SimulatedSensorOpener {
    type Stream = SimulatedSensor;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<SimulatedSensor> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let pending: VecDeque<u8> = (0..BOOT_GARBAGE).map(|_| rng.random::<u8>()).collect();
        let now = Instant::now();
        Ok(SimulatedSensor {
            rng,
            period: self.period,
            started: now,
            next_frame_at: now,
            pending,
        })
    }
}

pub struct SimulatedSensor {
    rng: StdRng,
    period: Duration,
    started: Instant,
    next_frame_at: Instant,
    pending: VecDeque<u8>,
}

impl SimulatedSensor {
    fn distance_at(&mut self, now: Instant) -> u16 {
        let t = now.duration_since(self.started).as_secs_f64();
        let noise = self.rng.random_range(-NOISE_MM..=NOISE_MM);
        let mm = BASE_MM + SWING_MM * (t * SWING_RATE).sin() + f64::from(noise);
        mm.clamp(0.0, f64::from(u16::MAX)) as u16
    }

    fn emit_frame(&mut self, now: Instant) {
        let mut frame = encode_frame(self.distance_at(now));
        if self.rng.random_bool(CORRUPT_PROBABILITY) {
            frame[3] = END_BYTE ^ 0xFF;
        }
        self.pending.extend(frame);
        self.next_frame_at += self.period;
        // Don't burst frames after a long pause between reads.
        if self.next_frame_at < now {
            self.next_frame_at = now + self.period;
        }
    }
}

impl SerialStream for SimulatedSensor {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            let now = Instant::now();
            if now < self.next_frame_at {
                let wait = self.next_frame_at - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(0);
                }
                thread::sleep(wait);
            }
            self.emit_frame(Instant::now());
        }
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct SimulatedControllerOpener {
    name: String,
    received: Arc<AtomicU64>,
}

impl SimulatedControllerOpener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count of well-formed lines received across every opened stream.
    pub fn received(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }
}

impl PortOpener for SimulatedControllerOpener {
    type Stream = SimulatedController;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<SimulatedController> {
        Ok(SimulatedController {
            line: Vec::new(),
            received: self.received.clone(),
        })
    }
}

pub struct SimulatedController {
    line: Vec<u8>,
    received: Arc<AtomicU64>,
}

fn parse_line(line: &str) -> Option<(u8, u16)> {
    let (channel, distance) = line.split_once(',')?;
    Some((channel.trim().parse().ok()?, distance.trim().parse().ok()?))
}

impl SerialStream for SimulatedController {
    fn read(&mut self, _buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        thread::sleep(timeout);
        Ok(0)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &b in bytes {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            match parse_line(&line) {
                Some((channel_id, distance_mm)) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    info!(channel_id, distance_mm, "controller received distance");
                }
                None => warn!(line = %line, "controller received unparseable line"),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_all;

    fn read_for(stream: &mut SimulatedSensor, total: Duration) -> Vec<u8> {
        let deadline = Instant::now() + total;
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        while Instant::now() < deadline {
            let n = stream.read(&mut buf, Duration::from_millis(5)).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn sensor_emits_plausible_frames() {
        let mut opener = SimulatedSensorOpener::new("sim-sensor")
            .with_period(Duration::from_millis(2))
            .with_seed(7);
        let mut stream = opener.open().unwrap();
        stream.clear_input().unwrap();

        let bytes = read_for(&mut stream, Duration::from_millis(200));
        let decoded = decode_all(&bytes);
        let valid: Vec<u16> = decoded.iter().filter_map(|r| r.ok()).collect();

        assert!(valid.len() >= 20, "only {} valid frames", valid.len());
        assert!(valid.iter().all(|&mm| (990..=2010).contains(&mm)));
    }

    #[test]
    fn sensor_waits_when_no_frame_due() {
        let mut opener = SimulatedSensorOpener::new("sim-sensor")
            .with_period(Duration::from_secs(10))
            .with_seed(1);
        let mut stream = opener.open().unwrap();
        stream.clear_input().unwrap();
        let mut buf = [0u8; 4];
        // The first frame is due immediately, the next one much later.
        assert_eq!(stream.read(&mut buf, Duration::from_millis(5)).unwrap(), 4);
        assert_eq!(stream.read(&mut buf, Duration::from_millis(5)).unwrap(), 0);
    }

    #[test]
    fn controller_counts_parsed_lines() {
        let mut opener = SimulatedControllerOpener::new("sim-controller");
        let received = opener.received();
        let mut stream = opener.open().unwrap();

        stream.write_all(b"1,20\n1,3").unwrap();
        stream.write_all(b"0\nbogus\n").unwrap();
        assert_eq!(received.load(Ordering::Relaxed), 2);
        assert_eq!(parse_line("2, 1500"), Some((2, 1500)));
        assert_eq!(parse_line("x,1"), None);
    }
}
