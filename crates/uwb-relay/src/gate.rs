//! # Stabilization Gate
//!
//! The first readings after power-up or a reconnect are usually garbage from
//! a desynchronized buffer. The gate withholds samples until it has seen a
//! streak of `required` consecutive valid frames, then passes everything
//! through until the link faults or is reopened.
//!
//! ```text
//!            valid (count < N)            valid
//!          ┌───────────────────┐        ┌───────┐
//!          ▼                   │        ▼       │
//!   ──▶ Warming ──── Nth valid ───▶ Stable ─────┘
//!          ▲  │                         │
//!          │  └ decode error: count = 0 │
//!          └──────── reset (fault / reopen)
//! ```
//!
//! The frames that build the streak are decoded and discarded, never queued.

use tracing::info;

use crate::frame::DistanceSample;

pub const DEFAULT_REQUIRED_FRAMES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilizationGate {
    required: u32,
    consecutive_valid: u32,
    stable: bool,
}

impl StabilizationGate {
    /// `required` is clamped to at least one frame.
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            consecutive_valid: 0,
            stable: false,
        }
    }

    /// Offers a decoded sample. Returns it only once the gate is stable.
    pub fn admit(&mut self, sample: DistanceSample) -> Option<DistanceSample> {
        if self.stable {
            return Some(sample);
        }

        self.consecutive_valid += 1;
        if self.consecutive_valid >= self.required {
            self.stable = true;
            info!(frames = self.consecutive_valid, "sensor stream stabilized");
        }
        None
    }

    /// A malformed frame breaks the warm-up streak. Has no effect once stable.
    pub fn on_decode_error(&mut self) {
        if !self.stable {
            self.consecutive_valid = 0;
        }
    }

    /// Link faulted or was reopened: start warming up again.
    pub fn reset(&mut self) {
        if self.stable {
            info!("sensor stream destabilized, waiting for fresh frames");
        }
        self.consecutive_valid = 0;
        self.stable = false;
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn consecutive_valid(&self) -> u32 {
        self.consecutive_valid
    }

    pub fn required(&self) -> u32 {
        self.required
    }
}

impl Default for StabilizationGate {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sample;

    #[test]
    fn stable_after_exactly_n_frames() {
        let mut gate = StabilizationGate::new(10);
        for i in 0..9 {
            assert!(gate.admit(sample(i)).is_none());
        }
        assert!(!gate.is_stable());
        assert_eq!(gate.consecutive_valid(), 9);

        assert!(gate.admit(sample(9)).is_none(), "the Nth frame is still warm-up");
        assert!(gate.is_stable());

        let passed = gate.admit(sample(42)).expect("stable gate passes samples");
        assert_eq!(passed.distance_mm(), 42);
    }

    #[test]
    fn decode_error_restarts_the_streak() {
        let mut gate = StabilizationGate::new(3);
        gate.admit(sample(1));
        gate.admit(sample(1));
        gate.on_decode_error();
        assert_eq!(gate.consecutive_valid(), 0);

        gate.admit(sample(1));
        gate.admit(sample(1));
        assert!(!gate.is_stable());
        gate.admit(sample(1));
        assert!(gate.is_stable());
    }

    #[test]
    fn decode_error_after_stable_is_ignored() {
        let mut gate = StabilizationGate::new(2);
        gate.admit(sample(1));
        gate.admit(sample(1));
        gate.on_decode_error();
        assert!(gate.is_stable());
        assert!(gate.admit(sample(5)).is_some());
    }

    #[test]
    fn reset_requires_fresh_streak() {
        let mut gate = StabilizationGate::new(2);
        gate.admit(sample(1));
        gate.admit(sample(1));
        assert!(gate.is_stable());

        gate.reset();
        assert!(!gate.is_stable());
        assert_eq!(gate.consecutive_valid(), 0);
        assert!(gate.admit(sample(7)).is_none());
        assert!(gate.admit(sample(7)).is_none());
        assert!(gate.admit(sample(7)).is_some());
    }

    #[test]
    fn zero_requirement_is_clamped() {
        let mut gate = StabilizationGate::new(0);
        assert_eq!(gate.required(), 1);
        assert!(gate.admit(sample(1)).is_none());
        assert!(gate.is_stable());
    }
}
