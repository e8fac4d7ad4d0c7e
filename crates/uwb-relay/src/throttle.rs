//! # Transmit Throttler
//!
//! Forwards the latest distance to the downstream controller, at most once
//! per minimum interval and only when the value changed:
//!
//! - **change gate**: `distance_mm != last_forwarded_value`
//! - **rate gate**: time since the last *successful* forward exceeds
//!   `min_interval`
//!
//! Both gates are measured against what was actually forwarded, never
//! against what merely arrived. A failed forward drops the sample; a newer
//! one supersedes it, and the downstream [`SerialLink`] takes care of
//! reopening the port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::encoder::DownstreamEncoder;
use crate::error::LinkError;
use crate::frame::DistanceSample;
use crate::link::{PortOpener, SerialLink};
use crate::shutdown::Shutdown;
use crate::slot::LatestSlot;
use crate::stats::{bump, RelayStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub min_interval: Duration,
    pub consume_timeout: Duration,
    /// Pause after a downstream fault before taking the next sample.
    pub fault_wait: Duration,
    /// Controller channel the distance is forwarded on.
    pub channel_id: u8,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            consume_timeout: Duration::from_millis(100),
            fault_wait: Duration::from_millis(500),
            channel_id: 1,
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

/// Why a sample was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    Unchanged,
    TooSoon,
}

/// What was last forwarded, and when. `None` means nothing has been
/// forwarded yet, which satisfies both gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleState {
    last_forwarded_value: Option<u16>,
    last_forwarded_at: Option<Instant>,
}

impl ThrottleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_forward(
        &self,
        distance_mm: u16,
        now: Instant,
        min_interval: Duration,
    ) -> Result<(), Suppressed> {
        if self.last_forwarded_value == Some(distance_mm) {
            return Err(Suppressed::Unchanged);
        }
        if let Some(at) = self.last_forwarded_at {
            if now.saturating_duration_since(at) <= min_interval {
                return Err(Suppressed::TooSoon);
            }
        }
        Ok(())
    }

    pub fn record_forward(&mut self, distance_mm: u16, now: Instant) {
        self.last_forwarded_value = Some(distance_mm);
        self.last_forwarded_at = Some(now);
    }

    pub fn last_forwarded_value(&self) -> Option<u16> {
        self.last_forwarded_value
    }

    pub fn last_forwarded_at(&self) -> Option<Instant> {
        self.last_forwarded_at
    }
}

// ─── Throttler ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ForwardOutcome {
    Forwarded,
    Suppressed(Suppressed),
    Failed(LinkError),
}

pub struct TransmitThrottler<E> {
    config: ThrottleConfig,
    state: ThrottleState,
    encoder: E,
    stats: Arc<RelayStats>,
}

impl<E: DownstreamEncoder> TransmitThrottler<E> {
    pub fn new(config: ThrottleConfig, encoder: E) -> Self {
        Self {
            config,
            state: ThrottleState::new(),
            encoder,
            stats: Arc::new(RelayStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<RelayStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Applies both gates to `sample` at time `now` and forwards it if they
    /// pass.
    pub fn offer<O: PortOpener>(
        &mut self,
        sample: &DistanceSample,
        link: &mut SerialLink<O>,
        now: Instant,
    ) -> ForwardOutcome {
        let distance_mm = sample.distance_mm();
        if let Err(reason) = self
            .state
            .should_forward(distance_mm, now, self.config.min_interval)
        {
            match reason {
                Suppressed::Unchanged => bump(&self.stats.suppressed_unchanged),
                Suppressed::TooSoon => bump(&self.stats.suppressed_interval),
            }
            trace!(distance_mm, ?reason, "forward suppressed");
            return ForwardOutcome::Suppressed(reason);
        }

        match self.forward(distance_mm, link) {
            Ok(()) => {
                self.state.record_forward(distance_mm, now);
                bump(&self.stats.forwarded);
                debug!(
                    distance_mm,
                    observed_at = %sample.observed_at(),
                    channel_id = self.config.channel_id,
                    "distance forwarded"
                );
                ForwardOutcome::Forwarded
            }
            Err(e) => {
                bump(&self.stats.forward_failures);
                if !matches!(e, LinkError::Shutdown { .. }) {
                    warn!(distance_mm, error = %e, "downstream forward failed, sample dropped");
                }
                ForwardOutcome::Failed(e)
            }
        }
    }

    /// Drains stale downstream buffering, then encodes, sends and flushes.
    fn forward<O: PortOpener>(
        &mut self,
        distance_mm: u16,
        link: &mut SerialLink<O>,
    ) -> Result<(), LinkError> {
        link.reset_input_buffer()?;
        link.reset_output_buffer()?;
        self.encoder
            .encode_and_send(self.config.channel_id, distance_mm, link)?;
        link.flush()
    }

    /// Forward loop. Runs until shutdown is signalled or the link is closed.
    pub fn run<O: PortOpener>(
        &mut self,
        slot: &LatestSlot<DistanceSample>,
        link: &mut SerialLink<O>,
        shutdown: &Shutdown,
    ) {
        while !shutdown.is_triggered() {
            let Some(sample) = slot.consume(self.config.consume_timeout) else {
                continue;
            };
            match self.offer(&sample, link, Instant::now()) {
                ForwardOutcome::Failed(LinkError::Shutdown { .. }) => break,
                ForwardOutcome::Failed(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "downstream link unusable, forwarding stopped");
                    break;
                }
                ForwardOutcome::Failed(_) => {
                    if shutdown.sleep(self.config.fault_wait) {
                        break;
                    }
                }
                ForwardOutcome::Forwarded | ForwardOutcome::Suppressed(_) => {}
            }
        }
    }
}
