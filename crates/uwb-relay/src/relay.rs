//! # Relay runtime
//!
//! Two long-running threads connected only by a [`LatestSlot`]:
//!
//! - **receive** (`uwb-rx`): inbound [`SerialLink`] → [`FrameDecoder`] →
//!   [`StabilizationGate`] → `slot.publish`
//! - **forward** (`uwb-fwd`): `slot.consume` → [`TransmitThrottler`] →
//!   outbound [`SerialLink`]
//!
//! Every wait in either loop is bounded, so a single [`Shutdown`] trigger is
//! observed by both threads within one read timeout. Each thread closes its
//! own link on the way out; [`Relay::shutdown`] joins them.
//!
//! Without an outbound link only the receive thread runs and the embedding
//! application consumes from [`Relay::slot`] itself.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::encoder::DownstreamEncoder;
use crate::error::{LinkError, RelayError};
use crate::frame::{ByteSource, DecodeEvent, DistanceSample, FrameDecoder};
use crate::gate::{StabilizationGate, DEFAULT_REQUIRED_FRAMES};
use crate::link::{PortOpener, SerialLink, DEFAULT_TIMEOUT};
use crate::shutdown::Shutdown;
use crate::slot::LatestSlot;
use crate::stats::{bump, RelayStats};
use crate::throttle::TransmitThrottler;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSettings {
    pub read_timeout: Duration,
    pub required_frames: u32,
    /// Wait after the initial open before decoding, then clear the input
    /// buffer. Gives the sensor time to boot.
    pub settle_delay: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            required_frames: DEFAULT_REQUIRED_FRAMES,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

// ─── Receive pipeline ───────────────────────────────────────────────────────

/// Decoder plus gate, stepped once per loop iteration by the receive thread.
pub struct ReceivePipeline {
    decoder: FrameDecoder,
    gate: StabilizationGate,
    stats: Arc<RelayStats>,
}

impl ReceivePipeline {
    pub fn new(settings: &ReceiveSettings, stats: Arc<RelayStats>) -> Self {
        Self {
            decoder: FrameDecoder::new(settings.read_timeout),
            gate: StabilizationGate::new(settings.required_frames),
            stats,
        }
    }

    pub fn gate(&self) -> &StabilizationGate {
        &self.gate
    }

    /// Runs one decode step and publishes the sample if the gate admits it.
    ///
    /// Link faults reset the gate and are absorbed here (the link has
    /// already logged them and will reopen on the next read). Only
    /// shutdown and fatal link errors are returned.
    pub fn step<S: ByteSource + ?Sized>(
        &mut self,
        source: &mut S,
        slot: &LatestSlot<DistanceSample>,
    ) -> Result<Option<DistanceSample>, LinkError> {
        match self.decoder.next_event(source) {
            Ok(DecodeEvent::Sample(sample)) => {
                bump(&self.stats.frames_decoded);
                let Some(sample) = self.gate.admit(sample) else {
                    return Ok(None);
                };
                if slot.publish(sample) {
                    bump(&self.stats.samples_overwritten);
                }
                bump(&self.stats.samples_published);
                trace!(distance_mm = sample.distance_mm(), "distance published");
                Ok(Some(sample))
            }
            Ok(DecodeEvent::Skipped) => {
                bump(&self.stats.bytes_skipped);
                Ok(None)
            }
            Ok(DecodeEvent::Idle) => Ok(None),
            Ok(DecodeEvent::Malformed(e)) => {
                bump(&self.stats.frames_malformed);
                self.gate.on_decode_error();
                trace!(error = %e, "malformed frame discarded");
                Ok(None)
            }
            Err(LinkError::Fault { .. }) => {
                self.gate.reset();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────────

/// Handle to the running relay threads. Dropping it shuts them down.
pub struct Relay {
    shutdown: Shutdown,
    stats: Arc<RelayStats>,
    slot: Arc<LatestSlot<DistanceSample>>,
    handles: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Starts only the receive thread. Samples are left in [`Relay::slot`].
    ///
    /// Fails if the inbound port cannot be opened.
    pub fn receive_only<I>(
        inbound: SerialLink<I>,
        settings: ReceiveSettings,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError>
    where
        I: PortOpener + 'static,
    {
        let mut inbound = inbound.with_counters(stats.inbound.clone());
        inbound.ensure_open()?;

        let mut relay = Relay::idle(inbound.shutdown_signal().clone(), stats);
        relay.spawn_receiver(inbound, settings)?;
        Ok(relay)
    }

    /// Starts the receive and forward threads.
    ///
    /// Both ports are opened before either thread starts, so a missing or
    /// inaccessible port fails here rather than in a background thread.
    /// Both links must carry clones of the same [`Shutdown`]; otherwise
    /// nothing is opened and [`RelayError::ForeignShutdown`] is returned.
    pub fn with_forwarding<I, O, E>(
        inbound: SerialLink<I>,
        settings: ReceiveSettings,
        outbound: SerialLink<O>,
        throttler: TransmitThrottler<E>,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError>
    where
        I: PortOpener + 'static,
        O: PortOpener + 'static,
        E: DownstreamEncoder + 'static,
    {
        if !outbound.shutdown_signal().same_as(inbound.shutdown_signal()) {
            return Err(RelayError::ForeignShutdown {
                port: outbound.name().to_string(),
            });
        }

        let mut inbound = inbound.with_counters(stats.inbound.clone());
        inbound.ensure_open()?;
        let mut outbound = outbound.with_counters(stats.outbound.clone());
        outbound.ensure_open()?;

        let throttler = throttler.with_stats(stats.clone());
        let mut relay = Relay::idle(inbound.shutdown_signal().clone(), stats);
        relay.spawn_receiver(inbound, settings)?;
        relay.spawn_forwarder(outbound, throttler)?;
        Ok(relay)
    }

    fn idle(shutdown: Shutdown, stats: Arc<RelayStats>) -> Self {
        Self {
            shutdown,
            stats,
            slot: Arc::new(LatestSlot::new()),
            handles: Vec::new(),
        }
    }

    fn spawn_receiver<I>(
        &mut self,
        link: SerialLink<I>,
        settings: ReceiveSettings,
    ) -> Result<(), RelayError>
    where
        I: PortOpener + 'static,
    {
        let pipeline = ReceivePipeline::new(&settings, self.stats.clone());
        let slot = self.slot.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("uwb-rx".into())
            .spawn(move || {
                receive_worker(link, pipeline, settings.settle_delay, &slot, &shutdown)
            })
            .map_err(|source| RelayError::Spawn {
                name: "receive",
                source,
            })?;
        self.handles.push(handle);
        Ok(())
    }

    fn spawn_forwarder<O, E>(
        &mut self,
        mut link: SerialLink<O>,
        mut throttler: TransmitThrottler<E>,
    ) -> Result<(), RelayError>
    where
        O: PortOpener + 'static,
        E: DownstreamEncoder + 'static,
    {
        let slot = self.slot.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("uwb-fwd".into())
            .spawn(move || {
                info!(port = %link.name(), "forwarding distances");
                throttler.run(&slot, &mut link, &shutdown);
                link.close();
            })
            .map_err(|source| RelayError::Spawn {
                name: "forward",
                source,
            })?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// The hand-off slot. Consume from it only when no forward thread runs.
    pub fn slot(&self) -> Arc<LatestSlot<DistanceSample>> {
        self.slot.clone()
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Whether every relay thread is still running.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(|h| !h.is_finished())
    }

    /// Signals shutdown and joins the threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.trigger();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("relay").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "relay thread panicked");
            } else {
                debug!(thread = %name, "relay thread joined");
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_worker<I: PortOpener>(
    mut link: SerialLink<I>,
    mut pipeline: ReceivePipeline,
    settle_delay: Duration,
    slot: &LatestSlot<DistanceSample>,
    shutdown: &Shutdown,
) {
    if !settle_delay.is_zero() {
        info!(
            port = %link.name(),
            settle_ms = settle_delay.as_millis() as u64,
            "waiting for sensor to settle"
        );
        if shutdown.sleep(settle_delay) {
            link.close();
            return;
        }
        // Bytes accumulated while the sensor booted are not worth decoding.
        if let Err(e) = link.reset_input_buffer() {
            debug!(error = %e, "input clear after settle failed");
        }
    }

    info!(port = %link.name(), "receiving distance frames");
    while !shutdown.is_triggered() {
        match pipeline.step(&mut link, slot) {
            Ok(_) => {}
            Err(LinkError::Shutdown { .. }) => break,
            Err(e) => {
                error!(error = %e, "inbound link unusable, receive stopped");
                break;
            }
        }
    }
    link.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scripted;

    fn settings(required_frames: u32) -> ReceiveSettings {
        ReceiveSettings {
            read_timeout: Duration::from_millis(20),
            required_frames,
            settle_delay: Duration::ZERO,
        }
    }

    fn step_n(
        pipeline: &mut ReceivePipeline,
        link: &mut SerialLink<crate::test_util::ScriptedOpener>,
        slot: &LatestSlot<DistanceSample>,
        n: usize,
    ) -> Vec<u16> {
        (0..n)
            .filter_map(|_| pipeline.step(link, slot).unwrap())
            .map(|s| s.distance_mm())
            .collect()
    }

    #[test]
    fn fault_destabilizes_until_fresh_streak() {
        let (opener, handle) = scripted("sensor");
        let mut link = SerialLink::new(opener, Duration::from_millis(5), Shutdown::new());
        let slot = LatestSlot::new();
        let stats = Arc::new(RelayStats::new());
        let mut pipeline = ReceivePipeline::new(&settings(3), stats.clone());

        handle.push_frames(10, 3);
        assert!(step_n(&mut pipeline, &mut link, &slot, 3).is_empty());
        assert!(pipeline.gate().is_stable());

        handle.push_fault();
        assert_eq!(pipeline.step(&mut link, &slot).unwrap(), None);
        assert!(!pipeline.gate().is_stable(), "fault must reset the gate at once");

        handle.push_frames(30, 3);
        handle.push_frame(40);
        assert_eq!(step_n(&mut pipeline, &mut link, &slot, 4), vec![40]);
        assert_eq!(link.generation(), 2);
        assert_eq!(stats.snapshot().samples_published, 1);
    }

    #[test]
    fn malformed_frame_during_warmup_restarts_count() {
        let (opener, handle) = scripted("sensor");
        let mut link = SerialLink::new(opener, Duration::from_millis(5), Shutdown::new());
        let slot = LatestSlot::new();
        let mut pipeline = ReceivePipeline::new(&settings(2), Arc::new(RelayStats::new()));

        handle.push_frame(1);
        handle.push_bytes(&[0x02, 0x00, 0x01, 0xEE]);
        handle.push_frame(2);
        handle.push_frame(3);
        handle.push_frame(4);

        assert_eq!(step_n(&mut pipeline, &mut link, &slot, 5), vec![4]);
        assert_eq!(slot.try_consume().map(|s| s.distance_mm()), Some(4));
    }

    #[test]
    fn missing_inbound_port_fails_at_start() {
        let (opener, handle) = scripted("/dev/ttyUSB9");
        handle.fail_next_opens(1);
        let link = SerialLink::new(opener, Duration::from_millis(5), Shutdown::new());

        let err = Relay::receive_only(link, settings(1), Arc::new(RelayStats::new()))
            .err()
            .expect("open must fail");
        assert!(matches!(err, RelayError::Link(ref e) if e.is_fatal()), "got {err}");
    }
}
