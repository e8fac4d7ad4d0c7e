//! Relay counters.
//!
//! Written from the receive and forward threads with relaxed atomics and
//! read as a [`StatsSnapshot`] for periodic logging. Counters carry no
//! control state; neither thread ever branches on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-link lifecycle counters, shared with the owning [`SerialLink`](crate::link::SerialLink).
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub faults: AtomicU64,
    pub reopens: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub frames_decoded: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub bytes_skipped: AtomicU64,
    pub samples_published: AtomicU64,
    pub samples_overwritten: AtomicU64,
    pub forwarded: AtomicU64,
    pub suppressed_unchanged: AtomicU64,
    pub suppressed_interval: AtomicU64,
    pub forward_failures: AtomicU64,
    pub inbound: Arc<LinkCounters>,
    pub outbound: Arc<LinkCounters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_decoded: u64,
    pub frames_malformed: u64,
    pub bytes_skipped: u64,
    pub samples_published: u64,
    pub samples_overwritten: u64,
    pub forwarded: u64,
    pub suppressed_unchanged: u64,
    pub suppressed_interval: u64,
    pub forward_failures: u64,
    pub inbound_faults: u64,
    pub inbound_reopens: u64,
    pub outbound_faults: u64,
    pub outbound_reopens: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_decoded: load(&self.frames_decoded),
            frames_malformed: load(&self.frames_malformed),
            bytes_skipped: load(&self.bytes_skipped),
            samples_published: load(&self.samples_published),
            samples_overwritten: load(&self.samples_overwritten),
            forwarded: load(&self.forwarded),
            suppressed_unchanged: load(&self.suppressed_unchanged),
            suppressed_interval: load(&self.suppressed_interval),
            forward_failures: load(&self.forward_failures),
            inbound_faults: load(&self.inbound.faults),
            inbound_reopens: load(&self.inbound.reopens),
            outbound_faults: load(&self.outbound.faults),
            outbound_reopens: load(&self.outbound.reopens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RelayStats::new();
        bump(&stats.frames_decoded);
        bump(&stats.frames_decoded);
        bump(&stats.forwarded);
        bump(&stats.inbound.faults);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_decoded, 2);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.inbound_faults, 1);
        assert_eq!(snap.outbound_faults, 0);
    }
}
