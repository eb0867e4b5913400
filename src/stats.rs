use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of the receive path, updated without taking the rx lock.
#[derive(Debug, Default)]
pub struct RxStats {
    pub(crate) packets: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) too_small: AtomicU64,
    pub(crate) unknown_protocol: AtomicU64,
    pub(crate) violations: AtomicU64,
    pub(crate) errored_frames: AtomicU64,
    pub(crate) exhaustion: AtomicU64,
    pub(crate) segments: AtomicU64,
    pub(crate) split_stalls: AtomicU64,
    pub(crate) unsplittable: AtomicU64,
    pub(crate) checksum_failures: AtomicU64,
    pub(crate) oversized: AtomicU64,
    pub(crate) pages_trimmed: AtomicU64,
    pub(crate) shutdown_wakes: AtomicU64,
}

/// Plain copy of [`RxStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStatsSnapshot {
    /// Packets handed to the host stack.
    pub packets: u64,
    pub bytes: u64,
    /// Frames dropped by the packet filter.
    pub filtered: u64,
    pub too_small: u64,
    pub unknown_protocol: u64,
    /// Responses rejected for bad bounds, id mismatch or an unposted slot.
    pub violations: u64,
    /// Frames dropped because one of their responses was rejected.
    pub errored_frames: u64,
    /// Passes that ran out of buffers, request ids or grants.
    pub exhaustion: u64,
    /// Packets produced by receive-side segmentation.
    pub segments: u64,
    pub split_stalls: u64,
    /// GSO frames delivered whole because an MSS segment exceeds a page.
    pub unsplittable: u64,
    pub checksum_failures: u64,
    /// Packets longer than the MTU allows.
    pub oversized: u64,
    pub pages_trimmed: u64,
    /// Times a shutdown waiter was woken.
    pub shutdown_wakes: u64,
}

impl RxStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> RxStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RxStatsSnapshot {
            packets: get(&self.packets),
            bytes: get(&self.bytes),
            filtered: get(&self.filtered),
            too_small: get(&self.too_small),
            unknown_protocol: get(&self.unknown_protocol),
            violations: get(&self.violations),
            errored_frames: get(&self.errored_frames),
            exhaustion: get(&self.exhaustion),
            segments: get(&self.segments),
            split_stalls: get(&self.split_stalls),
            unsplittable: get(&self.unsplittable),
            checksum_failures: get(&self.checksum_failures),
            oversized: get(&self.oversized),
            pages_trimmed: get(&self.pages_trimmed),
            shutdown_wakes: get(&self.shutdown_wakes),
        }
    }
}
