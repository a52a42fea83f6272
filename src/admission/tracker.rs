//! Rolling reuse statistics.
//!
//! Everything on the request path is a map lookup plus relaxed atomic
//! updates. Concurrent updates may undercount slightly; that is acceptable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::dedup::ContextFingerprint;

const HISTOGRAM_SLOTS: usize = 32;

/// Per-context counters for the current window.
#[derive(Debug)]
struct ContextStats {
    /// Model that first served this context; retired samples are filed under it
    model_id: String,
    context_tokens: u64,
    sightings: AtomicU64,
    window_start_seq: AtomicU64,
    window_start_ms: AtomicU64,
    last_seen_ms: AtomicU64,
}

impl ContextStats {
    fn window_expired(&self, seq: u64, now_ms: u64, window_requests: u64, window_ms: u64) -> bool {
        seq.saturating_sub(self.window_start_seq.load(Ordering::Relaxed)) >= window_requests
            || now_ms.saturating_sub(self.window_start_ms.load(Ordering::Relaxed)) >= window_ms
    }
}

/// Distribution of reuse counts for contexts of one size class on one model.
///
/// Counts above the last slot saturate into it. When the sample total exceeds
/// the capacity every slot is halved, so old windows fade out.
#[derive(Debug)]
struct ReuseHistogram {
    slots: [AtomicU64; HISTOGRAM_SLOTS],
    total: AtomicU64,
}

impl ReuseHistogram {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, reuses: u64, capacity: u64) {
        let slot = (reuses as usize).min(HISTOGRAM_SLOTS - 1);
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if total > capacity.max(1) {
            let mut kept = 0;
            for slot in &self.slots {
                let halved = slot.load(Ordering::Relaxed) / 2;
                slot.store(halved, Ordering::Relaxed);
                kept += halved;
            }
            self.total.store(kept, Ordering::Relaxed);
        }
    }

    fn samples(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Lower median of the recorded reuse counts.
    fn median(&self) -> Option<u64> {
        let counts: Vec<u64> = self
            .slots
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return None;
        }
        let target = (total - 1) / 2;
        let mut seen = 0;
        for (reuses, count) in counts.iter().enumerate() {
            seen += count;
            if seen > target {
                return Some(reuses as u64);
            }
        }
        None
    }
}

/// Reuse history summary for one (model, size class).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReuseHistory {
    pub median: u64,
    pub samples: u64,
}

/// Power-of-two size class of a context.
pub fn size_bucket(tokens: u64) -> u32 {
    u64::BITS - tokens.leading_zeros()
}

/// Window and history bounds for the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerLimits {
    pub window_requests: u64,
    pub window: Duration,
    pub history_capacity: u64,
}

impl Default for TrackerLimits {
    fn default() -> Self {
        Self {
            window_requests: 1000,
            window: Duration::from_secs(24 * 60 * 60),
            history_capacity: 256,
        }
    }
}

/// Counts how often each context fingerprint is seen and remembers which
/// (model, context) pairs were written to a provider cache.
#[derive(Debug)]
pub struct ReuseTracker {
    epoch: Instant,
    seq: AtomicU64,
    window_requests: AtomicU64,
    window_ms: AtomicU64,
    history_capacity: AtomicU64,
    contexts: DashMap<ContextFingerprint, Arc<ContextStats>>,
    histories: DashMap<(String, u32), Arc<ReuseHistogram>>,
    writes: DashMap<(String, ContextFingerprint), u64>,
}

impl ReuseTracker {
    pub fn new(limits: TrackerLimits) -> Self {
        let tracker = Self {
            epoch: Instant::now(),
            seq: AtomicU64::new(0),
            window_requests: AtomicU64::new(0),
            window_ms: AtomicU64::new(0),
            history_capacity: AtomicU64::new(0),
            contexts: DashMap::new(),
            histories: DashMap::new(),
            writes: DashMap::new(),
        };
        tracker.set_limits(limits);
        tracker
    }

    pub fn set_limits(&self, limits: TrackerLimits) {
        self.window_requests
            .store(limits.window_requests.max(1), Ordering::Relaxed);
        self.window_ms
            .store(limits.window.as_millis().max(1) as u64, Ordering::Relaxed);
        self.history_capacity
            .store(limits.history_capacity.max(1), Ordering::Relaxed);
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Times this context was seen in its current window, not counting the
    /// request being decided.
    pub fn sightings(&self, fp: &ContextFingerprint, now: Instant) -> u64 {
        let Some(stats) = self.contexts.get(fp).map(|s| s.clone()) else {
            return 0;
        };
        let seq = self.seq.load(Ordering::Relaxed);
        if stats.window_expired(
            seq,
            self.millis(now),
            self.window_requests.load(Ordering::Relaxed),
            self.window_ms.load(Ordering::Relaxed),
        ) {
            0
        } else {
            stats.sightings.load(Ordering::Relaxed)
        }
    }

    /// Count one sighting of `fp`, served by `model_id`.
    pub fn observe(&self, fp: &ContextFingerprint, model_id: &str, context_tokens: u64, now: Instant) {
        let now_ms = self.millis(now);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stats = self
            .contexts
            .entry(fp.clone())
            .or_insert_with(|| {
                Arc::new(ContextStats {
                    model_id: model_id.to_string(),
                    context_tokens,
                    sightings: AtomicU64::new(0),
                    window_start_seq: AtomicU64::new(seq),
                    window_start_ms: AtomicU64::new(now_ms),
                    last_seen_ms: AtomicU64::new(now_ms),
                })
            })
            .clone();

        if stats.window_expired(
            seq,
            now_ms,
            self.window_requests.load(Ordering::Relaxed),
            self.window_ms.load(Ordering::Relaxed),
        ) {
            let finished = stats.sightings.swap(0, Ordering::Relaxed);
            stats.window_start_seq.store(seq, Ordering::Relaxed);
            stats.window_start_ms.store(now_ms, Ordering::Relaxed);
            self.retire(&stats, finished);
        }

        stats.sightings.fetch_add(1, Ordering::Relaxed);
        stats.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    /// File a finished window's reuse count (sightings after the first).
    fn retire(&self, stats: &ContextStats, sightings: u64) {
        if sightings == 0 {
            return;
        }
        self.record_sample(&stats.model_id, stats.context_tokens, sightings - 1);
    }

    /// Add one reuse observation for contexts of this size on this model.
    pub fn record_sample(&self, model_id: &str, context_tokens: u64, reuses: u64) {
        let key = (model_id.to_string(), size_bucket(context_tokens));
        let histogram = self
            .histories
            .entry(key)
            .or_insert_with(|| Arc::new(ReuseHistogram::new()))
            .clone();
        histogram.record(reuses, self.history_capacity.load(Ordering::Relaxed));
    }

    /// Median reuse for contexts of comparable size on `model_id`.
    pub fn history(&self, model_id: &str, context_tokens: u64) -> Option<ReuseHistory> {
        let histogram = self
            .histories
            .get(&(model_id.to_string(), size_bucket(context_tokens)))?
            .clone();
        Some(ReuseHistory {
            median: histogram.median()?,
            samples: histogram.samples(),
        })
    }

    /// Remember that `model_id` now holds `fp` in its provider cache.
    pub fn record_write(&self, model_id: &str, fp: &ContextFingerprint, now: Instant) {
        let now_ms = self.millis(now);
        self.writes
            .insert((model_id.to_string(), fp.clone()), now_ms);
    }

    /// Whether `model_id` wrote `fp` less than `ttl` ago.
    pub fn written_within(
        &self,
        model_id: &str,
        fp: &ContextFingerprint,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        let key = (model_id.to_string(), fp.clone());
        match self.writes.get(&key) {
            Some(written_ms) => {
                self.millis(now).saturating_sub(*written_ms) < ttl.as_millis() as u64
            }
            None => false,
        }
    }

    /// Retire contexts whose window has closed and forget old writes.
    ///
    /// A window closes after `window_requests` observations overall or
    /// `window` of wall time, whichever comes first. Single-use contexts
    /// never trigger the roll in `observe`, so this is where their zero-reuse
    /// samples reach the history.
    pub fn sweep(&self, now: Instant) -> usize {
        let now_ms = self.millis(now);
        let seq = self.seq.load(Ordering::Relaxed);
        let window_requests = self.window_requests.load(Ordering::Relaxed);
        let window_ms = self.window_ms.load(Ordering::Relaxed);

        let mut closed = Vec::new();
        self.contexts.retain(|_, stats| {
            let idle = now_ms.saturating_sub(stats.last_seen_ms.load(Ordering::Relaxed)) >= window_ms;
            if idle || stats.window_expired(seq, now_ms, window_requests, window_ms) {
                closed.push(stats.clone());
                false
            } else {
                true
            }
        });
        for stats in &closed {
            self.retire(stats, stats.sightings.load(Ordering::Relaxed));
        }

        self.writes
            .retain(|_, written_ms| now_ms.saturating_sub(*written_ms) < window_ms);

        if !closed.is_empty() {
            debug!(retired = closed.len(), "Retired closed context windows into reuse history");
        }
        closed.len()
    }

    pub fn tracked_contexts(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(window_requests: u64, window_secs: u64) -> TrackerLimits {
        TrackerLimits {
            window_requests,
            window: Duration::from_secs(window_secs),
            history_capacity: 256,
        }
    }

    #[test]
    fn test_size_bucket_is_power_of_two_class() {
        assert_eq!(size_bucket(0), 0);
        assert_eq!(size_bucket(1), 1);
        assert_eq!(size_bucket(2500), size_bucket(2048));
        assert_ne!(size_bucket(2047), size_bucket(2048));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sightings_count_within_window() {
        let tracker = ReuseTracker::new(TrackerLimits::default());
        let fp = ContextFingerprint::of("system");
        let now = Instant::now();
        assert_eq!(tracker.sightings(&fp, now), 0);
        for _ in 0..3 {
            tracker.observe(&fp, "test/sonnet", 2500, now);
        }
        assert_eq!(tracker.sightings(&fp, now), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_bound_rolls_window_into_history() {
        let tracker = ReuseTracker::new(limits(4, 86_400));
        let fp = ContextFingerprint::of("system");
        let other = ContextFingerprint::of("other");
        let now = Instant::now();

        tracker.observe(&fp, "test/sonnet", 2500, now);
        tracker.observe(&fp, "test/sonnet", 2500, now);
        tracker.observe(&other, "test/sonnet", 100, now);
        tracker.observe(&other, "test/sonnet", 100, now);
        // Fifth request overall: the first window of `fp` is over
        assert_eq!(tracker.sightings(&fp, now), 0);
        tracker.observe(&fp, "test/sonnet", 2500, now);

        let history = tracker.history("test/sonnet", 2500).unwrap();
        assert_eq!(history.samples, 1);
        assert_eq!(history.median, 1);
        assert_eq!(tracker.sightings(&fp, now), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_bound_expires_window() {
        let tracker = ReuseTracker::new(limits(1000, 60));
        let fp = ContextFingerprint::of("system");
        let t0 = Instant::now();
        tracker.observe(&fp, "m", 2000, t0);
        assert_eq!(tracker.sightings(&fp, t0 + Duration::from_secs(59)), 1);
        assert_eq!(tracker.sightings(&fp, t0 + Duration::from_secs(60)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retires_idle_contexts() {
        let tracker = ReuseTracker::new(limits(1000, 60));
        let t0 = Instant::now();
        for i in 0..3 {
            let fp = ContextFingerprint::of(&format!("ctx-{}", i));
            for _ in 0..=i {
                tracker.observe(&fp, "m", 3000, t0);
            }
        }
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(30)), 0);
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(61)), 3);
        assert_eq!(tracker.tracked_contexts(), 0);

        // Reuses 0, 1, 2
        let history = tracker.history("m", 3000).unwrap();
        assert_eq!(history.samples, 3);
        assert_eq!(history.median, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_retires_windows_closed_by_request_count() {
        let tracker = ReuseTracker::new(limits(1000, 86_400));
        let t0 = Instant::now();
        for i in 0..1500 {
            let fp = ContextFingerprint::of(&format!("single-use-{}", i));
            tracker.observe(&fp, "test/sonnet", 2500, t0);
        }

        // Contexts 0..=500 opened at least 1000 requests ago
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(3600)), 501);
        assert_eq!(tracker.tracked_contexts(), 999);

        let history = tracker.history("test/sonnet", 2500).unwrap();
        assert_eq!(history.median, 0);
        assert!(history.samples > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_expire_with_ttl() {
        let tracker = ReuseTracker::new(TrackerLimits::default());
        let fp = ContextFingerprint::of("system");
        let t0 = Instant::now();
        tracker.record_write("test/sonnet", &fp, t0);

        let ttl = Duration::from_secs(300);
        assert!(tracker.written_within("test/sonnet", &fp, ttl, t0 + Duration::from_secs(299)));
        assert!(!tracker.written_within("test/sonnet", &fp, ttl, t0 + Duration::from_secs(300)));
        assert!(!tracker.written_within("test/opus", &fp, ttl, t0));
    }

    #[test]
    fn test_histogram_decays_past_capacity() {
        let histogram = ReuseHistogram::new();
        for _ in 0..4 {
            histogram.record(0, 4);
        }
        for _ in 0..2 {
            histogram.record(9, 4);
        }
        // 5th sample halved [4 zeros, 1 nine] to [2, 0]; then one more nine
        assert_eq!(histogram.samples(), 3);
        assert_eq!(histogram.median(), Some(0));
    }
}
