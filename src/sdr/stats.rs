//! Pipeline counters (atomic for thread-safe access)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Counters shared by the capture callback, conversion stage and tuner
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub blocks_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub blocks_enqueued: AtomicU64,
    pub blocks_dropped: AtomicU64,
    pub backpressure_waits: AtomicU64,
    pub oversized_blocks: AtomicU64,
    pub malformed_blocks: AtomicU64,
    pub blocks_converted: AtomicU64,
    pub samples_converted: AtomicU64,
    pub retunes: AtomicU64,
    pub retune_failures: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self, bytes: usize) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.blocks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_converted(&self, samples: usize) {
        self.blocks_converted.fetch_add(1, Ordering::Relaxed);
        self.samples_converted
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_retune(&self, ok: bool) {
        self.retunes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.retune_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: Utc::now(),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            blocks_enqueued: self.blocks_enqueued.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            oversized_blocks: self.oversized_blocks.load(Ordering::Relaxed),
            malformed_blocks: self.malformed_blocks.load(Ordering::Relaxed),
            blocks_converted: self.blocks_converted.load(Ordering::Relaxed),
            samples_converted: self.samples_converted.load(Ordering::Relaxed),
            retunes: self.retunes.load(Ordering::Relaxed),
            retune_failures: self.retune_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub blocks_received: u64,
    pub bytes_received: u64,
    pub blocks_enqueued: u64,
    pub blocks_dropped: u64,
    pub backpressure_waits: u64,
    pub oversized_blocks: u64,
    pub malformed_blocks: u64,
    pub blocks_converted: u64,
    pub samples_converted: u64,
    pub retunes: u64,
    pub retune_failures: u64,
}

impl StatsSnapshot {
    /// Input sample rate implied by two snapshots, in samples per second
    pub fn input_rate_since(&self, earlier: &StatsSnapshot) -> f64 {
        let elapsed = (self.taken_at - earlier.taken_at).num_milliseconds();
        if elapsed <= 0 {
            return 0.0;
        }
        let samples = self.bytes_received.saturating_sub(earlier.bytes_received) / 2;
        samples as f64 * 1000.0 / elapsed as f64
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blocks: {} rx / {} queued / {} converted | Dropped: {} | Stalls: {} | Oversized: {} | Malformed: {} | Samples out: {} | Retunes: {} ({} failed)",
            self.blocks_received,
            self.blocks_enqueued,
            self.blocks_converted,
            self.blocks_dropped,
            self.backpressure_waits,
            self.oversized_blocks,
            self.malformed_blocks,
            self.samples_converted,
            self.retunes,
            self.retune_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = PipelineStats::new();
        stats.record_received(512);
        stats.record_received(512);
        stats.record_converted(128);
        stats.record_retune(true);
        stats.record_retune(false);

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_received, 2);
        assert_eq!(snap.bytes_received, 1024);
        assert_eq!(snap.samples_converted, 128);
        assert_eq!(snap.retunes, 2);
        assert_eq!(snap.retune_failures, 1);
    }

    #[test]
    fn test_display_includes_stalls() {
        let stats = PipelineStats::new();
        stats.record_backpressure();
        stats.record_backpressure();
        stats.record_dropped();
        let line = stats.snapshot().to_string();
        assert!(line.contains("Dropped: 1"), "{}", line);
        assert!(line.contains("Stalls: 2"), "{}", line);
    }

    #[test]
    fn test_input_rate() {
        let stats = PipelineStats::new();
        let mut earlier = stats.snapshot();
        earlier.taken_at = earlier.taken_at - chrono::Duration::seconds(2);
        stats.record_received(4_000_000);
        let later = stats.snapshot();
        let rate = later.input_rate_since(&earlier);
        assert!((rate - 1_000_000.0).abs() < 10_000.0, "rate = {}", rate);
    }
}
