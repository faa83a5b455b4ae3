//! Signal level monitor
//!
//! A minimal demodulation stage for the host binary: measures the power of
//! each converted buffer and watches the block sequence for gaps.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::sdr::{Demodulator, IqBuffer};

/// Full scale of a converted sample
const FULL_SCALE: f64 = i16::MAX as f64;

/// Floor reported for an all-zero buffer
const SILENCE_DBFS: f64 = -120.0;

/// Levels published by the monitor (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct SignalLevels {
    pub buffers: AtomicU64,
    pub samples: AtomicU64,
    /// Blocks missing from the sequence, i.e. dropped before conversion
    pub gaps: AtomicU64,
    /// Mean power of the last buffer, in hundredths of dBFS
    pub power_cdbfs: AtomicI32,
    /// Highest mean power seen, in hundredths of dBFS
    pub peak_cdbfs: AtomicI32,
}

impl SignalLevels {
    pub fn power_dbfs(&self) -> f64 {
        self.power_cdbfs.load(Ordering::Relaxed) as f64 / 100.0
    }

    pub fn peak_dbfs(&self) -> f64 {
        self.peak_cdbfs.load(Ordering::Relaxed) as f64 / 100.0
    }
}

/// Mean power of an I/Q buffer relative to i16 full scale
pub fn mean_power_dbfs(buf: &IqBuffer) -> f64 {
    if buf.is_empty() {
        return SILENCE_DBFS;
    }
    let sum: f64 = buf
        .i
        .iter()
        .zip(&buf.q)
        .map(|(&i, &q)| {
            let (i, q) = (i as f64 / FULL_SCALE, q as f64 / FULL_SCALE);
            i * i + q * q
        })
        .sum();
    let mean = sum / buf.len() as f64;
    if mean <= 0.0 {
        SILENCE_DBFS
    } else {
        (10.0 * mean.log10()).max(SILENCE_DBFS)
    }
}

pub struct SignalMonitor {
    levels: Arc<SignalLevels>,
    next_seq: Option<u64>,
    report_interval: Duration,
    last_report: Instant,
}

impl SignalMonitor {
    pub fn new(report_interval: Duration) -> Self {
        let levels = SignalLevels {
            peak_cdbfs: AtomicI32::new((SILENCE_DBFS * 100.0) as i32),
            power_cdbfs: AtomicI32::new((SILENCE_DBFS * 100.0) as i32),
            ..SignalLevels::default()
        };
        Self {
            levels: Arc::new(levels),
            next_seq: None,
            report_interval,
            last_report: Instant::now(),
        }
    }

    pub fn levels(&self) -> Arc<SignalLevels> {
        self.levels.clone()
    }
}

impl Demodulator for SignalMonitor {
    fn process(&mut self, samples: IqBuffer) {
        if let Some(expected) = self.next_seq {
            if samples.seq > expected {
                let missing = samples.seq - expected;
                self.levels.gaps.fetch_add(missing, Ordering::Relaxed);
                debug!("{} block(s) missing before block {}", missing, samples.seq);
            }
        }
        self.next_seq = Some(samples.seq + 1);

        let power = (mean_power_dbfs(&samples) * 100.0).round() as i32;
        self.levels.power_cdbfs.store(power, Ordering::Relaxed);
        self.levels.peak_cdbfs.fetch_max(power, Ordering::Relaxed);
        self.levels.buffers.fetch_add(1, Ordering::Relaxed);
        self.levels
            .samples
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        if self.last_report.elapsed() >= self.report_interval {
            info!(
                "[Signal] Power: {:.1} dBFS | Peak: {:.1} dBFS | Buffers: {} | Gaps: {}",
                self.levels.power_dbfs(),
                self.levels.peak_dbfs(),
                self.levels.buffers.load(Ordering::Relaxed),
                self.levels.gaps.load(Ordering::Relaxed)
            );
            self.last_report = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(seq: u64, value: i16, len: usize) -> IqBuffer {
        IqBuffer {
            seq,
            i: vec![value; len],
            q: vec![0; len],
        }
    }

    #[test]
    fn test_power_of_full_scale_and_silence() {
        let full = buffer(0, i16::MAX, 64);
        assert!(mean_power_dbfs(&full).abs() < 1e-9);

        let half = buffer(0, i16::MAX / 2, 64);
        assert!((mean_power_dbfs(&half) + 6.02).abs() < 0.01);

        assert_eq!(mean_power_dbfs(&buffer(0, 0, 64)), SILENCE_DBFS);
        assert_eq!(mean_power_dbfs(&IqBuffer::default()), SILENCE_DBFS);
    }

    #[test]
    fn test_gaps_counted_from_sequence() {
        let mut monitor = SignalMonitor::new(Duration::from_secs(60));
        let levels = monitor.levels();
        for seq in [0, 1, 4, 5, 9] {
            monitor.process(buffer(seq, 1000, 16));
        }
        assert_eq!(levels.buffers.load(Ordering::Relaxed), 5);
        assert_eq!(levels.samples.load(Ordering::Relaxed), 80);
        assert_eq!(levels.gaps.load(Ordering::Relaxed), 2 + 3);
    }

    #[test]
    fn test_peak_tracks_loudest_buffer() {
        let mut monitor = SignalMonitor::new(Duration::from_secs(60));
        let levels = monitor.levels();
        monitor.process(buffer(0, i16::MAX, 8));
        monitor.process(buffer(1, 100, 8));
        assert!(levels.peak_dbfs().abs() < 0.01);
        assert!(levels.power_dbfs() < -40.0);
    }
}
