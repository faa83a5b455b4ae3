//! Sample format conversion
//!
//! RTL-SDR outputs 8-bit unsigned IQ samples (I, Q pairs). The conversion
//! stage centers them, spreads them over the i16 range and keeps every
//! `stride`-th pair:
//!
//! ```text
//! out = clamp(round((byte - 127.4) * 256), i16::MIN, i16::MAX)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::handoff::HandoffReceiver;
use super::stats::PipelineStats;
use crate::error::BlockAnomaly;

/// DC offset of the dongle's unsigned 8-bit output
pub const DC_OFFSET: f64 = 127.4;

/// Scale from 8-bit steps to 16-bit steps
pub const SAMPLE_GAIN: f64 = 256.0;

/// How long the conversion loop waits before re-checking the stop flag
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Decimated signed 16-bit I/Q samples for one raw block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IqBuffer {
    /// Sequence number of the raw block these samples came from
    pub seq: u64,
    pub i: Vec<i16>,
    pub q: Vec<i16>,
}

impl IqBuffer {
    pub fn len(&self) -> usize {
        self.i.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i.is_empty()
    }
}

/// Downstream consumer of converted samples.
///
/// Called synchronously on the conversion thread; the time spent here gates
/// how soon the next raw block is taken from the queue.
pub trait Demodulator: Send {
    fn process(&mut self, samples: IqBuffer);
}

impl<F> Demodulator for F
where
    F: FnMut(IqBuffer) + Send,
{
    fn process(&mut self, samples: IqBuffer) {
        self(samples)
    }
}

/// Pre-computed byte → i16 lookup table
pub struct SampleTable {
    table: [i16; 256],
}

impl SampleTable {
    pub fn new() -> Self {
        let mut table = [0i16; 256];
        for (byte, slot) in table.iter_mut().enumerate() {
            *slot = Self::compute(byte as u8);
        }
        Self { table }
    }

    /// Saturating conversion of a single byte (no table)
    pub fn compute(byte: u8) -> i16 {
        let scaled = ((byte as f64 - DC_OFFSET) * SAMPLE_GAIN).round();
        scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    #[inline(always)]
    pub fn convert(&self, byte: u8) -> i16 {
        self.table[byte as usize]
    }
}

impl Default for SampleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest stride whose span in bytes (`2 * stride`) fits in `usize`
pub const MAX_STRIDE: usize = usize::MAX / 2;

/// Converts raw blocks into decimated [`IqBuffer`]s
pub struct Converter {
    table: SampleTable,
    stride: usize,
}

impl Converter {
    /// `stride` 1 keeps every pair, 2 every other pair, and so on.
    /// Clamped to `1..=MAX_STRIDE`.
    pub fn new(stride: usize) -> Self {
        Self {
            table: SampleTable::new(),
            stride: stride.clamp(1, MAX_STRIDE),
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of output samples for a block of `len` bytes
    pub fn output_len(&self, len: usize) -> usize {
        len / (2 * self.stride)
    }

    /// Convert one block.
    ///
    /// Empty blocks, and blocks too short to yield a single sample, are
    /// rejected. An odd trailing byte is ignored; the caller is told through
    /// the second tuple element so it can be reported.
    pub fn convert(
        &self,
        seq: u64,
        block: &[u8],
    ) -> Result<(IqBuffer, Option<BlockAnomaly>), BlockAnomaly> {
        let n = self.output_len(block.len());
        if n == 0 {
            return Err(BlockAnomaly::Malformed { len: block.len() });
        }
        let anomaly = (block.len() % 2 != 0).then_some(BlockAnomaly::Malformed { len: block.len() });

        let mut out = IqBuffer {
            seq,
            i: Vec::with_capacity(n),
            q: Vec::with_capacity(n),
        };
        for pair in block.chunks_exact(2 * self.stride) {
            out.i.push(self.table.convert(pair[0]));
            out.q.push(self.table.convert(pair[1]));
        }
        Ok((out, anomaly))
    }
}

/// Conversion loop (runs in dedicated thread).
///
/// Pulls raw blocks until the stop flag clears or the producer goes away,
/// hands each converted buffer to `demod`, then returns the raw buffer to
/// the capture side through `recycle`.
pub fn run_conversion(
    queue: HandoffReceiver,
    converter: Converter,
    mut demod: Box<dyn Demodulator>,
    recycle: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) {
    info!(
        "Conversion stage started (decimation stride {})",
        converter.stride()
    );
    let mut expected_seq = 0u64;

    while running.load(Ordering::SeqCst) {
        let block = match queue.dequeue_timeout(STOP_POLL_INTERVAL) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Handoff queue closed by producer");
                break;
            }
        };

        if block.seq != expected_seq {
            debug!(
                "Sequence gap: expected block {}, got {}",
                expected_seq, block.seq
            );
        }
        expected_seq = block.seq + 1;

        match converter.convert(block.seq, &block.data) {
            Ok((samples, anomaly)) => {
                if let Some(anomaly) = anomaly {
                    stats.record_malformed();
                    warn!("Block {}: {} (trailing byte ignored)", block.seq, anomaly);
                }
                stats.record_converted(samples.len());
                demod.process(samples);
            }
            Err(anomaly) => {
                stats.record_malformed();
                warn!("Block {}: {}, discarded", block.seq, anomaly);
            }
        }

        // Capture side may already be gone during shutdown.
        let _ = recycle.try_send(block.data);
    }

    info!("Conversion stage stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdr::handoff::{channel, OverflowPolicy, RawBlock};
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_boundary_bytes() {
        let table = SampleTable::new();
        assert_eq!(table.convert(0), -32614);
        assert_eq!(table.convert(255), 32666);
        assert_eq!(table.convert(127), -102);
        assert_eq!(table.convert(128), 154);
    }

    #[test]
    fn test_table_matches_formula_for_every_byte() {
        let table = SampleTable::new();
        for b in 0..=255u8 {
            let expected = ((b as f64 - 127.4) * 256.0)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            assert_eq!(table.convert(b), expected, "byte {}", b);
        }
    }

    #[test]
    fn test_output_is_monotonic() {
        let table = SampleTable::new();
        assert!((0..255u8).all(|b| table.convert(b) < table.convert(b + 1)));
    }

    #[test]
    fn test_stride_one_keeps_every_pair() {
        let conv = Converter::new(1);
        let block = [10, 20, 30, 40, 50, 60, 70, 80];
        let (out, anomaly) = conv.convert(0, &block).unwrap();
        assert!(anomaly.is_none());
        assert_eq!(out.len(), 4);
        let i: Vec<i16> = [10, 30, 50, 70].iter().map(|&b| SampleTable::compute(b)).collect();
        let q: Vec<i16> = [20, 40, 60, 80].iter().map(|&b| SampleTable::compute(b)).collect();
        assert_eq!(out.i, i);
        assert_eq!(out.q, q);
    }

    #[test]
    fn test_stride_two_skips_every_other_pair() {
        let conv = Converter::new(2);
        let block = [10, 20, 30, 40, 50, 60, 70, 80];
        let (out, _) = conv.convert(7, &block).unwrap();
        assert_eq!(out.seq, 7);
        assert_eq!(out.i, vec![SampleTable::compute(10), SampleTable::compute(50)]);
        assert_eq!(out.q, vec![SampleTable::compute(20), SampleTable::compute(60)]);
    }

    #[test]
    fn test_output_length_is_floor() {
        for stride in 1..=4 {
            let conv = Converter::new(stride);
            for len in (2..=64).step_by(2) {
                let block = vec![128u8; len];
                match conv.convert(0, &block) {
                    Ok((out, _)) => {
                        assert_eq!(out.len(), len / (2 * stride));
                        assert_eq!(out.i.len(), out.q.len());
                    }
                    Err(_) => assert!(len < 2 * stride),
                }
            }
        }
    }

    #[test]
    fn test_huge_stride_is_clamped() {
        let conv = Converter::new(usize::MAX);
        assert_eq!(conv.stride(), MAX_STRIDE);
        assert_eq!(conv.output_len(4096), 0);
        assert!(conv.convert(0, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_malformed_blocks() {
        let conv = Converter::new(1);
        assert_eq!(
            conv.convert(0, &[]).unwrap_err(),
            BlockAnomaly::Malformed { len: 0 }
        );

        let (out, anomaly) = conv.convert(0, &[10, 20, 30]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(anomaly, Some(BlockAnomaly::Malformed { len: 3 }));

        let conv = Converter::new(4);
        assert!(conv.convert(0, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_conversion_loop_delivers_in_order_and_recycles() {
        let stats = PipelineStats::new();
        let (tx, rx) = channel(2, OverflowPolicy::Block, stats.clone());
        let (recycle_tx, recycle_rx) = crossbeam_channel::bounded(8);
        let running = Arc::new(AtomicBool::new(true));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let demod = move |buf: IqBuffer| sink.lock().unwrap().push((buf.seq, buf.len()));

        let worker = {
            let running = running.clone();
            let stats = stats.clone();
            thread::spawn(move || {
                run_conversion(rx, Converter::new(2), Box::new(demod), recycle_tx, running, stats)
            })
        };

        tx.enqueue(RawBlock { seq: 0, data: vec![128; 16] }).unwrap();
        tx.enqueue(RawBlock { seq: 1, data: vec![] }).unwrap();
        tx.enqueue(RawBlock { seq: 2, data: vec![128; 8] }).unwrap();
        drop(tx);
        worker.join().unwrap();

        assert_eq!(*received.lock().unwrap(), vec![(0, 4), (2, 2)]);
        let snap = stats.snapshot();
        assert_eq!(snap.blocks_converted, 2);
        assert_eq!(snap.malformed_blocks, 1);
        assert_eq!(recycle_rx.len(), 3);
    }

    #[test]
    fn test_conversion_loop_honours_stop_flag() {
        let stats = PipelineStats::new();
        let (_tx, rx) = channel(1, OverflowPolicy::Block, stats.clone());
        let (recycle_tx, _recycle_rx) = crossbeam_channel::bounded(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = running.clone();
            thread::spawn(move || {
                run_conversion(
                    rx,
                    Converter::new(1),
                    Box::new(|_: IqBuffer| {}),
                    recycle_tx,
                    running,
                    stats,
                )
            })
        };

        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();
    }
}
