//! Capture thread glue
//!
//! The device's blocking stream call runs on a dedicated thread and invokes
//! [`BlockForwarder::forward`] once per raw block. The forwarder only checks
//! the block size, copies the bytes into a recycled buffer and enqueues it;
//! all conversion happens on the conversion thread.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, trace, warn};

use super::handoff::{Enqueued, HandoffSender, RawBlock};
use super::stats::PipelineStats;
use crate::device::TunerDevice;
use crate::error::{BlockAnomaly, CaptureError};

/// Minimum time between two queue-overflow warnings
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Body of the device callback
pub struct BlockForwarder {
    queue: HandoffSender,
    pool: Receiver<Vec<u8>>,
    /// Buffer of the last dropped block, reused before asking the pool
    spare: Option<Vec<u8>>,
    max_block_size: usize,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    next_seq: u64,
    first_block: bool,
    drops_since_log: u64,
    last_drop_log: Option<Instant>,
}

impl BlockForwarder {
    pub fn new(
        queue: HandoffSender,
        pool: Receiver<Vec<u8>>,
        max_block_size: usize,
        running: Arc<AtomicBool>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue,
            pool,
            spare: None,
            max_block_size,
            running,
            stats,
            next_seq: 0,
            first_block: true,
            drops_since_log: 0,
            last_drop_log: None,
        }
    }

    /// Handle one block delivered by the device
    pub fn forward(&mut self, data: &[u8]) -> ControlFlow<()> {
        if !self.running.load(Ordering::SeqCst) {
            return ControlFlow::Break(());
        }

        self.stats.record_received(data.len());

        if data.len() > self.max_block_size {
            self.stats.record_oversized();
            warn!(
                "{}, discarded",
                BlockAnomaly::Oversized {
                    len: data.len(),
                    max: self.max_block_size
                }
            );
            return ControlFlow::Continue(());
        }

        if self.first_block {
            self.first_block = false;
            info!("First IQ data received! ({} bytes)", data.len());
            trace!("First bytes: {}", hex::encode(&data[..data.len().min(16)]));
        }

        let mut buffer = match self.spare.take() {
            Some(buffer) => buffer,
            None => self
                .pool
                .try_recv()
                .unwrap_or_else(|_| Vec::with_capacity(self.max_block_size)),
        };
        buffer.clear();
        buffer.extend_from_slice(data);

        let seq = self.next_seq;
        self.next_seq += 1;

        match self.queue.enqueue(RawBlock { seq, data: buffer }) {
            Ok(Enqueued::Queued) => ControlFlow::Continue(()),
            Ok(Enqueued::Dropped(block)) => {
                self.spare = Some(block.data);
                self.note_drop(seq);
                ControlFlow::Continue(())
            }
            Err(_) => {
                debug!("Conversion stage gone, ending stream");
                ControlFlow::Break(())
            }
        }
    }

    /// Log overflow at most once per interval; every drop is already counted
    fn note_drop(&mut self, seq: u64) {
        self.drops_since_log += 1;
        let due = self
            .last_drop_log
            .map_or(true, |t| t.elapsed() >= DROP_LOG_INTERVAL);
        if due {
            warn!(
                "{} ({} dropped since last report)",
                BlockAnomaly::QueueOverflow { seq },
                self.drops_since_log
            );
            self.drops_since_log = 0;
            self.last_drop_log = Some(Instant::now());
        }
    }
}

/// Main capture loop (runs in dedicated thread).
///
/// Returns once the stream ends. An end the session did not ask for is
/// reported as [`CaptureError::StreamFatal`].
pub fn run_capture(
    device: Arc<dyn TunerDevice>,
    block_size: usize,
    mut forwarder: BlockForwarder,
    running: Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    info!("Streaming from {} ({} byte blocks)", device.name(), block_size);

    let result = device.stream_blocking(block_size, &mut |data: &[u8]| forwarder.forward(data));
    let was_running = running.swap(false, Ordering::SeqCst);

    match result {
        Ok(()) if !was_running => {
            info!("Capture stream stopped");
            Ok(())
        }
        Ok(()) => {
            error!("Capture stream returned unexpectedly");
            Err(CaptureError::StreamFatal(
                "stream returned while session was running".to_string(),
            ))
        }
        Err(e) if !was_running => {
            debug!("Stream ended with {} during shutdown", e);
            Ok(())
        }
        Err(e) => {
            error!("Capture stream failed: {}", e);
            Err(CaptureError::StreamFatal(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::synthetic::{AfterLimit, SyntheticDevice};
    use crate::sdr::handoff::{channel, HandoffReceiver, OverflowPolicy};

    const MAX: usize = 512;

    fn forwarder(
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (BlockForwarder, HandoffReceiver, Arc<PipelineStats>, Arc<AtomicBool>) {
        let stats = PipelineStats::new();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = channel(capacity, policy, stats.clone());
        let (_pool_tx, pool_rx) = crossbeam_channel::bounded(4);
        let fwd = BlockForwarder::new(tx, pool_rx, MAX, running.clone(), stats.clone());
        (fwd, rx, stats, running)
    }

    #[test]
    fn test_oversized_block_never_queued() {
        let (mut fwd, rx, stats, _) = forwarder(4, OverflowPolicy::Block);

        assert_eq!(fwd.forward(&[1u8; MAX]), ControlFlow::Continue(()));
        let before = rx.len();
        assert_eq!(fwd.forward(&[2u8; MAX + 2]), ControlFlow::Continue(()));
        assert_eq!(rx.len(), before);
        assert_eq!(fwd.forward(&[3u8; MAX]), ControlFlow::Continue(()));

        let blocks: Vec<RawBlock> = (0..2).filter_map(|_| rx.dequeue_wait()).collect();
        assert_eq!(blocks[0].data[0], 1);
        assert_eq!(blocks[1].data[0], 3);
        assert_eq!(blocks[1].seq, 1);
        assert!(blocks.iter().all(|b| b.data.len() <= MAX));
        assert_eq!(stats.snapshot().oversized_blocks, 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_drop_policy_counts_drops_exactly() {
        let (mut fwd, rx, stats, _) = forwarder(1, OverflowPolicy::DropNewest);

        for n in 0..10u8 {
            let _ = fwd.forward(&[n; 8]);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_received, 10);
        assert_eq!(snap.blocks_enqueued, 1);
        assert_eq!(snap.blocks_dropped, 9);
        assert_eq!(rx.dequeue_wait().map(|b| b.data[0]), Some(0));
    }

    #[test]
    fn test_stop_flag_breaks_stream() {
        let (mut fwd, _rx, _, running) = forwarder(1, OverflowPolicy::Block);
        running.store(false, Ordering::SeqCst);
        assert_eq!(fwd.forward(&[0u8; 8]), ControlFlow::Break(()));
    }

    #[test]
    fn test_closed_queue_breaks_stream() {
        let (mut fwd, rx, _, _) = forwarder(1, OverflowPolicy::Block);
        drop(rx);
        assert_eq!(fwd.forward(&[0u8; 8]), ControlFlow::Break(()));
    }

    #[test]
    fn test_recycled_buffer_is_reused() {
        let stats = PipelineStats::new();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = channel(1, OverflowPolicy::Block, stats.clone());
        let (pool_tx, pool_rx) = crossbeam_channel::bounded(1);
        pool_tx.send(vec![9u8; 100]).unwrap();
        let mut fwd = BlockForwarder::new(tx, pool_rx, MAX, running, stats);

        let _ = fwd.forward(&[1, 2, 3, 4]);
        let block = rx.dequeue_wait().unwrap();
        assert_eq!(block.data, vec![1, 2, 3, 4]);
        assert!(block.data.capacity() >= 100);
    }

    #[test]
    fn test_unexpected_stream_end_is_fatal() {
        let (fwd, _rx, _, running) = forwarder(64, OverflowPolicy::DropNewest);
        let device: Arc<dyn TunerDevice> =
            Arc::new(SyntheticDevice::new().with_block_limit(3, AfterLimit::Fail));

        let result = run_capture(device, MAX, fwd, running.clone());
        assert!(matches!(result, Err(CaptureError::StreamFatal(_))));
        assert!(!running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_requested_stop_is_clean() {
        let (fwd, _rx, _, running) = forwarder(64, OverflowPolicy::DropNewest);
        let device = Arc::new(SyntheticDevice::new().with_block_limit(2, AfterLimit::Idle));
        device.cancel_stream().unwrap();
        running.store(false, Ordering::SeqCst);

        let result = run_capture(device, MAX, fwd, running);
        assert!(result.is_ok());
    }
}
