//! Handoff queue between the capture callback and the conversion stage
//!
//! A bounded single-producer/single-consumer FIFO of raw blocks. What happens
//! when the producer finds the queue full is decided by [`OverflowPolicy`]:
//! either the producer waits (backpressure reaches the device) or the block
//! is dropped and counted exactly once.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::stats::PipelineStats;

/// One raw capture block, as delivered by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Sequence number assigned when the callback accepted the block
    pub seq: u64,
    /// Interleaved u8 I/Q bytes
    pub data: Vec<u8>,
}

/// Behaviour of `enqueue` when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot
    #[default]
    Block,
    /// Discard the incoming block and count it
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" | "drop-newest" | "drop_newest" => Ok(Self::DropNewest),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// Result of a successful `enqueue` call
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    /// The queue was full; the block is handed back so its buffer can be reused
    Dropped(RawBlock),
}

/// The consumer side has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Producer half of the handoff queue
pub struct HandoffSender {
    tx: Sender<RawBlock>,
    policy: OverflowPolicy,
    stats: Arc<PipelineStats>,
}

/// Consumer half of the handoff queue
pub struct HandoffReceiver {
    rx: Receiver<RawBlock>,
}

/// Create a handoff queue holding at most `capacity` blocks (minimum 1)
pub fn channel(
    capacity: usize,
    policy: OverflowPolicy,
    stats: Arc<PipelineStats>,
) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (HandoffSender { tx, policy, stats }, HandoffReceiver { rx })
}

impl HandoffSender {
    pub fn enqueue(&self, block: RawBlock) -> Result<Enqueued, QueueClosed> {
        match self.policy {
            OverflowPolicy::Block => {
                match self.tx.try_send(block) {
                    Ok(()) => {}
                    Err(TrySendError::Full(block)) => {
                        self.stats.record_backpressure();
                        self.tx.send(block).map_err(|_| QueueClosed)?;
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(QueueClosed),
                }
                self.stats.record_enqueued();
                Ok(Enqueued::Queued)
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(block) {
                Ok(()) => {
                    self.stats.record_enqueued();
                    Ok(Enqueued::Queued)
                }
                Err(TrySendError::Full(block)) => {
                    self.stats.record_dropped();
                    Ok(Enqueued::Dropped(block))
                }
                Err(TrySendError::Disconnected(_)) => Err(QueueClosed),
            },
        }
    }

    /// Blocks currently waiting in the queue
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl HandoffReceiver {
    /// Wait until a block is available. `None` once the producer is gone
    /// and the queue has been drained.
    pub fn dequeue_wait(&self) -> Option<RawBlock> {
        self.rx.recv().ok()
    }

    /// Like [`dequeue_wait`](Self::dequeue_wait) but gives up after `timeout`
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<RawBlock, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
