//! In-process synthetic capture device
//!
//! Produces deterministic u8 I/Q blocks without hardware. Records every
//! configuration call so tests can inspect what the pipeline asked for, and
//! can be told to reject frequency changes or to fail the stream.

use std::f64::consts::TAU;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{BlockCallback, DeviceDriver, GainMode, TunerDevice, TunerType};
use crate::error::DeviceError;

/// Content of generated blocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// Byte `n` of the stream is `n % 256`
    Ramp,
    /// Complex tone at `offset_hz` from the center frequency
    Tone { offset_hz: f64, amplitude: f64 },
}

/// What the stream does once `block_limit` blocks have been delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLimit {
    /// Stay in the stream call until cancelled
    Idle,
    /// Return an error, as an unplugged dongle would
    Fail,
}

/// Synthetic tuner device
pub struct SyntheticDevice {
    name: String,
    waveform: Waveform,
    tuner: TunerType,
    block_limit: Option<u64>,
    after_limit: AfterLimit,
    paced: bool,

    sample_rate: AtomicU32,
    center_freq: AtomicU32,
    gain: AtomicI32,
    manual_gain: AtomicBool,
    agc: AtomicBool,
    ppm: AtomicI32,
    resets: AtomicU32,
    reject_frequency: AtomicBool,
    cancelled: AtomicBool,
    blocks_streamed: AtomicU64,
    frequency_history: Mutex<Vec<u32>>,
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self {
            name: "Synthetic RTL2832U".to_string(),
            waveform: Waveform::Ramp,
            tuner: TunerType::R820T,
            block_limit: None,
            after_limit: AfterLimit::Idle,
            paced: false,
            sample_rate: AtomicU32::new(2_048_000),
            center_freq: AtomicU32::new(0),
            gain: AtomicI32::new(0),
            manual_gain: AtomicBool::new(false),
            agc: AtomicBool::new(false),
            ppm: AtomicI32::new(0),
            resets: AtomicU32::new(0),
            reject_frequency: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            blocks_streamed: AtomicU64::new(0),
            frequency_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    /// Deliver at most `blocks` blocks, then behave per `after`
    pub fn with_block_limit(mut self, blocks: u64, after: AfterLimit) -> Self {
        self.block_limit = Some(blocks);
        self.after_limit = after;
        self
    }

    /// Sleep between blocks so delivery follows the configured sample rate
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Make `set_center_frequency` fail from now on
    pub fn set_reject_frequency(&self, reject: bool) {
        self.reject_frequency.store(reject, Ordering::SeqCst);
    }

    pub fn center_frequency(&self) -> u32 {
        self.center_freq.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    pub fn gain(&self) -> i32 {
        self.gain.load(Ordering::SeqCst)
    }

    pub fn is_manual_gain(&self) -> bool {
        self.manual_gain.load(Ordering::SeqCst)
    }

    pub fn is_agc_enabled(&self) -> bool {
        self.agc.load(Ordering::SeqCst)
    }

    pub fn freq_correction(&self) -> i32 {
        self.ppm.load(Ordering::SeqCst)
    }

    pub fn buffer_resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn blocks_streamed(&self) -> u64 {
        self.blocks_streamed.load(Ordering::SeqCst)
    }

    /// Every frequency accepted by the device, in order
    pub fn frequency_history(&self) -> Vec<u32> {
        self.frequency_history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn fill_block(&self, block: &mut [u8], block_index: u64) {
        let start = block_index * block.len() as u64;
        match self.waveform {
            Waveform::Ramp => {
                for (n, byte) in block.iter_mut().enumerate() {
                    *byte = ((start + n as u64) % 256) as u8;
                }
            }
            Waveform::Tone {
                offset_hz,
                amplitude,
            } => {
                let rate = self.sample_rate().max(1) as f64;
                let step = TAU * offset_hz / rate;
                let first_sample = start / 2;
                for (n, pair) in block.chunks_exact_mut(2).enumerate() {
                    let phase = step * (first_sample + n as u64) as f64;
                    pair[0] = (127.5 + amplitude * phase.cos()).clamp(0.0, 255.0) as u8;
                    pair[1] = (127.5 + amplitude * phase.sin()).clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    fn block_interval(&self, block_size: usize) -> Duration {
        let rate = self.sample_rate().max(1) as f64;
        Duration::from_secs_f64((block_size / 2) as f64 / rate)
    }

    fn wait_for_cancel(&self) {
        while !self.cancelled.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl TunerDevice for SyntheticDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_sample_rate(&self, rate: u32) -> Result<(), DeviceError> {
        if !(225_001..=3_200_000).contains(&rate) {
            return Err(DeviceError::Rejected {
                op: "sample_rate",
                status: -22,
            });
        }
        self.sample_rate.store(rate, Ordering::SeqCst);
        Ok(())
    }

    fn set_center_frequency(&self, hz: u32) -> Result<(), DeviceError> {
        if self.reject_frequency.load(Ordering::SeqCst) {
            return Err(DeviceError::Rejected {
                op: "center_frequency",
                status: -1,
            });
        }
        self.center_freq.store(hz, Ordering::SeqCst);
        if let Ok(mut history) = self.frequency_history.lock() {
            history.push(hz);
        }
        Ok(())
    }

    fn set_gain_mode(&self, mode: GainMode) -> Result<(), DeviceError> {
        self.manual_gain
            .store(mode == GainMode::Manual, Ordering::SeqCst);
        Ok(())
    }

    fn set_agc_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        self.agc.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn set_gain(&self, tenth_db: i32) -> Result<(), DeviceError> {
        if !self.tuner.gains().contains(&tenth_db) {
            return Err(DeviceError::OutOfRange {
                op: "gain",
                value: tenth_db as i64,
            });
        }
        self.gain.store(tenth_db, Ordering::SeqCst);
        Ok(())
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<(), DeviceError> {
        self.ppm.store(ppm, Ordering::SeqCst);
        Ok(())
    }

    fn supported_gains(&self) -> Result<Vec<i32>, DeviceError> {
        Ok(self.tuner.gains().to_vec())
    }

    /// Also re-arms streaming after an earlier `cancel_stream`
    fn reset_buffers(&self) -> Result<(), DeviceError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stream_blocking(
        &self,
        block_size: usize,
        callback: &mut BlockCallback<'_>,
    ) -> Result<(), DeviceError> {
        let mut block = vec![0u8; block_size];
        let interval = self.block_interval(block_size);
        let mut index = 0u64;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.block_limit.is_some_and(|limit| index >= limit) {
                debug!("Synthetic device reached its block limit ({})", index);
                return match self.after_limit {
                    AfterLimit::Idle => {
                        self.wait_for_cancel();
                        Ok(())
                    }
                    AfterLimit::Fail => Err(DeviceError::Closed),
                };
            }

            self.fill_block(&mut block, index);
            index += 1;
            self.blocks_streamed.store(index, Ordering::SeqCst);
            if let ControlFlow::Break(()) = callback(&block) {
                return Ok(());
            }

            if self.paced {
                thread::sleep(interval);
            }
        }
    }

    fn cancel_stream(&self) -> Result<(), DeviceError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver exposing zero or one synthetic device
pub struct SyntheticDriver {
    device: Option<Arc<SyntheticDevice>>,
}

impl SyntheticDriver {
    pub fn new(device: Arc<SyntheticDevice>) -> Self {
        Self {
            device: Some(device),
        }
    }

    /// A driver that finds no devices
    pub fn empty() -> Self {
        Self { device: None }
    }
}

impl DeviceDriver for SyntheticDriver {
    fn device_count(&self) -> u32 {
        self.device.is_some() as u32
    }

    fn device_name(&self, index: u32) -> Option<String> {
        match (&self.device, index) {
            (Some(dev), 0) => Some(dev.name()),
            _ => None,
        }
    }

    fn open(&self, index: u32) -> Result<Arc<dyn TunerDevice>, DeviceError> {
        match (&self.device, index) {
            (Some(dev), 0) => Ok(dev.clone()),
            _ => Err(DeviceError::NotConnected),
        }
    }
}
