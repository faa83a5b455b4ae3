//! Capture session: device setup and worker thread lifecycle

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use super::capture::{run_capture, BlockForwarder};
use super::convert::{run_conversion, Converter, Demodulator};
use super::handoff::{self, OverflowPolicy};
use super::stats::{PipelineStats, StatsSnapshot};
use super::tuning::{RetunePolicy, TuningController};
use crate::device::{DeviceDriver, GainMode, TunerDevice};
use crate::error::CaptureError;

/// librtlsdr delivers async buffers in multiples of this many bytes
pub const BLOCK_ALIGNMENT: usize = 512;

/// Tuner gain selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GainSetting {
    /// Tuner AGC
    Auto,
    /// Highest gain step the tuner supports
    #[default]
    Max,
    /// Fixed gain in tenths of dB
    Manual(i32),
}

impl FromStr for GainSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "max" => Ok(Self::Max),
            other => other
                .parse()
                .map(Self::Manual)
                .map_err(|_| format!("invalid gain '{}'", other)),
        }
    }
}

/// Capture pipeline configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_index: u32,
    /// Nominal tuned frequency in Hz
    pub tuned_frequency: u32,
    pub sample_rate: u32,
    pub gain: GainSetting,
    pub ppm_error: i32,
    /// Keep every n-th I/Q pair
    pub decimation: usize,
    /// Bytes per device callback; also the maximum accepted block size
    pub block_size: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub retune_policy: RetunePolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            tuned_frequency: 739_525_000,
            sample_rate: 2_400_000,
            gain: GainSetting::Max,
            ppm_error: 0,
            decimation: 1,
            block_size: 16 * 16384,
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::Block,
            retune_policy: RetunePolicy::Optimistic,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.block_size == 0 || self.block_size % BLOCK_ALIGNMENT != 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "block size {} must be a non-zero multiple of {}",
                self.block_size, BLOCK_ALIGNMENT
            )));
        }
        if self.decimation == 0 {
            return Err(CaptureError::InvalidConfig(
                "decimation stride must be at least 1".to_string(),
            ));
        }
        let span = self.decimation.checked_mul(2).ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "decimation stride {} is too large",
                self.decimation
            ))
        })?;
        if self.block_size < span {
            return Err(CaptureError::InvalidConfig(format!(
                "block size {} yields no samples at decimation {}",
                self.block_size, self.decimation
            )));
        }
        if self.queue_capacity == 0 {
            return Err(CaptureError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Sample rate seen by the demodulator
    pub fn output_sample_rate(&self) -> u32 {
        self.sample_rate / self.decimation.max(1) as u32
    }
}

/// A running capture: two worker threads plus the tuning controller
pub struct CaptureSession {
    device: Arc<dyn TunerDevice>,
    tuner: TuningController,
    running: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    capture_thread: Option<JoinHandle<Result<(), CaptureError>>>,
    convert_thread: Option<JoinHandle<()>>,
}

/// Discover, open and configure the device, then start both worker threads.
///
/// Returns as soon as the threads are running.
pub fn start_capture(
    driver: &dyn DeviceDriver,
    config: &CaptureConfig,
    demodulator: Box<dyn Demodulator>,
) -> Result<CaptureSession, CaptureError> {
    config.validate()?;

    info!("===========================================");
    info!("  Starting RTL-SDR I/Q Capture");
    info!("===========================================");

    let count = driver.device_count();
    info!("Found {} RTL-SDR device(s)", count);
    if count == 0 {
        return Err(CaptureError::DeviceUnavailable);
    }
    if count > 1 {
        warn!(
            "Only one device is used per session; capturing from index {}",
            config.device_index
        );
    }
    if let Some(name) = driver.device_name(config.device_index) {
        info!("  Device: {}", name);
    }

    let device = driver
        .open(config.device_index)
        .map_err(|source| CaptureError::DeviceOpen {
            index: config.device_index,
            source,
        })?;

    configure_device(device.as_ref(), config);

    let stats = PipelineStats::new();
    let running = Arc::new(AtomicBool::new(true));
    let tuner = TuningController::new(
        device.clone(),
        config.tuned_frequency,
        config.retune_policy,
        stats.clone(),
    );

    let (queue_tx, queue_rx) =
        handoff::channel(config.queue_capacity, config.overflow_policy, stats.clone());

    // Enough buffers for every queue slot, the one being converted and the
    // one being filled.
    let pool_size = config.queue_capacity + 2;
    let (recycle_tx, pool_rx) = bounded::<Vec<u8>>(pool_size);
    for _ in 0..pool_size {
        let _ = recycle_tx.try_send(Vec::with_capacity(config.block_size));
    }

    let converter = Converter::new(config.decimation);
    let convert_thread = {
        let running = running.clone();
        let stats = stats.clone();
        thread::Builder::new()
            .name("iq-convert".to_string())
            .spawn(move || {
                run_conversion(queue_rx, converter, demodulator, recycle_tx, running, stats)
            })
            .map_err(|source| CaptureError::ThreadSpawn {
                name: "iq-convert",
                source,
            })?
    };

    let forwarder = BlockForwarder::new(
        queue_tx,
        pool_rx,
        config.block_size,
        running.clone(),
        stats.clone(),
    );
    let capture_thread = {
        let device = device.clone();
        let running = running.clone();
        let block_size = config.block_size;
        thread::Builder::new()
            .name("iq-capture".to_string())
            .spawn(move || run_capture(device, block_size, forwarder, running))
    };
    let capture_thread = match capture_thread {
        Ok(handle) => handle,
        Err(source) => {
            running.store(false, Ordering::SeqCst);
            let _ = convert_thread.join();
            return Err(CaptureError::ThreadSpawn {
                name: "iq-capture",
                source,
            });
        }
    };

    info!("===========================================");
    info!("  LIVE IQ CAPTURE STARTED!");
    info!("  Center frequency: {} Hz", config.tuned_frequency);
    info!(
        "  Sample rate: {} S/s -> {} S/s (stride {})",
        config.sample_rate,
        config.output_sample_rate(),
        config.decimation
    );
    info!(
        "  Block size: {} bytes | Queue: {} slot(s), {:?}",
        config.block_size, config.queue_capacity, config.overflow_policy
    );
    info!("  Retune policy: {:?}", tuner.policy());
    info!("===========================================");

    Ok(CaptureSession {
        device,
        tuner,
        running,
        stats,
        capture_thread: Some(capture_thread),
        convert_thread: Some(convert_thread),
    })
}

/// Apply the startup configuration. Rejections are logged, not fatal.
fn configure_device(device: &dyn TunerDevice, config: &CaptureConfig) {
    let report = |setting: &'static str, result: Result<(), crate::error::DeviceError>| {
        if let Err(source) = result {
            warn!(
                "{}",
                CaptureError::ConfigurationRejected { setting, source }
            );
        }
    };

    report("sample_rate", device.set_sample_rate(config.sample_rate));
    report(
        "center_frequency",
        device.set_center_frequency(config.tuned_frequency),
    );

    match config.gain {
        GainSetting::Auto => {
            report("gain_mode", device.set_gain_mode(GainMode::Auto));
            info!("  Gain: auto");
        }
        GainSetting::Max | GainSetting::Manual(_) => {
            report("gain_mode", device.set_gain_mode(GainMode::Manual));
            report("agc_mode", device.set_agc_mode(true));

            let gain = match config.gain {
                GainSetting::Manual(g) => Some(g),
                _ => match device.supported_gains() {
                    Ok(gains) => gains.last().copied(),
                    Err(source) => {
                        report("gain", Err(source));
                        None
                    }
                },
            };
            match gain {
                Some(g) => {
                    report("gain", device.set_gain(g));
                    info!("  Gain: {:.1} dB", g as f32 / 10.0);
                }
                None => warn!("Tuner reports no gain steps, leaving gain unchanged"),
            }
        }
    }

    if config.ppm_error != 0 {
        report("freq_correction", device.set_freq_correction(config.ppm_error));
    }
    report("reset_buffers", device.reset_buffers());
}

impl CaptureSession {
    /// Handle for retuning from any thread
    pub fn tuner(&self) -> TuningController {
        self.tuner.clone()
    }

    pub fn apply_frequency_offset(&self, hz: i64) -> Result<i64, CaptureError> {
        self.tuner.apply_offset(hz)
    }

    pub fn reset_frequency(&self) -> Result<i64, CaptureError> {
        self.tuner.reset()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// False once the session was stopped or the stream died
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop both threads and wait for them.
    ///
    /// Returns the capture outcome: `Err(StreamFatal)` if the stream had
    /// already died on its own.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping RTL-SDR capture...");
        }
        if let Err(e) = self.device.cancel_stream() {
            warn!("Failed to cancel device stream: {}", e);
        }
        self.join()
    }

    /// Block until the capture stream ends on its own, then shut down
    pub fn wait(mut self) -> Result<(), CaptureError> {
        let result = match self.capture_thread.take() {
            Some(handle) => join_capture(handle),
            None => Ok(()),
        };
        self.running.store(false, Ordering::SeqCst);
        let _ = self.join();
        result
    }

    fn join(&mut self) -> Result<(), CaptureError> {
        let result = match self.capture_thread.take() {
            Some(handle) => join_capture(handle),
            None => Ok(()),
        };
        if let Some(handle) = self.convert_thread.take() {
            if handle.join().is_err() {
                error!("Conversion thread panicked");
            }
        }
        if result.is_ok() {
            let snap = self.stats.snapshot();
            info!("Final stats: {}", snap);
        }
        result
    }
}

fn join_capture(handle: JoinHandle<Result<(), CaptureError>>) -> Result<(), CaptureError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(CaptureError::StreamFatal("capture thread panicked".to_string())))
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.capture_thread.is_some() || self.convert_thread.is_some() {
            let _ = self.stop();
        }
    }
}
