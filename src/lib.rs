//! RTL-SDR I/Q capture pipeline
//!
//! Acquires raw unsigned 8-bit I/Q blocks from an RTL-SDR front end on a
//! dedicated capture thread, hands them through a bounded queue to a
//! conversion thread, and delivers decimated signed 16-bit I/Q buffers to a
//! demodulator. The center frequency can be shifted while capture runs.

pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod sdr;

pub use device::{DeviceDriver, TunerDevice};
pub use error::{BlockAnomaly, CaptureError, DeviceError};
pub use sdr::{
    start_capture, CaptureConfig, CaptureSession, Demodulator, IqBuffer, OverflowPolicy,
    RetunePolicy, StatsSnapshot, TuningController,
};
