//! Capture device contract
//!
//! The pipeline never talks to hardware directly. A [`DeviceDriver`] finds and
//! opens devices; the opened [`TunerDevice`] is shared between the capture
//! thread (blocking stream call) and the tuning controller (reconfiguration).
//! Implementations must therefore be `Send + Sync` and must allow
//! reconfiguration calls while `stream_blocking` is in progress.

pub mod rtl_tcp;
pub mod synthetic;

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::error::DeviceError;

pub use rtl_tcp::{RtlTcpDevice, RtlTcpDriver};
pub use synthetic::{SyntheticDevice, SyntheticDriver};

/// Tuner gain mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    Auto,
    Manual,
}

/// RTL2832U tuner chips, as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerType {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820T,
    R828D,
}

impl From<u32> for TunerType {
    fn from(id: u32) -> Self {
        match id {
            1 => Self::E4000,
            2 => Self::Fc0012,
            3 => Self::Fc0013,
            4 => Self::Fc2580,
            5 => Self::R820T,
            6 => Self::R828D,
            _ => Self::Unknown,
        }
    }
}

impl TunerType {
    /// Gain steps supported by the tuner, in tenths of dB, ascending
    pub fn gains(self) -> &'static [i32] {
        match self {
            Self::E4000 => &[
                -10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420,
            ],
            Self::Fc0012 => &[-99, -40, 71, 179, 192],
            Self::Fc0013 => &[
                -99, -73, -65, -63, -60, -58, -54, 58, 61, 63, 65, 67, 68, 70, 71, 179, 181, 182,
                184, 186, 188, 191, 197,
            ],
            Self::Fc2580 => &[0],
            Self::R820T | Self::R828D => &[
                0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328,
                338, 364, 372, 386, 402, 421, 434, 439, 445, 480, 496,
            ],
            Self::Unknown => &[],
        }
    }
}

/// Callback invoked by [`TunerDevice::stream_blocking`] once per raw block.
///
/// Runs on the streaming context and must return promptly.
/// Returning `ControlFlow::Break(())` ends the stream.
pub type BlockCallback<'a> = dyn FnMut(&[u8]) -> ControlFlow<()> + 'a;

/// An opened capture device
pub trait TunerDevice: Send + Sync {
    /// Human readable device name
    fn name(&self) -> String;

    fn set_sample_rate(&self, rate: u32) -> Result<(), DeviceError>;

    fn set_center_frequency(&self, hz: u32) -> Result<(), DeviceError>;

    fn set_gain_mode(&self, mode: GainMode) -> Result<(), DeviceError>;

    fn set_agc_mode(&self, enabled: bool) -> Result<(), DeviceError>;

    /// Set tuner gain in tenths of dB
    fn set_gain(&self, tenth_db: i32) -> Result<(), DeviceError>;

    /// Frequency correction in parts per million
    fn set_freq_correction(&self, ppm: i32) -> Result<(), DeviceError>;

    /// Supported gain steps in tenths of dB, ascending
    fn supported_gains(&self) -> Result<Vec<i32>, DeviceError>;

    fn reset_buffers(&self) -> Result<(), DeviceError>;

    /// Stream raw blocks of `block_size` bytes into `callback`.
    ///
    /// Blocks the calling thread. Returns `Ok(())` only after the callback
    /// asked to stop or [`cancel_stream`](Self::cancel_stream) was called;
    /// any other termination is an error.
    fn stream_blocking(
        &self,
        block_size: usize,
        callback: &mut BlockCallback<'_>,
    ) -> Result<(), DeviceError>;

    /// Ask a running `stream_blocking` call to return
    fn cancel_stream(&self) -> Result<(), DeviceError>;
}

/// Discovers and opens capture devices
pub trait DeviceDriver {
    fn device_count(&self) -> u32;

    fn device_name(&self, index: u32) -> Option<String>;

    fn open(&self, index: u32) -> Result<Arc<dyn TunerDevice>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuner_type_from_id() {
        assert_eq!(TunerType::from(5), TunerType::R820T);
        assert_eq!(TunerType::from(1), TunerType::E4000);
        assert_eq!(TunerType::from(42), TunerType::Unknown);
    }

    #[test]
    fn test_gain_tables_are_ascending() {
        for tuner in [
            TunerType::E4000,
            TunerType::Fc0012,
            TunerType::Fc0013,
            TunerType::R820T,
        ] {
            let gains = tuner.gains();
            assert!(!gains.is_empty());
            assert!(gains.windows(2).all(|w| w[0] < w[1]), "{:?}", tuner);
        }
        assert_eq!(TunerType::R820T.gains().last(), Some(&496));
        assert!(TunerType::Unknown.gains().is_empty());
    }
}
