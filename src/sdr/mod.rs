//! Real-time RTL-SDR acquisition and conversion
//!
//! Pipeline:
//! 1. Capture thread drives the device's blocking stream call
//! 2. Callback copies each raw u8 I/Q block into the handoff queue
//! 3. Conversion thread centers, scales and decimates to i16 I/Q
//! 4. Converted buffers go straight to the demodulator
//!
//! The tuning controller retunes the same device concurrently.

pub mod capture;
pub mod convert;
pub mod handoff;
pub mod session;
pub mod stats;
pub mod tuning;

pub use capture::BlockForwarder;
pub use convert::{Converter, Demodulator, IqBuffer, SampleTable};
pub use handoff::{OverflowPolicy, RawBlock};
pub use session::{start_capture, CaptureConfig, CaptureSession, GainSetting};
pub use stats::{PipelineStats, StatsSnapshot};
pub use tuning::{RetunePolicy, TuningController};
