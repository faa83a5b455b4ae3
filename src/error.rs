//! Error types for the capture pipeline

use std::io;

use thiserror::Error;

/// Errors reported by a capture device backend
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device refused a configuration call (non-zero status)
    #[error("{op} rejected by device (status {status})")]
    Rejected { op: &'static str, status: i32 },

    /// A requested value is outside what the device can represent
    #[error("{op}: value {value} out of range")]
    OutOfRange { op: &'static str, value: i64 },

    /// The stream was closed by the remote end or the device went away
    #[error("device stream closed")]
    Closed,

    /// The device handle is not connected
    #[error("device not connected")]
    NotConnected,

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to the host of a capture session
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No capture source was found at startup
    #[error("no capture device available")]
    DeviceUnavailable,

    /// The device exists but could not be opened
    #[error("failed to open device {index}: {source}")]
    DeviceOpen {
        index: u32,
        #[source]
        source: DeviceError,
    },

    /// A reconfiguration call failed; non-fatal for a running session
    #[error("configuration rejected ({setting}): {source}")]
    ConfigurationRejected {
        setting: &'static str,
        #[source]
        source: DeviceError,
    },

    /// The capture parameters are inconsistent
    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),

    /// The blocking stream call terminated while the session was running
    #[error("capture stream terminated: {0}")]
    StreamFatal(String),

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Per-block anomalies. These are logged and counted, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockAnomaly {
    #[error("oversized block: {len} bytes (max {max})")]
    Oversized { len: usize, max: usize },

    #[error("malformed block: {len} bytes")]
    Malformed { len: usize },

    #[error("handoff queue full, block {seq} dropped")]
    QueueOverflow { seq: u64 },
}
