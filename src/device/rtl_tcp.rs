//! rtl_tcp network backend
//!
//! Talks to an `rtl_tcp` server, which owns the RTL-SDR dongle and streams
//! raw interleaved u8 I/Q over TCP. On connect the server sends a 12-byte
//! header (`"RTL0"`, tuner type, gain step count, all big-endian). Control
//! commands are 5 bytes: one command byte and a big-endian u32 parameter.
//! The server does not acknowledge commands, so a successful write is the
//! only status available.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{BlockCallback, DeviceDriver, GainMode, TunerDevice, TunerType};
use crate::error::DeviceError;

const HEADER_MAGIC: &[u8; 4] = b"RTL0";
const HEADER_LEN: usize = 12;

const CMD_SET_FREQUENCY: u8 = 0x01;
const CMD_SET_SAMPLE_RATE: u8 = 0x02;
const CMD_SET_GAIN_MODE: u8 = 0x03;
const CMD_SET_GAIN: u8 = 0x04;
const CMD_SET_FREQ_CORRECTION: u8 = 0x05;
const CMD_SET_AGC_MODE: u8 = 0x08;

/// Encode one rtl_tcp control command
pub(crate) fn encode_command(cmd: u8, param: u32) -> [u8; 5] {
    let p = param.to_be_bytes();
    [cmd, p[0], p[1], p[2], p[3]]
}

/// Parse the dongle info header sent by the server on connect
pub(crate) fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(TunerType, u32), DeviceError> {
    if &header[..4] != HEADER_MAGIC {
        return Err(DeviceError::Rejected {
            op: "handshake",
            status: -1,
        });
    }
    let tuner = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let gain_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    Ok((TunerType::from(tuner), gain_count))
}

/// Driver for a single rtl_tcp server
pub struct RtlTcpDriver {
    addr: String,
    connect_timeout: Duration,
}

impl RtlTcpDriver {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    fn connect(&self) -> Result<TcpStream, DeviceError> {
        let mut last_err = None;
        for sock in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map(DeviceError::Io).unwrap_or(DeviceError::NotConnected))
    }
}

impl DeviceDriver for RtlTcpDriver {
    /// An rtl_tcp server exposes exactly one dongle; probe it by connecting
    fn device_count(&self) -> u32 {
        match self.connect() {
            Ok(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                1
            }
            Err(e) => {
                debug!("rtl_tcp probe of {} failed: {}", self.addr, e);
                0
            }
        }
    }

    fn device_name(&self, index: u32) -> Option<String> {
        (index == 0).then(|| format!("rtl_tcp@{}", self.addr))
    }

    fn open(&self, index: u32) -> Result<Arc<dyn TunerDevice>, DeviceError> {
        if index != 0 {
            return Err(DeviceError::OutOfRange {
                op: "open",
                value: index as i64,
            });
        }

        let mut stream = self.connect()?;
        stream.set_nodelay(true)?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header)?;
        let (tuner, gain_count) = parse_header(&header)?;
        info!(
            "Connected to rtl_tcp at {} (tuner {:?}, {} gain steps)",
            self.addr, tuner, gain_count
        );

        Ok(Arc::new(RtlTcpDevice {
            addr: self.addr.clone(),
            tuner,
            gain_count,
            control: Mutex::new(stream),
            cancelled: AtomicBool::new(false),
        }))
    }
}

/// An open rtl_tcp connection
pub struct RtlTcpDevice {
    addr: String,
    tuner: TunerType,
    gain_count: u32,
    /// Write side for commands; the stream reader uses a cloned handle
    control: Mutex<TcpStream>,
    cancelled: AtomicBool,
}

impl RtlTcpDevice {
    fn send(&self, op: &'static str, cmd: u8, param: u32) -> Result<(), DeviceError> {
        let mut stream = self.control.lock().map_err(|_| DeviceError::NotConnected)?;
        stream.write_all(&encode_command(cmd, param))?;
        debug!("rtl_tcp {} <- {}", op, param);
        Ok(())
    }
}

impl TunerDevice for RtlTcpDevice {
    fn name(&self) -> String {
        format!("rtl_tcp@{} ({:?})", self.addr, self.tuner)
    }

    fn set_sample_rate(&self, rate: u32) -> Result<(), DeviceError> {
        self.send("sample_rate", CMD_SET_SAMPLE_RATE, rate)
    }

    fn set_center_frequency(&self, hz: u32) -> Result<(), DeviceError> {
        self.send("center_frequency", CMD_SET_FREQUENCY, hz)
    }

    fn set_gain_mode(&self, mode: GainMode) -> Result<(), DeviceError> {
        let manual = match mode {
            GainMode::Auto => 0,
            GainMode::Manual => 1,
        };
        self.send("gain_mode", CMD_SET_GAIN_MODE, manual)
    }

    fn set_agc_mode(&self, enabled: bool) -> Result<(), DeviceError> {
        self.send("agc_mode", CMD_SET_AGC_MODE, enabled as u32)
    }

    fn set_gain(&self, tenth_db: i32) -> Result<(), DeviceError> {
        self.send("gain", CMD_SET_GAIN, tenth_db as u32)
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<(), DeviceError> {
        self.send("freq_correction", CMD_SET_FREQ_CORRECTION, ppm as u32)
    }

    fn supported_gains(&self) -> Result<Vec<i32>, DeviceError> {
        let gains = self.tuner.gains();
        if gains.len() as u32 != self.gain_count {
            warn!(
                "rtl_tcp reports {} gain steps, tuner table for {:?} has {}",
                self.gain_count,
                self.tuner,
                gains.len()
            );
        }
        Ok(gains.to_vec())
    }

    fn reset_buffers(&self) -> Result<(), DeviceError> {
        // The server resets the dongle buffer when a client connects.
        debug!("rtl_tcp: buffer reset is implicit on connect");
        Ok(())
    }

    fn stream_blocking(
        &self,
        block_size: usize,
        callback: &mut BlockCallback<'_>,
    ) -> Result<(), DeviceError> {
        let mut reader = self
            .control
            .lock()
            .map_err(|_| DeviceError::NotConnected)?
            .try_clone()?;

        let mut buffer = vec![0u8; block_size];
        loop {
            match reader.read_exact(&mut buffer) {
                Ok(()) => {
                    if callback(&buffer).is_break() {
                        return Ok(());
                    }
                }
                Err(_) if self.cancelled.load(Ordering::SeqCst) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(DeviceError::Closed),
                Err(e) => return Err(DeviceError::Io(e)),
            }
        }
    }

    fn cancel_stream(&self) -> Result<(), DeviceError> {
        self.cancelled.store(true, Ordering::SeqCst);
        let stream = self.control.lock().map_err(|_| DeviceError::NotConnected)?;
        match stream.shutdown(Shutdown::Read) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
