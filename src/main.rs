//! RTL-SDR I/Q capture host
//!
//! Starts the capture pipeline, feeds converted samples to a signal level
//! monitor and accepts tuning commands on stdin:
//!
//! ```text
//! offset <hz>   shift the tuned frequency down by <hz>
//! reset         return to the nominal frequency
//! stats         print pipeline counters
//! quit          stop capture and exit
//! ```

use std::io::BufRead;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rtl_iq_capture::config::{Config, Source};
use rtl_iq_capture::device::synthetic::{SyntheticDevice, SyntheticDriver, Waveform};
use rtl_iq_capture::device::RtlTcpDriver;
use rtl_iq_capture::monitor::{SignalLevels, SignalMonitor};
use rtl_iq_capture::{
    start_capture, CaptureSession, DeviceDriver, StatsSnapshot, TuningController,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Offset(i64),
    Reset,
    Stats,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let cmd = match parts.next()?.to_ascii_lowercase().as_str() {
        "offset" | "o" => Command::Offset(parts.next()?.parse().ok()?),
        "reset" | "r" => Command::Reset,
        "stats" | "s" => Command::Stats,
        "quit" | "q" | "exit" => Command::Quit,
        _ => return None,
    };
    parts.next().is_none().then_some(cmd)
}

fn build_driver(source: &Source) -> Box<dyn DeviceDriver + Send> {
    match source {
        Source::RtlTcp(addr) => Box::new(RtlTcpDriver::new(addr)),
        Source::Synthetic => {
            let device = SyntheticDevice::new()
                .with_waveform(Waveform::Tone {
                    offset_hz: 50_000.0,
                    amplitude: 60.0,
                })
                .paced();
            Box::new(SyntheticDriver::new(device.into()))
        }
    }
}

/// Run a tuning call off the async runtime; it may block on device I/O
async fn retune(tuner: &TuningController, command: Command) {
    let tuner = tuner.clone();
    let result = tokio::task::spawn_blocking(move || match command {
        Command::Offset(hz) => tuner.apply_offset(hz),
        _ => tuner.reset(),
    })
    .await;

    match result {
        Ok(Ok(hz)) => info!("Tuned to {} Hz", hz),
        Ok(Err(e)) => warn!("{}", e),
        Err(e) => error!("Tuning task failed: {}", e),
    }
}

/// Forward stdin lines from a plain thread so a pending read never holds
/// up runtime shutdown
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(|line| line.ok()) {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Control commands disabled, failed to spawn stdin reader: {}", e);
    }
    rx
}

/// Log pipeline counters; the input rate is measured against `last`
fn log_stats(session: &CaptureSession, levels: &SignalLevels, last: &mut Option<StatsSnapshot>) {
    let snap = session.stats();
    let rate = last.map(|prev| snap.input_rate_since(&prev)).unwrap_or(0.0);
    *last = Some(snap);

    info!("[Stats] {}", snap);
    info!(
        "[Stats] Input: {:.3} MS/s | Tuned: {} Hz | Signal: {:.1} dBFS | Sequence gaps: {}",
        rate / 1e6,
        session.tuner().current_frequency(),
        levels.power_dbfs(),
        levels.gaps.load(Ordering::Relaxed)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   RTL-SDR I/Q Capture");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Source: {:?}", config.source);
    info!("  Tuned frequency: {} Hz", config.capture.tuned_frequency);
    info!("  Sample rate: {} S/s", config.capture.sample_rate);
    info!("  Decimation: {}", config.capture.decimation);
    info!("  Gain: {:?}", config.capture.gain);
    info!(
        "  Overflow policy: {:?} | Retune policy: {:?}",
        config.capture.overflow_policy, config.capture.retune_policy
    );

    let stats_interval = Duration::from_millis(config.stats_interval_ms.max(100));
    let monitor = SignalMonitor::new(stats_interval);
    let levels = monitor.levels();

    let driver = build_driver(&config.source);
    let capture_config = config.capture.clone();
    let mut session = tokio::task::spawn_blocking(move || {
        start_capture(driver.as_ref(), &capture_config, Box::new(monitor))
    })
    .await
    .context("Capture startup task failed")?
    .context("Failed to start capture")?;

    let tuner = session.tuner();

    info!("===========================================");
    info!("  Commands: offset <hz> | reset | stats | quit");
    info!("  Press Ctrl+C to stop.");
    info!("===========================================");

    let mut lines = ReceiverStream::new(spawn_stdin_reader());
    let mut ticks = IntervalStream::new(tokio::time::interval(stats_interval));
    let mut stdin_open = true;
    let mut last_stats = Some(session.stats());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            line = lines.next(), if stdin_open => match line {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Stats) => log_stats(&session, &levels, &mut last_stats),
                    Some(cmd) => retune(&tuner, cmd).await,
                    None => warn!("Unknown command: {}", line.trim()),
                },
                None => stdin_open = false,
            },
            _ = ticks.next() => {
                if !session.is_running() {
                    warn!("Capture stopped unexpectedly");
                    break;
                }
                log_stats(&session, &levels, &mut last_stats);
            }
        }
    }

    let outcome = tokio::task::block_in_place(|| session.stop());
    log_stats(&session, &levels, &mut last_stats);
    match outcome {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Capture ended with error: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("offset 100"), Some(Command::Offset(100)));
        assert_eq!(parse_command("  o -2500 "), Some(Command::Offset(-2500)));
        assert_eq!(parse_command("RESET"), Some(Command::Reset));
        assert_eq!(parse_command("stats"), Some(Command::Stats));
        assert_eq!(parse_command("q"), Some(Command::Quit));
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert_eq!(parse_command("offset"), None);
        assert_eq!(parse_command("offset ten"), None);
        assert_eq!(parse_command("reset now"), None);
        assert_eq!(parse_command("tune 100"), None);
    }
}
