//! Center frequency control while capture is running

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::stats::PipelineStats;
use crate::device::TunerDevice;
use crate::error::{CaptureError, DeviceError};

/// What happens to the tracked frequency when the device rejects a retune
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetunePolicy {
    /// Keep the requested frequency; the ledger follows user intent
    #[default]
    Optimistic,
    /// Restore the previous frequency
    Rollback,
}

impl FromStr for RetunePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(Self::Optimistic),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown retune policy '{}'", other)),
        }
    }
}

/// Tracked center frequency of the session, in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunedFrequency {
    pub nominal_hz: i64,
    pub current_hz: i64,
}

/// Shifts or resets the device center frequency.
///
/// Cheap to clone; all clones share one ledger. The lock covers the
/// read-modify-write and the device call, never the stream.
#[derive(Clone)]
pub struct TuningController {
    device: Arc<dyn TunerDevice>,
    state: Arc<Mutex<TunedFrequency>>,
    policy: RetunePolicy,
    stats: Arc<PipelineStats>,
}

impl TuningController {
    pub fn new(
        device: Arc<dyn TunerDevice>,
        nominal_hz: u32,
        policy: RetunePolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(TunedFrequency {
                nominal_hz: nominal_hz as i64,
                current_hz: nominal_hz as i64,
            })),
            policy,
            stats,
        }
    }

    pub fn policy(&self) -> RetunePolicy {
        self.policy
    }

    pub fn nominal_frequency(&self) -> i64 {
        self.lock_state().nominal_hz
    }

    /// Frequency the controller believes the device is tuned to
    pub fn current_frequency(&self) -> i64 {
        self.lock_state().current_hz
    }

    /// Move the tracked frequency down by `hz` and retune.
    ///
    /// Returns the new tracked frequency. On failure the ledger is handled
    /// according to the [`RetunePolicy`].
    pub fn apply_offset(&self, hz: i64) -> Result<i64, CaptureError> {
        let mut state = self.lock_state();
        let previous = state.current_hz;
        let target = previous.saturating_sub(hz);
        let result = self.retune(&mut state, previous, target);
        info!("rtl rf offset: {} Hz -> {} Hz", hz, state.current_hz);
        result.map(|()| state.current_hz)
    }

    /// Return to the nominal frequency
    pub fn reset(&self) -> Result<i64, CaptureError> {
        let mut state = self.lock_state();
        let previous = state.current_hz;
        let target = state.nominal_hz;
        let result = self.retune(&mut state, previous, target);
        info!("rtl rf reset: {} Hz", state.current_hz);
        result.map(|()| state.current_hz)
    }

    fn retune(
        &self,
        state: &mut TunedFrequency,
        previous: i64,
        target: i64,
    ) -> Result<(), CaptureError> {
        state.current_hz = target;

        let outcome = u32::try_from(target)
            .map_err(|_| DeviceError::OutOfRange {
                op: "center_frequency",
                value: target,
            })
            .and_then(|hz| self.device.set_center_frequency(hz));
        self.stats.record_retune(outcome.is_ok());

        outcome.map_err(|source| {
            if self.policy == RetunePolicy::Rollback {
                state.current_hz = previous;
            }
            warn!(
                "Retune to {} Hz failed: {} (tracking {} Hz)",
                target, source, state.current_hz
            );
            CaptureError::ConfigurationRejected {
                setting: "center_frequency",
                source,
            }
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TunedFrequency> {
        // A panic while holding the lock cannot leave the ledger half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SyntheticDevice;
    use std::thread;

    const F0: u32 = 739_525_000;

    fn controller(policy: RetunePolicy) -> (TuningController, Arc<SyntheticDevice>) {
        let device = Arc::new(SyntheticDevice::new());
        let tuner = TuningController::new(device.clone(), F0, policy, PipelineStats::new());
        (tuner, device)
    }

    #[test]
    fn test_offsets_accumulate_downward() {
        let (tuner, device) = controller(RetunePolicy::Optimistic);
        assert_eq!(tuner.current_frequency(), F0 as i64);

        assert_eq!(tuner.apply_offset(100).unwrap(), F0 as i64 - 100);
        assert_eq!(tuner.apply_offset(100).unwrap(), F0 as i64 - 200);
        assert_eq!(device.center_frequency(), F0 - 200);

        assert_eq!(tuner.apply_offset(-50).unwrap(), F0 as i64 - 150);
    }

    #[test]
    fn test_reset_restores_nominal() {
        let (tuner, device) = controller(RetunePolicy::Optimistic);
        for off in [1_000, -20_000, 333] {
            tuner.apply_offset(off).unwrap();
        }
        assert_eq!(tuner.reset().unwrap(), F0 as i64);
        assert_eq!(tuner.current_frequency(), F0 as i64);
        assert_eq!(device.center_frequency(), F0);
        assert_eq!(tuner.nominal_frequency(), F0 as i64);
    }

    #[test]
    fn test_optimistic_policy_keeps_requested_state() {
        let (tuner, device) = controller(RetunePolicy::Optimistic);
        device.set_reject_frequency(true);

        let err = tuner.apply_offset(100).unwrap_err();
        assert!(matches!(err, CaptureError::ConfigurationRejected { .. }));
        assert_eq!(tuner.current_frequency(), F0 as i64 - 100);
        assert!(device.frequency_history().is_empty());
    }

    #[test]
    fn test_rollback_policy_restores_previous_state() {
        let (tuner, device) = controller(RetunePolicy::Rollback);
        assert_eq!(tuner.policy(), RetunePolicy::Rollback);
        tuner.apply_offset(100).unwrap();
        device.set_reject_frequency(true);

        assert!(tuner.apply_offset(100).is_err());
        assert_eq!(tuner.current_frequency(), F0 as i64 - 100);
        assert!(tuner.reset().is_err());
        assert_eq!(tuner.current_frequency(), F0 as i64 - 100);
    }

    #[test]
    fn test_out_of_range_target_is_rejected() {
        let (tuner, device) = controller(RetunePolicy::Rollback);
        assert!(tuner.apply_offset(F0 as i64 + 1).is_err());
        assert_eq!(tuner.current_frequency(), F0 as i64);
        assert!(device.frequency_history().is_empty());
    }

    #[test]
    fn test_concurrent_offsets_are_serialized() {
        let (tuner, _device) = controller(RetunePolicy::Optimistic);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tuner = tuner.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        tuner.apply_offset(10).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tuner.current_frequency(), F0 as i64 - 8_000);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("Rollback".parse::<RetunePolicy>(), Ok(RetunePolicy::Rollback));
        assert!("maybe".parse::<RetunePolicy>().is_err());
    }
}
