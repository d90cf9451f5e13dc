//! Per-proxy health and latency state.
//!
//! # Responsibilities
//! - Track alive/unhealthy state with a consecutive-failure threshold
//! - Hold last delay and smoothed mean delay
//! - Keep a short probe history for reporting
//!
//! # Design Decisions
//! - Delay and mean delay share one `AtomicU64` so readers never see a
//!   mismatched pair
//! - Zero means "no data"; measured delays are clamped to at least 1ms
//! - A failed probe never touches the delay word
//! - One successful probe restores an unhealthy proxy

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of probe results retained for reporting.
pub const HISTORY_LEN: usize = 10;

/// Weight of the newest sample in the mean delay.
const SMOOTHING: f64 = 0.3;

/// Health state enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Result of a latency probe, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DelayReport {
    pub delay: u32,
    #[serde(rename = "meanDelay")]
    pub mean_delay: u32,
}

/// One entry of the probe history. A zero delay records a failed probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayRecord {
    pub time: DateTime<Utc>,
    pub delay: u32,
    #[serde(rename = "meanDelay")]
    pub mean_delay: u32,
}

#[derive(Debug)]
pub struct Health {
    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    /// Last delay in the high 32 bits, mean delay in the low 32 bits.
    delays: AtomicU64,
    history: Mutex<VecDeque<DelayRecord>>,
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

impl Health {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            delays: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Return true unless the proxy has been marked unhealthy.
    pub fn is_alive(&self) -> bool {
        self.state() != HealthState::Unhealthy
    }

    /// Last delay and mean delay, read together.
    pub fn delays(&self) -> DelayReport {
        let (delay, mean_delay) = unpack(self.delays.load(Ordering::Acquire));
        DelayReport { delay, mean_delay }
    }

    pub fn history(&self) -> Vec<DelayRecord> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a successful probe and return the updated pair.
    pub(crate) fn record_success(&self, elapsed: Duration) -> DelayReport {
        let sample = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX).max(1);

        let previous = self
            .delays
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (_, mean) = unpack(packed);
                Some(pack(sample, smooth(mean, sample)))
            })
            .unwrap_or_else(|packed| packed);
        let report = DelayReport {
            delay: sample,
            mean_delay: smooth(unpack(previous).1, sample),
        };

        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.state.store(HealthState::Healthy as u8, Ordering::Release);
        self.push_history(report.delay, report.mean_delay);
        report
    }

    /// Record a failed probe. The delay word is left untouched.
    pub(crate) fn record_failure(&self, unhealthy_threshold: u32) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold.max(1) as usize {
            let previous = self.state.swap(HealthState::Unhealthy as u8, Ordering::AcqRel);
            if previous != HealthState::Unhealthy as u8 {
                tracing::debug!(failures, "Proxy marked unhealthy");
            }
        }
        let mean = self.delays().mean_delay;
        self.push_history(0, mean);
    }

    fn push_history(&self, delay: u32, mean_delay: u32) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(DelayRecord {
                time: Utc::now(),
                delay,
                mean_delay,
            });
        }
    }
}

fn pack(delay: u32, mean: u32) -> u64 {
    (u64::from(delay) << 32) | u64::from(mean)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Exponential moving average; the first sample seeds the mean.
fn smooth(mean: u32, sample: u32) -> u32 {
    if mean == 0 {
        return sample;
    }
    let next = SMOOTHING * f64::from(sample) + (1.0 - SMOOTHING) * f64::from(mean);
    (next.round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_mean() {
        let health = Health::new();
        let report = health.record_success(Duration::from_millis(100));
        assert_eq!(report, DelayReport { delay: 100, mean_delay: 100 });
        assert_eq!(health.delays(), report);
        assert_eq!(health.state(), HealthState::Healthy);
    }

    #[test]
    fn mean_is_smoothed() {
        let health = Health::new();
        health.record_success(Duration::from_millis(100));
        let report = health.record_success(Duration::from_millis(200));
        assert_eq!(report.delay, 200);
        assert_eq!(report.mean_delay, 130);
    }

    #[test]
    fn failure_keeps_previous_delays() {
        let health = Health::new();
        health.record_success(Duration::from_millis(40));
        health.record_failure(1);
        assert_eq!(health.delays(), DelayReport { delay: 40, mean_delay: 40 });
        assert!(!health.is_alive());

        let history = health.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].delay, 0);
    }

    #[test]
    fn threshold_gates_unhealthy_and_success_restores() {
        let health = Health::new();
        health.record_failure(3);
        health.record_failure(3);
        assert!(health.is_alive());
        health.record_failure(3);
        assert!(!health.is_alive());

        health.record_success(Duration::from_millis(5));
        assert!(health.is_alive());
    }

    #[test]
    fn history_is_bounded() {
        let health = Health::new();
        for ms in 1..=(HISTORY_LEN as u64 + 5) {
            health.record_success(Duration::from_millis(ms));
        }
        let history = health.history();
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history.last().unwrap().delay, HISTORY_LEN as u32 + 5);
    }
}
