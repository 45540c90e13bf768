//! Tick-based throughput sampling with early-stop rules.
//!
//! The sampler is pure: the download driver feeds it the cumulative byte
//! count and number of live workers once per interval and stops when it
//! returns a [`StopReason`].

use crate::config::{DownloadConfig, MAX_SPEED_SAMPLES};
use crate::node::SampleBuffer;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerLimits {
    pub interval: Duration,
    pub max_ticks: usize,
    pub max_bytes: u64,
    pub stable_window: usize,
    pub stable_tolerance: f64,
    pub slow_abort_ticks: usize,
    pub slow_abort_bytes: u64,
}

impl From<&DownloadConfig> for SamplerLimits {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            max_ticks: config.max_ticks.min(MAX_SPEED_SAMPLES),
            max_bytes: config.max_bytes,
            stable_window: config.stable_window,
            stable_tolerance: config.stable_tolerance,
            slow_abort_ticks: config.slow_abort_ticks,
            slow_abort_bytes: config.slow_abort_bytes,
        }
    }
}

impl Default for SamplerLimits {
    fn default() -> Self {
        Self::from(&DownloadConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ByteCap,
    TooSlow,
    Stable,
    WorkersDone,
    TickLimit,
}

#[derive(Debug, Clone)]
pub struct SpeedSampler {
    limits: SamplerLimits,
    last_total: u64,
    speeds: SampleBuffer<u64, MAX_SPEED_SAMPLES>,
    max_pair: u64,
}

impl SpeedSampler {
    pub fn new(limits: SamplerLimits) -> Self {
        Self {
            limits,
            last_total: 0,
            speeds: SampleBuffer::new(),
            max_pair: 0,
        }
    }

    pub fn limits(&self) -> &SamplerLimits {
        &self.limits
    }

    /// Record one interval. `total_bytes` is cumulative.
    pub fn tick(&mut self, total_bytes: u64, workers_running: usize) -> Option<StopReason> {
        let delta = total_bytes.saturating_sub(self.last_total);
        self.last_total = total_bytes;

        let interval_ms = self.limits.interval.as_millis().max(1) as u64;
        let speed = delta.saturating_mul(1000) / interval_ms;
        if !self.speeds.push(speed) {
            return Some(StopReason::TickLimit);
        }

        let ticks = self.speeds.len();
        if ticks % 2 == 0 {
            let s = self.speeds.as_slice();
            let pair = (s[ticks - 1] + s[ticks - 2]) / 2;
            self.max_pair = self.max_pair.max(pair);
        }

        if total_bytes >= self.limits.max_bytes {
            return Some(StopReason::ByteCap);
        }
        if workers_running == 0 {
            return Some(StopReason::WorkersDone);
        }
        if ticks >= self.limits.slow_abort_ticks && total_bytes < self.limits.slow_abort_bytes {
            return Some(StopReason::TooSlow);
        }
        if self.is_stable() {
            return Some(StopReason::Stable);
        }
        if ticks >= self.limits.max_ticks.min(MAX_SPEED_SAMPLES) {
            return Some(StopReason::TickLimit);
        }
        None
    }

    /// Last `stable_window` tick speeds all within tolerance of their mean.
    fn is_stable(&self) -> bool {
        let window = self.limits.stable_window;
        let s = self.speeds.as_slice();
        if window < 2 || s.len() < window {
            return false;
        }
        let recent = &s[s.len() - window..];
        let mean = recent.iter().sum::<u64>() as f64 / window as f64;
        if mean <= 0.0 {
            return false;
        }
        recent
            .iter()
            .all(|&v| ((v as f64 - mean) / mean).abs() <= self.limits.stable_tolerance)
    }

    pub fn samples(&self) -> &SampleBuffer<u64, MAX_SPEED_SAMPLES> {
        &self.speeds
    }

    /// Best average over consecutive tick pairs, or the best single tick
    /// when no pair was completed.
    pub fn max_speed(&self) -> u64 {
        if self.max_pair > 0 {
            return self.max_pair;
        }
        self.speeds.as_slice().iter().copied().max().unwrap_or(0)
    }

    pub fn average_speed(total_bytes: u64, elapsed: Duration) -> f64 {
        total_bytes as f64 * 1000.0 / (elapsed.as_millis() as f64 + 1.0)
    }
}
