//! Reconnect schedule.
//!
//! The delay before retry `n` (1-based) is
//! `min(initial * multiplier^(n-1), ceiling)`.

use std::time::Duration;

use zros_types::TransportSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub initial: Duration,
    pub ceiling: Duration,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&TransportSettings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(t: &TransportSettings) -> Self {
        Self {
            auto_reconnect: t.auto_reconnect,
            initial: seconds(t.reconnect_interval_seconds, Duration::from_secs(5)),
            ceiling: seconds(t.max_reconnect_interval_seconds, Duration::from_secs(60)),
            multiplier: if t.backoff_multiplier.is_finite() {
                t.backoff_multiplier.max(1.0)
            } else {
                1.0
            },
            max_attempts: u32::try_from(t.max_reconnect_attempts).ok(),
        }
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.auto_reconnect && self.max_attempts.is_none_or(|max| failures <= max)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.max(1) - 1;
        let factor = self.multiplier.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.ceiling.as_secs_f64() {
            self.ceiling
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}
