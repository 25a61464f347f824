use std::time::Duration;

use serde::Deserialize;

use crate::types::{FanSpeed, TemperatureUnit};

pub const DEFAULT_PORT: u16 = 7777;

/// Per-device settings handed over by whatever loads the bridge
/// configuration. Immutable once a client or manager is built from it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub retry: RetryConfig,
    pub unit: TemperatureUnit,
    pub features: FeatureFlags,
    pub poll_interval_secs: u64,
    pub degraded_poll_interval_secs: u64,
    pub failed_polls_threshold: u32,
    pub quick_refresh_ms: u64,
    /// Window after a local change during which contradicting device
    /// reports for the same field are distrusted.
    pub ui_hold_secs: u64,
    pub cache_ttl_secs: Option<u64>,
    pub auto_fan_policy: AutoFanPolicy,
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// `host:port`, bracketing bare IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn degraded_poll_interval(&self) -> Duration {
        Duration::from_secs(self.degraded_poll_interval_secs)
    }

    pub fn quick_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.quick_refresh_ms)
    }

    pub fn protection_window(&self) -> Duration {
        Duration::from_secs(self.ui_hold_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or(self.poll_interval_secs))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            timeout_ms: 1000,
            retry: RetryConfig::default(),
            unit: TemperatureUnit::Fahrenheit,
            features: FeatureFlags::default(),
            poll_interval_secs: 30,
            degraded_poll_interval_secs: 120,
            failed_polls_threshold: 3,
            quick_refresh_ms: 2000,
            ui_hold_secs: 10,
            cache_ttl_secs: None,
            auto_fan_policy: AutoFanPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    /// Double the delay after each failed attempt.
    pub exponential: bool,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        if self.exponential {
            base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        } else {
            base
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 500,
            exponential: false,
        }
    }
}

/// Optional fields some units do not support. Disabled features are
/// never written to the device.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub swing: bool,
    pub eco: bool,
    pub display: bool,
    pub beep: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            swing: true,
            eco: true,
            display: true,
            beep: true,
        }
    }
}

/// What a user request for Auto fan becomes while turbo and sleep are both
/// Off. Some firmware silently rejects that combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoFanPolicy {
    Preserve,
    Substitute(FanSpeed),
}

impl Default for AutoFanPolicy {
    fn default() -> Self {
        AutoFanPolicy::Substitute(FanSpeed::Low)
    }
}
