use crate::error::CoreError;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Upper bound for every TTL and interval. Keeps `Instant + Duration` in range.
pub const MAX_INTERVAL_SECONDS: u64 = 30 * 24 * 60 * 60;
pub const MAX_QUIET_PERIOD_MS: u64 = 60 * 60 * 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60 * 1000;

fn at_most(field: &str, value: u64, max: u64) -> Result<(), CoreError> {
    if value > max {
        return Err(CoreError::Config(format!(
            "{field} must be <= {max}, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    /// Quiet period after the latest fragment before the burst is processed.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
    #[serde(default = "default_buffer_ttl_seconds")]
    pub buffer_ttl_seconds: u64,
    /// TTL written with a fresh pending job handle. Must exceed the quiet period.
    #[serde(default = "default_handle_ttl_seconds")]
    pub handle_ttl_seconds: u64,
    /// TTL applied to an existing handle when a newer fragment supersedes it.
    #[serde(default = "default_handle_refresh_ttl_seconds")]
    pub handle_refresh_ttl_seconds: u64,
    /// How long a due job may wait for a worker slot before it is discarded.
    #[serde(default = "default_start_window_seconds")]
    pub start_window_seconds: u64,
    #[serde(default)]
    pub store_retry: RetryPolicy,
}

fn default_quiet_period_ms() -> u64 {
    9_000
}

fn default_buffer_ttl_seconds() -> u64 {
    90
}

fn default_handle_ttl_seconds() -> u64 {
    150
}

fn default_handle_refresh_ttl_seconds() -> u64 {
    90
}

fn default_start_window_seconds() -> u64 {
    26
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            buffer_ttl_seconds: default_buffer_ttl_seconds(),
            handle_ttl_seconds: default_handle_ttl_seconds(),
            handle_refresh_ttl_seconds: default_handle_refresh_ttl_seconds(),
            start_window_seconds: default_start_window_seconds(),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl DebounceConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_ttl_seconds)
    }

    pub fn handle_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_ttl_seconds)
    }

    pub fn handle_refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.handle_refresh_ttl_seconds)
    }

    pub fn start_window(&self) -> Duration {
        Duration::from_secs(self.start_window_seconds)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.quiet_period_ms == 0 {
            return Err(CoreError::Config(
                "debounce.quiet_period_ms must be > 0".to_string(),
            ));
        }
        if self.buffer_ttl() <= self.quiet_period() {
            return Err(CoreError::Config(
                "debounce.buffer_ttl_seconds must exceed the quiet period".to_string(),
            ));
        }
        if self.handle_ttl() <= self.quiet_period() {
            return Err(CoreError::Config(
                "debounce.handle_ttl_seconds must exceed the quiet period".to_string(),
            ));
        }
        if self.handle_refresh_ttl_seconds == 0 {
            return Err(CoreError::Config(
                "debounce.handle_refresh_ttl_seconds must be > 0".to_string(),
            ));
        }
        at_most("debounce.quiet_period_ms", self.quiet_period_ms, MAX_QUIET_PERIOD_MS)?;
        for (field, value) in [
            ("debounce.buffer_ttl_seconds", self.buffer_ttl_seconds),
            ("debounce.handle_ttl_seconds", self.handle_ttl_seconds),
            (
                "debounce.handle_refresh_ttl_seconds",
                self.handle_refresh_ttl_seconds,
            ),
            ("debounce.start_window_seconds", self.start_window_seconds),
        ] {
            at_most(field, value, MAX_INTERVAL_SECONDS)?;
        }
        at_most(
            "debounce.store_retry.delay_ms",
            self.store_retry.delay_ms,
            MAX_RETRY_DELAY_MS,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Extra acquisition attempts after the first one.
    #[serde(default = "default_lock_retries")]
    pub retries: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_lock_ttl_seconds() -> u64 {
    10
}

fn default_lock_retries() -> u32 {
    5
}

fn default_lock_retry_delay_ms() -> u64 {
    500
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lock_ttl_seconds(),
            retries: default_lock_retries(),
            retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn acquire_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries.saturating_add(1),
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ttl_seconds == 0 {
            return Err(CoreError::Config("lock.ttl_seconds must be > 0".to_string()));
        }
        at_most("lock.ttl_seconds", self.ttl_seconds, MAX_INTERVAL_SECONDS)?;
        at_most("lock.retry_delay_ms", self.retry_delay_ms, MAX_RETRY_DELAY_MS)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_reaper_interval_seconds() -> u64 {
    100
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_seconds: default_reaper_interval_seconds(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.enabled && self.interval_seconds == 0 {
            return Err(CoreError::Config(
                "reaper.interval_seconds must be > 0".to_string(),
            ));
        }
        at_most(
            "reaper.interval_seconds",
            self.interval_seconds,
            MAX_INTERVAL_SECONDS,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_concurrency")]
    pub max_concurrency: usize,
    /// Hard limit on a single job body's runtime.
    #[serde(default = "default_queue_time_limit_seconds")]
    pub time_limit_seconds: u64,
    /// How long finished job records stay queryable.
    #[serde(default = "default_queue_result_retention_seconds")]
    pub result_retention_seconds: u64,
}

fn default_queue_max_concurrency() -> usize {
    8
}

fn default_queue_time_limit_seconds() -> u64 {
    120
}

fn default_queue_result_retention_seconds() -> u64 {
    360
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_queue_max_concurrency(),
            time_limit_seconds: default_queue_time_limit_seconds(),
            result_retention_seconds: default_queue_result_retention_seconds(),
        }
    }
}

impl QueueConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_seconds)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_seconds)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrency == 0 {
            return Err(CoreError::Config(
                "queue.max_concurrency must be > 0".to_string(),
            ));
        }
        if self.time_limit_seconds == 0 {
            return Err(CoreError::Config(
                "queue.time_limit_seconds must be > 0".to_string(),
            ));
        }
        at_most(
            "queue.time_limit_seconds",
            self.time_limit_seconds,
            MAX_INTERVAL_SECONDS,
        )?;
        at_most(
            "queue.result_retention_seconds",
            self.result_retention_seconds,
            MAX_INTERVAL_SECONDS,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.debounce.validate()?;
        self.lock.validate()?;
        self.reaper.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CoordinatorConfig::default()
            .validate()
            .expect("default config validates");
        QueueConfig::default().validate().expect("queue defaults");
        assert_eq!(LockConfig::default().acquire_policy().max_attempts(), 6);
    }

    #[test]
    fn handle_ttl_must_exceed_quiet_period() {
        let cfg = DebounceConfig {
            quiet_period_ms: 20_000,
            handle_ttl_seconds: 20,
            ..DebounceConfig::default()
        };
        let err = cfg.validate().expect_err("handle ttl too short");
        assert!(err.to_string().contains("handle_ttl_seconds"));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let cfg = DebounceConfig {
            buffer_ttl_seconds: u64::MAX,
            ..DebounceConfig::default()
        };
        let err = cfg.validate().expect_err("ttl overflows instant math");
        assert!(err.to_string().contains("debounce.buffer_ttl_seconds"));

        let cfg = DebounceConfig {
            quiet_period_ms: MAX_QUIET_PERIOD_MS + 1,
            handle_ttl_seconds: MAX_INTERVAL_SECONDS,
            buffer_ttl_seconds: MAX_INTERVAL_SECONDS,
            ..DebounceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = DebounceConfig {
            store_retry: RetryPolicy {
                attempts: 3,
                delay_ms: u64::MAX,
            },
            ..DebounceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let lock = LockConfig {
            retry_delay_ms: MAX_RETRY_DELAY_MS + 1,
            ..LockConfig::default()
        };
        assert!(lock.validate().is_err());

        let reaper = ReaperConfig {
            enabled: true,
            interval_seconds: u64::MAX,
        };
        assert!(reaper.validate().is_err());

        let queue = QueueConfig {
            result_retention_seconds: u64::MAX,
            ..QueueConfig::default()
        };
        assert!(queue.validate().is_err());
    }

    #[test]
    fn bounds_are_inclusive() {
        let cfg = CoordinatorConfig {
            debounce: DebounceConfig {
                quiet_period_ms: MAX_QUIET_PERIOD_MS,
                buffer_ttl_seconds: MAX_INTERVAL_SECONDS,
                handle_ttl_seconds: MAX_INTERVAL_SECONDS,
                ..DebounceConfig::default()
            },
            lock: LockConfig {
                retry_delay_ms: MAX_RETRY_DELAY_MS,
                ..LockConfig::default()
            },
            reaper: ReaperConfig {
                enabled: true,
                interval_seconds: MAX_INTERVAL_SECONDS,
            },
        };
        cfg.validate().expect("limits themselves are allowed");
    }
}
