//! Transport configuration.
//!
//! ```toml
//! [transport]
//! capacity = 8388608
//! name_prefix = "gridshm"
//! handshake_timeout_ms = 5000
//! ```

use crate::config::ConfigError;
use crate::consts::{
    CAPACITY_ENV_VAR, DEFAULT_ATTACH_RETRY_INTERVAL_MS, DEFAULT_ATTACH_TIMEOUT_MS,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_MONITOR_INTERVAL_MS, DEFAULT_NAME_PREFIX,
    DEFAULT_SPACE_CAPACITY, MAX_NAME_PREFIX_LEN, SPACE_MAX_CAPACITY, SPACE_MIN_CAPACITY,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for spaces, handshakes and the liveness monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Ring-buffer capacity per direction, in bytes.
    pub capacity: usize,
    /// Prefix of every region and semaphore name.
    pub name_prefix: String,
    /// Upper bound for a complete connect/accept handshake.
    pub handshake_timeout_ms: u64,
    /// How long an attach keeps retrying a name that does not resolve yet.
    pub attach_timeout_ms: u64,
    /// Pause between attach attempts.
    pub attach_retry_interval_ms: u64,
    /// Liveness monitor sweep interval.
    pub monitor_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SPACE_CAPACITY,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            attach_retry_interval_ms: DEFAULT_ATTACH_RETRY_INTERVAL_MS,
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
        }
    }
}

impl TransportConfig {
    /// Validate limits and naming.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `capacity` is outside `SPACE_MIN_CAPACITY..=SPACE_MAX_CAPACITY`
    /// - `name_prefix` is empty, longer than `MAX_NAME_PREFIX_LEN`, or
    ///   contains anything but `[A-Za-z0-9_]`
    /// - any timeout or interval is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(SPACE_MIN_CAPACITY..=SPACE_MAX_CAPACITY).contains(&self.capacity) {
            return Err(ConfigError::ValidationError(format!(
                "capacity {} out of range {SPACE_MIN_CAPACITY}..={SPACE_MAX_CAPACITY}",
                self.capacity
            )));
        }

        if self.name_prefix.len() > MAX_NAME_PREFIX_LEN {
            return Err(ConfigError::ValidationError(format!(
                "name_prefix is {} bytes, at most {MAX_NAME_PREFIX_LEN} allowed",
                self.name_prefix.len()
            )));
        }

        if self.name_prefix.is_empty()
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::ValidationError(format!(
                "name_prefix {:?} must be non-empty [A-Za-z0-9_]",
                self.name_prefix
            )));
        }

        for (field, value) in [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("attach_timeout_ms", self.attach_timeout_ms),
            ("attach_retry_interval_ms", self.attach_retry_interval_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        Ok(())
    }

    /// Apply `GRIDSHM_CAPACITY` if it is set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` if the variable is not a number.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_capacity_override(std::env::var(CAPACITY_ENV_VAR).ok().as_deref())
    }

    fn with_capacity_override(mut self, value: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(raw) = value {
            self.capacity = raw.trim().parse().map_err(|_| {
                ConfigError::ParseError(format!("{CAPACITY_ENV_VAR}={raw:?} is not a byte count"))
            })?;
        }
        Ok(self)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Attach timeout as a `Duration`.
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    /// Attach retry interval as a `Duration`.
    pub fn attach_retry_interval(&self) -> Duration {
        Duration::from_millis(self.attach_retry_interval_ms)
    }

    /// Monitor interval as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
