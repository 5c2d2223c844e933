//! Configuration for the sync engine.
//!
//! Every struct here has defaults, `with_*` setters and serde support so a
//! deployment can load it from JSON. Durations are written as milliseconds.

use crate::error::{SyncError, SyncResult};
use offsync_protocol::DeviceConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Device ID (unique per installation).
    pub device_id: String,
    /// Signed-in user, if any.
    pub user_id: Option<String>,
    /// Base URL of the reconciliation server.
    pub server_url: String,
    /// URL of the push channel. `None` disables real-time updates.
    pub push_url: Option<String>,
    /// Bearer token for both channels.
    pub auth_token: Option<String>,
    /// Client version reported at registration.
    pub app_version: Option<String>,
    /// Upper bound for every network call of a sync pass.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Backoff for failed operations.
    pub queue_retry: RetryConfig,
    /// Backoff for push channel reconnects.
    pub reconnect_retry: RetryConfig,
    /// How long resolved conflicts are kept.
    #[serde(with = "millis")]
    pub conflict_retention: Duration,
    /// Device settings used until the server provides some.
    pub default_device_config: DeviceConfig,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new(device_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            default_device_config: DeviceConfig::defaults_for(device_id.clone()),
            device_id,
            user_id: None,
            server_url: server_url.into(),
            push_url: None,
            auth_token: None,
            app_version: None,
            request_timeout: Duration::from_secs(30),
            queue_retry: RetryConfig::queue(),
            reconnect_retry: RetryConfig::reconnect(),
            conflict_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let mut config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        if config.default_device_config.device_id.is_empty() {
            config.default_device_config.device_id = config.device_id.clone();
        }
        Ok(config)
    }

    /// Reads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Sets the user.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the push channel URL.
    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    /// Sets the bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the reported client version.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the queue backoff.
    pub fn with_queue_retry(mut self, retry: RetryConfig) -> Self {
        self.queue_retry = retry;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.reconnect_retry = retry;
        self
    }

    /// Sets the conflict retention window.
    pub fn with_conflict_retention(mut self, retention: Duration) -> Self {
        self.conflict_retention = retention;
        self
    }

    /// Sets the fallback device settings.
    pub fn with_default_device_config(mut self, config: DeviceConfig) -> Self {
        self.default_device_config = config;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap on the delay. `None` leaves it uncapped.
    #[serde(with = "opt_millis")]
    pub max_delay: Option<Duration>,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: None,
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Operation queue backoff: 3 attempts, 1s doubling, capped at one hour.
    ///
    /// The default budget never reaches the cap; it bounds raised
    /// `max_attempts` values.
    pub fn queue() -> Self {
        Self::new(3).with_max_delay(Duration::from_secs(3600))
    }

    /// Push reconnect backoff: unbounded attempts, 1s doubling up to 30s.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(30)),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true once `attempts` failures exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Calculates the delay after the given number of failures.
    ///
    /// `delay_for_attempt(0)` is zero; attempt `n` waits
    /// `initial_delay * multiplier^(n-1)`, capped by `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if let Some(max) = self.max_delay {
            delay_secs = delay_secs.min(max.as_secs_f64());
        }
        if !delay_secs.is_finite() {
            delay_secs = self.max_delay.unwrap_or(Duration::MAX).as_secs_f64();
        }

        if self.add_jitter {
            let jitter = delay_secs * rand::thread_rng().gen_range(0.0..0.25);
            Duration::try_from_secs_f64(delay_secs + jitter).unwrap_or(Duration::MAX)
        } else {
            Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::queue()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::millis::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
