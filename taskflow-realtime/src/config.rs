//! Client configuration: endpoint, identity, reconnect policy and buffer sizes.
//!
//! The socket endpoint is derived from the configured REST base URL by
//! swapping the scheme (`http` → `ws`, `https` → `wss`) and appending the
//! socket path.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RealtimeError;
use crate::protocol::UserRef;

/// Bounded exponential backoff for reconnect attempts.
///
/// Attempt `n` (1-based) waits `min(initial * multiplier^(n-1), max)`,
/// plus up to 25% random jitter when `jitter` is set. After `max_attempts`
/// failed attempts the connection moves to `Failed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay for attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to sleep before attempt `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::random::<u64>() % spread)
    }
}

/// Configuration for [`RealtimeClient`](crate::client::RealtimeClient).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// REST API base, e.g. `https://tasks.example.com/api`.
    pub api_base_url: String,
    /// Path of the socket endpoint relative to the API base.
    pub socket_path: String,
    /// Identity announced with presence, typing, lock and operation requests.
    pub user: UserRef,
    pub backoff: BackoffPolicy,
    /// Upper bound on a lock/operation round trip.
    pub request_timeout_ms: u64,
    pub outbound_buffer: usize,
    pub inbound_buffer: usize,
    /// Window in which a repeated "still typing" signal is suppressed.
    pub typing_refresh_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            socket_path: "/ws".to_string(),
            user: UserRef::new("anonymous", ""),
            backoff: BackoffPolicy::default(),
            request_timeout_ms: 10_000,
            outbound_buffer: 256,
            inbound_buffer: 1024,
            typing_refresh_ms: 3_000,
        }
    }
}

impl RealtimeConfig {
    /// Config pointing at `api_base_url` with defaults for everything else.
    pub fn new(api_base_url: impl Into<String>, user: UserRef) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            user,
            ..Self::default()
        }
    }

    /// Read `TASKFLOW_API_URL`, `TASKFLOW_USER_ID` and `TASKFLOW_USER_NAME`.
    pub fn from_env() -> Result<Self, RealtimeError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TASKFLOW_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(id) = std::env::var("TASKFLOW_USER_ID") {
            config.user.id = id;
        }
        if let Ok(name) = std::env::var("TASKFLOW_USER_NAME") {
            config.user.name = name;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RealtimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RealtimeError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RealtimeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RealtimeError> {
        self.ws_endpoint()?;
        if self.user.id.is_empty() {
            return Err(RealtimeError::Config("user id must not be empty".into()));
        }
        if self.backoff.max_attempts == 0 {
            return Err(RealtimeError::Config(
                "backoff.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Socket endpoint derived from the API base URL.
    pub fn ws_endpoint(&self) -> Result<String, RealtimeError> {
        let base = self.api_base_url.trim_end_matches('/');
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(RealtimeError::Config(format!(
                "unsupported API base URL scheme: {}",
                self.api_base_url
            )));
        };

        if self.socket_path.is_empty() {
            return Ok(socket_base);
        }
        let path = self.socket_path.trim_start_matches('/');
        Ok(format!("{socket_base}/{path}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn typing_refresh(&self) -> Duration {
        Duration::from_millis(self.typing_refresh_ms)
    }
}
