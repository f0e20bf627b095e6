//! Client and server configuration.
//!
//! All durations serialize as integer milliseconds. Missing fields take
//! their defaults, so an empty TOML table is a valid config.

use crate::error::Error;
use crate::{
    ACCEPT_BUFFER_SIZE, DEFAULT_MAX_SESSIONS, DEFAULT_MIN_SESSIONS, DEFAULT_WINDOW,
    HANDSHAKE_TIMEOUT, SESSION_HANDSHAKE_TIMEOUT, TCP_KEEPALIVE, UPDATE_INTERVAL,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Reconnect and republish backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay
    #[serde(with = "duration_ms")]
    pub initial: Duration,
    /// Upper bound before jitter
    #[serde(with = "duration_ms")]
    pub max: Duration,
    /// Growth per failed attempt
    pub multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 1.3,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.initial.is_zero() {
            return Err(Error::Config("backoff.initial must be non-zero".into()));
        }
        if self.max < self.initial {
            return Err(Error::Config("backoff.max must be >= backoff.initial".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay sessions to keep alive
    pub min_sessions: usize,
    /// Entry refresh period
    #[serde(with = "duration_ms")]
    pub update_interval: Duration,
    /// Stream dial timeout
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Session establishment timeout
    #[serde(with = "duration_ms")]
    pub session_handshake_timeout: Duration,
    /// Receive window advertised for each stream, in bytes
    pub local_window: u32,
    /// Accept queue depth of each listener
    pub accept_buffer: usize,
    /// TCP keepalive idle time of relay connections
    #[serde(with = "duration_ms")]
    pub keepalive: Duration,
    /// Retry pacing
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_sessions: DEFAULT_MIN_SESSIONS,
            update_interval: UPDATE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            session_handshake_timeout: SESSION_HANDSHAKE_TIMEOUT,
            local_window: DEFAULT_WINDOW,
            accept_buffer: ACCEPT_BUFFER_SIZE,
            keepalive: TCP_KEEPALIVE,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_sessions == 0 {
            return Err(Error::Config("min_sessions must be at least 1".into()));
        }
        if self.local_window == 0 {
            return Err(Error::Config("local_window must be non-zero".into()));
        }
        if self.accept_buffer == 0 {
            return Err(Error::Config("accept_buffer must be non-zero".into()));
        }
        for (name, d) in [
            ("update_interval", self.update_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("session_handshake_timeout", self.session_handshake_timeout),
            ("keepalive", self.keepalive),
        ] {
            if d.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        self.backoff.validate()
    }
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Session capacity advertised in discovery
    pub max_sessions: usize,
    /// Entry refresh period
    #[serde(with = "duration_ms")]
    pub update_interval: Duration,
    /// Session establishment timeout
    #[serde(with = "duration_ms")]
    pub session_handshake_timeout: Duration,
    /// TCP keepalive idle time of client connections
    #[serde(with = "duration_ms")]
    pub keepalive: Duration,
    /// Retry pacing for entry publishes
    pub backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            update_interval: UPDATE_INTERVAL,
            session_handshake_timeout: SESSION_HANDSHAKE_TIMEOUT,
            keepalive: TCP_KEEPALIVE,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1".into()));
        }
        if self.update_interval.is_zero()
            || self.session_handshake_timeout.is_zero()
            || self.keepalive.is_zero()
        {
            return Err(Error::Config("intervals and timeouts must be non-zero".into()));
        }
        self.backoff.validate()
    }
}
