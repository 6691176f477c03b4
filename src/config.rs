//! Client configuration parsed from environment variables.

use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_AGENT_URL: &str = "http://localhost:8000";
pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HISTORY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Longest gap between two stream events before the stream is abandoned.
    pub idle_secs: u64,
    pub connect_secs: u64,
    /// Whole-request limit for a history fetch.
    pub history_secs: u64,
}

impl ClientTimeouts {
    #[must_use]
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub fn history(&self) -> Duration {
        Duration::from_secs(self.history_secs)
    }
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            idle_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            history_secs: DEFAULT_HISTORY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the agent service that serves `/api/chat`.
    pub agent_url: String,
    /// Base URL of the REST backend that serves chat history.
    pub api_url: String,
    pub timeouts: ClientTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_owned(),
            api_url: DEFAULT_API_URL.to_owned(),
            timeouts: ClientTimeouts::default(),
        }
    }
}

impl ClientConfig {
    /// Build typed client config from environment variables.
    ///
    /// Optional:
    /// - `SUDAR_AGENT_URL`: default `http://localhost:8000`
    /// - `SUDAR_API_URL`: default `http://localhost:3000`
    /// - `SUDAR_STREAM_IDLE_TIMEOUT_SECS`: default 60
    /// - `SUDAR_CONNECT_TIMEOUT_SECS`: default 10
    /// - `SUDAR_HISTORY_TIMEOUT_SECS`: default 30
    ///
    /// Unparseable numbers fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a URL is not http(s) or a timeout is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let agent_url = env_url("SUDAR_AGENT_URL", DEFAULT_AGENT_URL)?;
        let api_url = env_url("SUDAR_API_URL", DEFAULT_API_URL)?;
        let timeouts = ClientTimeouts {
            idle_secs: env_timeout("SUDAR_STREAM_IDLE_TIMEOUT_SECS", DEFAULT_STREAM_IDLE_TIMEOUT_SECS)?,
            connect_secs: env_timeout("SUDAR_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            history_secs: env_timeout("SUDAR_HISTORY_TIMEOUT_SECS", DEFAULT_HISTORY_TIMEOUT_SECS)?,
        };

        Ok(Self { agent_url, api_url, timeouts })
    }
}

fn env_url(var: &'static str, default: &str) -> Result<String, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_owned());
    let trimmed = value.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidUrl { var, value });
    }
    Ok(trimmed.to_owned())
}

fn env_timeout(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_parse_u64(var, default) {
        0 => Err(ConfigError::ZeroTimeout { var }),
        secs => Ok(secs),
    }
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
