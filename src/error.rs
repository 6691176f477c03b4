//! Error taxonomy for the chat pipeline.
//!
//! DESIGN
//! ======
//! Every failure a user can see becomes a [`Notice`] built from an
//! [`ErrorCode`] implementor. Malformed chunks are not in this list: they are
//! logged and dropped where they are decoded and never reach the UI.

use serde::Serialize;

/// Maps a domain error to a stable code and a retry hint.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// User-visible notification raised by the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl Notice {
    #[must_use]
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self { code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }
}

/// Errors from opening or reading the live agent stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request to the agent service failed before a response arrived.
    #[error("stream request failed: {0}")]
    Request(String),

    /// The agent service answered with a non-success status.
    #[error("stream response error: status {status}")]
    Status { status: u16, body: String },

    /// Reading the response body failed mid-stream.
    #[error("stream read failed: {0}")]
    Transport(String),

    /// The backend sent an `error` chunk.
    #[error("agent error: {0}")]
    Server(String),

    /// No event arrived within the idle window.
    #[error("no event received for {secs}s")]
    IdleTimeout { secs: u64 },
}

impl ErrorCode for StreamError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Request(_) => "E_STREAM_REQUEST",
            Self::Status { .. } => "E_STREAM_STATUS",
            Self::Transport(_) => "E_STREAM_TRANSPORT",
            Self::Server(_) => "E_AGENT_ERROR",
            Self::IdleTimeout { .. } => "E_STREAM_IDLE_TIMEOUT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Request(_)
                | Self::Transport(_)
                | Self::IdleTimeout { .. }
                | Self::Status { status: 429 | 500..=599, .. }
        )
    }
}

/// Errors from fetching persisted chat history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The history request failed before a response arrived.
    #[error("history request failed: {0}")]
    Request(String),

    /// The history endpoint answered with a non-success status.
    #[error("history response error: status {status}")]
    Status { status: u16, body: String },

    /// The response body is not a history document.
    #[error("history response parse failed: {0}")]
    Parse(String),
}

impl ErrorCode for HistoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::Request(_) => "E_HISTORY_REQUEST",
            Self::Status { .. } => "E_HISTORY_STATUS",
            Self::Parse(_) => "E_HISTORY_PARSE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { status: 429 | 500..=599, .. })
    }
}

/// Errors from reading client configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A URL variable does not name an http(s) endpoint.
    #[error("{var} must be an http(s) URL, got '{value}'")]
    InvalidUrl { var: &'static str, value: String },

    /// A timeout variable was set to zero.
    #[error("{var} must be greater than zero")]
    ZeroTimeout { var: &'static str },
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "E_CONFIG_URL",
            Self::ZeroTimeout { .. } => "E_CONFIG_TIMEOUT",
        }
    }
}
