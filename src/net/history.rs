//! Persisted chat history: record shapes and the HTTP source.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::HistoryError;

/// User half of a stored exchange.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    #[serde(default, alias = "content")]
    pub query: String,
}

/// Assistant half of a stored exchange.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Stored `{step, phase, type, timestamp, chunkData}` tuples, left raw so
    /// one bad step cannot sink the whole record.
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default, alias = "flow_type")]
    pub flow_type: Option<String>,
}

/// One stored message record.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "message_type")]
    pub message_type: Option<String>,
    #[serde(default, alias = "user_message")]
    pub user_message: Option<UserMessage>,
    #[serde(default, alias = "agent_message")]
    pub agent_message: Option<AgentMessage>,
}

/// Where stored history comes from.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch every stored record of one chat, oldest first.
    async fn fetch(&self, user_id: &str, chat_id: &str) -> Result<Vec<HistoryRecord>, HistoryError>;
}

/// Parse a history response body.
///
/// Accepts a bare array of records or an object wrapping them in `messages`.
/// Records that do not deserialize are skipped with a warning.
///
/// # Errors
///
/// Returns [`HistoryError::Parse`] when the body is neither shape.
pub fn parse_history(body: Value) -> Result<Vec<HistoryRecord>, HistoryError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("messages") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(HistoryError::Parse(format!("`messages` is not an array: {other}")));
            }
        },
        other => return Err(HistoryError::Parse(format!("unexpected history body: {other}"))),
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<HistoryRecord>(item) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(index, error = %e, "skipping unparseable history record"),
        }
    }
    Ok(records)
}

/// Reads history from `GET {api_url}/api/chat/{chat_id}/history?user_id=...`.
pub struct HttpHistorySource {
    http: reqwest::Client,
    api_url: String,
}

impl HttpHistorySource {
    /// # Errors
    ///
    /// Returns [`HistoryError::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, HistoryError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect())
            .timeout(config.timeouts.history())
            .build()
            .map_err(|e| HistoryError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, api_url: config.api_url.clone() })
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch(&self, user_id: &str, chat_id: &str) -> Result<Vec<HistoryRecord>, HistoryError> {
        let url = format!("{}/api/chat/{chat_id}/history", self.api_url);
        let response = self
            .http
            .get(&url)
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(|e| HistoryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status { status: status.as_u16(), body });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| HistoryError::Parse(e.to_string()))?;
        parse_history(body)
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
