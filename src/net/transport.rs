//! Live chunk transport: the seam between the session and the agent service.

use std::pin::Pin;

use async_trait::async_trait;
use chunks::FlowType;
use futures_util::Stream;
use serde::Serialize;

use super::sse::sse_events;
use crate::config::ClientConfig;
use crate::error::StreamError;

/// Raw event payloads in delivery order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Body of `POST /api/chat`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub chat_id: String,
    pub query: String,
    /// Explicit flow choice; the agent's router decides when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<FlowType>,
    /// Files referenced with `@name` mentions in the query.
    pub context_files: Vec<String>,
}

/// Opens one ordered event stream per submitted query.
///
/// Dropping the returned stream must close the underlying connection.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<EventStream, StreamError>;
}

/// SSE over HTTP POST to `{agent_url}/api/chat`.
pub struct SseTransport {
    http: reqwest::Client,
    agent_url: String,
}

impl SseTransport {
    /// # Errors
    ///
    /// Returns [`StreamError::HttpClientBuild`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, StreamError> {
        // No whole-request timeout: streams legitimately run for minutes. The
        // session enforces the idle gap instead.
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect())
            .build()
            .map_err(|e| StreamError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, agent_url: config.agent_url.clone() })
    }
}

#[async_trait]
impl ChunkTransport for SseTransport {
    async fn open(&self, request: &ChatRequest) -> Result<EventStream, StreamError> {
        let url = format!("{}/api/chat", self.agent_url);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| StreamError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status { status: status.as_u16(), body });
        }

        tracing::debug!(chat_id = %request.chat_id, "agent stream opened");
        Ok(sse_events(response.bytes_stream()))
    }
}
