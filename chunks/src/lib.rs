//! Shared chunk model for the agent event stream.
//!
//! This crate owns the wire vocabulary used by both the live stream consumer
//! and the history replay loader. Events arrive as loose JSON objects; decoding
//! dispatches on the `type` tag into the closed [`ChunkKind`] set and ignores
//! any payload field the kind does not use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned when a raw event or stored step cannot become a [`Chunk`].
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The raw text was not valid JSON, or a chunk could not be serialized.
    #[error("invalid chunk JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The decoded JSON value is not an object.
    #[error("chunk is not a JSON object")]
    NotAnObject,
    /// The object has no string `type` tag.
    #[error("chunk is missing the `type` tag")]
    MissingType,
    /// The `type` tag is not part of the chunk vocabulary.
    #[error("unknown chunk type: {0}")]
    UnknownType(String),
    /// The `phase` tag is present but not a known phase.
    #[error("unknown chunk phase: {0}")]
    UnknownPhase(String),
    /// A field the chunk kind cannot do without is absent.
    #[error("`{kind}` chunk is missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

/// Named stage of agent work. Each phase owns its own accumulator shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Research,
    Generation,
    DoubtClearance,
}

impl Phase {
    /// Wire spelling of the phase tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Generation => "generation",
            Self::DoubtClearance => "doubt-clearance",
        }
    }

    /// Parse a wire phase tag. Snake-case spellings are accepted too.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "research" => Some(Self::Research),
            "generation" => Some(Self::Generation),
            "doubt-clearance" => Some(Self::DoubtClearance),
            _ => None,
        }
    }
}

/// Which agent flow produced an assistant message.
///
/// The flow decides the terminal phase: a message is frozen when the
/// `phase-complete` chunk of that phase arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowType {
    /// Research followed by worksheet generation.
    #[default]
    Worksheet,
    /// Research followed by a direct answer.
    DoubtClearance,
}

impl FlowType {
    #[must_use]
    pub fn terminal_phase(self) -> Phase {
        match self {
            Self::Worksheet => Phase::Generation,
            Self::DoubtClearance => Phase::DoubtClearance,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worksheet => "worksheet",
            Self::DoubtClearance => "doubt-clearance",
        }
    }

    /// Parse a flow name, including the router's `WORKSHEET_FLOW` / `DOUBT_FLOW`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "worksheet" | "worksheet-flow" | "worksheet-generation" => Some(Self::Worksheet),
            "doubt" | "doubt-flow" | "doubt-clearance" => Some(Self::DoubtClearance),
            _ => None,
        }
    }
}

/// Final summary fields carried by a `phase-complete` chunk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worksheet_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_successfully: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    /// Opaque execution summary; attached to the message as metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_summary: Option<Value>,
}

/// Type-dependent payload of a chunk, keyed by the wire `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChunkKind {
    /// An assistant message begins. May announce the routed flow.
    Start {
        #[serde(rename = "flowType", skip_serializing_if = "Option::is_none")]
        flow_type: Option<FlowType>,
    },
    /// Human-readable "current activity" line.
    Status { status: String },
    /// The agent invoked a tool.
    ToolCall {
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    /// A fragment of streamed text.
    TextDelta {
        #[serde(rename = "textDelta")]
        delta: String,
    },
    /// The agent issued a web search.
    SearchQuery { query: String },
    /// The agent fetched a page.
    WebsiteVisited { url: String },
    /// The chunk's phase finished.
    PhaseComplete(PhaseSummary),
    /// The backend reported a failure for this stream.
    Error { message: String },
    /// End-of-stream marker.
    Finish,
}

impl ChunkKind {
    /// Canonical wire tag for this kind.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Status { .. } => "status",
            Self::ToolCall { .. } => "tool-call",
            Self::TextDelta { .. } => "text-delta",
            Self::SearchQuery { .. } => "search-query",
            Self::WebsiteVisited { .. } => "website-visited",
            Self::PhaseComplete(_) => "phase-complete",
            Self::Error { .. } => "error",
            Self::Finish => "finish",
        }
    }
}

/// One atomic stream event.
///
/// Serializes to the flat wire object `{type, phase, ...payload}` so a step
/// recorded during a live stream can be persisted and decoded again verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Chunk {
    /// Target assistant message, when the backend names one.
    #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Phase tag. Control chunks (`start`, `finish`) usually carry none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Backend clock in milliseconds, when provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub kind: ChunkKind,
}

impl Chunk {
    #[must_use]
    pub fn new(kind: ChunkKind) -> Self {
        Self { message_id: None, phase: None, timestamp: None, kind }
    }

    #[must_use]
    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    #[must_use]
    pub fn for_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Text carried by a `text-delta` chunk.
    #[must_use]
    pub fn text_delta(&self) -> Option<&str> {
        match &self.kind {
            ChunkKind::TextDelta { delta } => Some(delta),
            _ => None,
        }
    }

    /// Decode a chunk from a loose JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError`] when the value is not an object, has no known
    /// `type`, names an unknown phase, or lacks a field its kind requires.
    pub fn from_value(value: &Value) -> Result<Self, ChunkError> {
        let obj = value.as_object().ok_or(ChunkError::NotAnObject)?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ChunkError::MissingType)?;

        let phase = match obj.get("phase") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => {
                Some(Phase::parse(raw).ok_or_else(|| ChunkError::UnknownPhase(raw.clone()))?)
            }
            Some(other) => return Err(ChunkError::UnknownPhase(other.to_string())),
        };

        Ok(Self {
            message_id: pick_str(obj, &["messageId", "message_id"]).map(str::to_owned),
            phase,
            timestamp: obj.get("timestamp").and_then(Value::as_i64),
            kind: decode_kind(tag, obj)?,
        })
    }
}

impl TryFrom<Value> for Chunk {
    type Error = ChunkError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

/// Decode one raw event payload (a JSON object in text form).
///
/// # Errors
///
/// Returns [`ChunkError::Json`] for malformed JSON and the
/// [`Chunk::from_value`] errors for well-formed but unusable objects.
pub fn decode_chunk(raw: &str) -> Result<Chunk, ChunkError> {
    let value = serde_json::from_str::<Value>(raw)?;
    Chunk::from_value(&value)
}

/// Encode a chunk into its flat wire JSON text.
///
/// # Errors
///
/// Returns [`ChunkError::Json`] if serialization fails, which only happens
/// for non-finite numbers inside an execution summary.
pub fn encode_chunk(chunk: &Chunk) -> Result<String, ChunkError> {
    Ok(serde_json::to_string(chunk)?)
}

/// Flatten a stored history step into a chunk.
///
/// Stored steps look like `{step, phase, type, timestamp, chunkData}`; the
/// chunk is `{type, phase, ...chunkData}` with `chunkData` keys winning. The
/// step's own `timestamp` is storage time, not the chunk clock, so it is not
/// carried over. Steps without `chunkData` are decoded as already-flat chunks.
///
/// # Errors
///
/// Returns the same errors as [`Chunk::from_value`].
pub fn normalize_step(step: &Value) -> Result<Chunk, ChunkError> {
    let obj = step.as_object().ok_or(ChunkError::NotAnObject)?;
    let Some(data) = obj.get("chunkData") else {
        return Chunk::from_value(step);
    };

    let mut flat = Map::new();
    for key in ["type", "phase"] {
        if let Some(value) = obj.get(key) {
            flat.insert(key.to_owned(), value.clone());
        }
    }
    if let Some(data) = data.as_object() {
        for (key, value) in data {
            flat.insert(key.clone(), value.clone());
        }
    }

    Chunk::from_value(&Value::Object(flat))
}

/// Position recorded on a stored step, if any.
#[must_use]
pub fn step_index(step: &Value) -> Option<u64> {
    step.get("step").and_then(Value::as_u64)
}

fn decode_kind(tag: &str, obj: &Map<String, Value>) -> Result<ChunkKind, ChunkError> {
    let kind = match tag {
        "start" => ChunkKind::Start {
            flow_type: pick_str(obj, &["flowType", "flow_type"]).and_then(FlowType::parse),
        },
        "status" => ChunkKind::Status {
            status: required(obj, "status", &["status", "content", "message"])?,
        },
        "tool-call" => ChunkKind::ToolCall {
            tool_name: required(obj, "tool-call", &["toolName", "tool_name"])?,
        },
        // `token` is the legacy agent service name for a text delta.
        "text-delta" | "token" => ChunkKind::TextDelta {
            delta: required(obj, "text-delta", &["textDelta", "delta", "content"])?,
        },
        "search-query" => ChunkKind::SearchQuery {
            query: required(obj, "search-query", &["query"])?,
        },
        "website-visited" => ChunkKind::WebsiteVisited {
            url: required(obj, "website-visited", &["url"])?,
        },
        "phase-complete" => ChunkKind::PhaseComplete(PhaseSummary {
            worksheet_title: pick_str(obj, &["worksheetTitle"]).map(str::to_owned),
            content_length: obj.get("contentLength").and_then(Value::as_u64),
            saved_successfully: obj.get("savedSuccessfully").and_then(Value::as_bool),
            pdf_location: pick_str(obj, &["pdfLocation"]).map(str::to_owned),
            final_answer: pick_str(obj, &["finalAnswer"]).map(str::to_owned),
            execution_summary: obj
                .get("executionSummary")
                .filter(|value| !value.is_null())
                .cloned(),
        }),
        "error" => ChunkKind::Error {
            message: pick_str(obj, &["message", "error", "content"])
                .unwrap_or("agent reported an error")
                .to_owned(),
        },
        "finish" | "done" => ChunkKind::Finish,
        other => return Err(ChunkError::UnknownType(other.to_owned())),
    };
    Ok(kind)
}

fn pick_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn required(
    obj: &Map<String, Value>,
    kind: &'static str,
    keys: &[&'static str],
) -> Result<String, ChunkError> {
    pick_str(obj, keys)
        .map(str::to_owned)
        .ok_or(ChunkError::MissingField { kind, field: keys[0] })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
