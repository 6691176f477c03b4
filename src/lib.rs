//! Streaming-chat core for the Sudar teaching assistant.
//!
//! Live agent streams and stored history both become [`ProcessedMessage`]s
//! through the same fold, so a reloaded chat shows exactly what the live
//! session showed.

pub mod config;
pub mod error;
pub mod mentions;
pub mod net;
pub mod session;
pub mod state;

pub use chunks::{Chunk, ChunkError, ChunkKind, FlowType, Phase};
pub use config::ClientConfig;
pub use error::{ConfigError, ErrorCode, HistoryError, Notice, StreamError};
pub use phases::{PhaseState, PhaseTracker};
pub use session::{ChatSession, HistoryLoad, StreamOutcome};
pub use state::conversation::{Conversation, MessageId, MessageStatus, ProcessedMessage, Role};
