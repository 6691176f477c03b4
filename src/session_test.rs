use std::sync::Mutex;

use futures_util::stream;
use serde_json::json;

use super::*;
use crate::net::history::{AgentMessage, UserMessage};
use crate::state::conversation::{MessageId, MessageStatus, Role};

// =========================================================================
// mocks
// =========================================================================

enum Script {
    /// Yield these events, then end.
    Events(Vec<Result<String, StreamError>>),
    /// Yield these events, then never yield again.
    Hang(Vec<String>),
    /// Fail to open.
    Refuse(StreamError),
    /// Never finish opening.
    Stall,
}

struct MockTransport {
    scripts: Mutex<Vec<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self { scripts: Mutex::new(scripts), requests: Mutex::new(Vec::new()) })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChunkTransport for MockTransport {
    async fn open(&self, request: &ChatRequest) -> Result<EventStream, StreamError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().remove(0);
        match script {
            Script::Events(events) => Ok(Box::pin(stream::iter(events))),
            Script::Hang(events) => {
                Ok(Box::pin(stream::iter(events.into_iter().map(Ok::<String, StreamError>)).chain(stream::pending())))
            }
            Script::Refuse(err) => Err(err),
            Script::Stall => std::future::pending().await,
        }
    }
}

struct MockHistory {
    result: Mutex<Result<Vec<HistoryRecord>, HistoryError>>,
    calls: Mutex<usize>,
}

impl MockHistory {
    fn new(result: Result<Vec<HistoryRecord>, HistoryError>) -> Arc<Self> {
        Arc::new(Self { result: Mutex::new(result), calls: Mutex::new(0) })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl HistorySource for MockHistory {
    async fn fetch(&self, _user_id: &str, _chat_id: &str) -> Result<Vec<HistoryRecord>, HistoryError> {
        *self.calls.lock().unwrap() += 1;
        self.result.lock().unwrap().clone()
    }
}

fn session(transport: Arc<MockTransport>, history: Arc<MockHistory>) -> ChatSession {
    ChatSession::new(transport, history, "user-1", "chat-1", Duration::from_secs(60))
}

fn events(raw: &[&str]) -> Script {
    Script::Events(raw.iter().map(|e| Ok((*e).to_owned())).collect())
}

const WORKSHEET_STREAM: &[&str] = &[
    r#"{"type":"start","messageId":"srv-1","flowType":"WORKSHEET_FLOW"}"#,
    r#"{"type":"status","phase":"research","status":"searching"}"#,
    r#"{"type":"text-delta","phase":"research","textDelta":"Plants "}"#,
    r#"{"type":"phase-complete","phase":"research"}"#,
    r#"{"type":"text-delta","phase":"generation","textDelta":"convert light."}"#,
    r#"{"type":"phase-complete","phase":"generation","worksheetTitle":"Light","executionSummary":{"steps":5}}"#,
    r#"{"type":"finish"}"#,
];

fn no_history() -> Arc<MockHistory> {
    MockHistory::new(Ok(Vec::new()))
}

// =========================================================================
// submit
// =========================================================================

#[tokio::test]
async fn submit_streams_until_terminal_phase_completes() {
    let transport = MockTransport::new(vec![events(WORKSHEET_STREAM)]);
    let mut session = session(transport.clone(), no_history());
    let mut rx = session.subscribe();

    let outcome = session.submit("Worksheet on photosynthesis from @biology-ch4.pdf").await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert!(rx.has_changed().unwrap());

    let conv = rx.borrow_and_update().clone();
    assert_eq!(conv.len(), 2);
    assert_eq!(conv.messages()[0].role, Role::User);
    let answer = &conv.messages()[1];
    assert_eq!(answer.message_id, MessageId::Server("srv-1".into()));
    assert_eq!(answer.content, "Plants convert light.");
    assert_eq!(answer.metadata, Some(json!({"steps": 5})));
    assert_eq!(conv.status(answer), MessageStatus::Complete);
    assert!(conv.streaming_id().is_none());

    let request = &transport.requests()[0];
    assert_eq!(request.user_id, "user-1");
    assert_eq!(request.chat_id, "chat-1");
    assert_eq!(request.context_files, vec!["biology-ch4.pdf".to_owned()]);
    assert!(session.notices().is_empty());
    assert!(session.latch().is_armed());
}

#[tokio::test]
async fn malformed_chunks_are_dropped_without_notice() {
    let transport = MockTransport::new(vec![events(&[
        r#"{"type":"text-delta","phase":"research","textDelta":"a"}"#,
        "not json",
        r#"{"type":"telepathy","phase":"research"}"#,
        r#"{"type":"search-query","phase":"research"}"#,
        r#"{"type":"text-delta","phase":"research","textDelta":"b"}"#,
    ])]);
    let mut session = session(transport, no_history());

    let outcome = session.submit("q").await.unwrap();
    assert_eq!(outcome, StreamOutcome::Ended);
    assert_eq!(session.messages()[1].content, "ab");
    assert_eq!(session.messages()[1].steps.len(), 2);
    assert!(session.notices().is_empty());
}

#[tokio::test]
async fn stream_ending_early_leaves_message_interrupted() {
    let transport = MockTransport::new(vec![events(&[
        r#"{"type":"text-delta","phase":"research","textDelta":"partial"}"#,
        r#"{"type":"finish"}"#,
    ])]);
    let mut session = session(transport, no_history());

    assert_eq!(session.submit("q").await.unwrap(), StreamOutcome::Ended);
    let conv = session.snapshot();
    assert_eq!(conv.status(&conv.messages()[1]), MessageStatus::Interrupted);
    assert!(session.notices().is_empty());
}

#[tokio::test]
async fn server_error_chunk_fails_stream_with_notice() {
    let transport = MockTransport::new(vec![events(&[
        r#"{"type":"text-delta","phase":"research","textDelta":"Plants"}"#,
        r#"{"type":"error","message":"model overloaded"}"#,
        r#"{"type":"text-delta","phase":"research","textDelta":" never"}"#,
    ])]);
    let mut session = session(transport, no_history());

    let outcome = session.submit("q").await.unwrap();
    assert_eq!(outcome, StreamOutcome::Failed(StreamError::Server("model overloaded".into())));

    let conv = session.snapshot();
    let answer = &conv.messages()[1];
    assert_eq!(answer.content, "Plants");
    assert_eq!(conv.status(answer), MessageStatus::Failed);
    assert_eq!(session.notices()[0].code, "E_AGENT_ERROR");
}

#[tokio::test]
async fn transport_error_keeps_partial_content() {
    let transport = MockTransport::new(vec![Script::Events(vec![
        Ok(r#"{"type":"token","content":"Hello "}"#.to_owned()),
        Err(StreamError::Transport("connection reset".into())),
    ])]);
    let mut session = session(transport, no_history());

    let outcome = session.submit("q").await.unwrap();
    assert!(matches!(outcome, StreamOutcome::Failed(StreamError::Transport(_))));
    assert_eq!(session.messages()[1].content, "Hello ");

    let notices = session.take_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].retryable);
    assert!(session.notices().is_empty());
}

#[tokio::test]
async fn refused_open_returns_error_and_raises_notice() {
    let transport = MockTransport::new(vec![Script::Refuse(StreamError::Status {
        status: 503,
        body: "busy".into(),
    })]);
    let mut session = session(transport, no_history());

    let err = session.submit("q").await.unwrap_err();
    assert_eq!(err, StreamError::Status { status: 503, body: "busy".into() });
    assert_eq!(session.notices()[0].code, "E_STREAM_STATUS");

    let conv = session.snapshot();
    assert_eq!(conv.len(), 2);
    assert_eq!(conv.status(&conv.messages()[1]), MessageStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn idle_stream_times_out() {
    let transport = MockTransport::new(vec![Script::Hang(vec![
        r#"{"type":"text-delta","phase":"research","textDelta":"Plants"}"#.to_owned(),
    ])]);
    let mut session = ChatSession::new(transport, no_history(), "t", "chat-1", Duration::from_secs(5));

    let outcome = session.submit("q").await.unwrap();
    assert_eq!(outcome, StreamOutcome::TimedOut);
    assert_eq!(session.notices()[0].code, "E_STREAM_IDLE_TIMEOUT");
    assert_eq!(session.notices()[0].message, "no event received for 5s");

    let conv = session.snapshot();
    assert_eq!(conv.messages()[1].content, "Plants");
    assert_eq!(conv.status(&conv.messages()[1]), MessageStatus::Interrupted);
}

#[tokio::test(start_paused = true)]
async fn stalled_open_times_out() {
    let transport = MockTransport::new(vec![Script::Stall]);
    let mut session = ChatSession::new(transport.clone(), no_history(), "t", "chat-1", Duration::from_secs(5));

    let outcome = tokio::time::timeout(Duration::from_secs(3600), session.submit("q"))
        .await
        .expect("submit must not hang while opening");
    assert_eq!(outcome.unwrap(), StreamOutcome::TimedOut);
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(session.notices()[0].code, "E_STREAM_IDLE_TIMEOUT");

    let conv = session.snapshot();
    assert!(conv.streaming_id().is_none());
    assert_eq!(conv.status(&conv.messages()[1]), MessageStatus::Interrupted);
}

#[tokio::test]
async fn declared_flow_wins_over_start_chunk() {
    let transport = MockTransport::new(vec![events(&[
        r#"{"type":"start","flowType":"worksheet"}"#,
        r#"{"type":"text-delta","phase":"doubt-clearance","textDelta":"Because of scattering."}"#,
        r#"{"type":"phase-complete","phase":"doubt-clearance"}"#,
    ])]);
    let mut session = session(transport.clone(), no_history());

    let outcome = session.submit_with_flow("why?", Some(FlowType::DoubtClearance)).await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(transport.requests()[0].flow_type, Some(FlowType::DoubtClearance));

    let answer = &session.messages()[1];
    assert_eq!(answer.flow(), Some(FlowType::DoubtClearance));
    assert!(answer.is_frozen());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_stream_without_error() {
    let transport = MockTransport::new(vec![Script::Hang(vec![
        r#"{"type":"text-delta","phase":"research","textDelta":"half"}"#.to_owned(),
    ])]);
    let mut session = session(transport, no_history());
    let handle = session.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
    });

    let outcome = session.submit("q").await.unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert!(session.notices().is_empty());

    let conv = session.snapshot();
    assert_eq!(conv.messages()[1].content, "half");
    assert_eq!(conv.status(&conv.messages()[1]), MessageStatus::Interrupted);
    assert!(!session.cancel_handle().is_cancelled());
}

#[tokio::test]
async fn cancel_before_submit_does_not_leak_into_next_stream() {
    let transport = MockTransport::new(vec![events(WORKSHEET_STREAM)]);
    let mut session = session(transport, no_history());
    session.cancel();

    assert_eq!(session.submit("q").await.unwrap(), StreamOutcome::Completed);
}

// =========================================================================
// history
// =========================================================================

fn stored_exchange() -> Vec<HistoryRecord> {
    let steps = vec![
        json!({"step": 0, "type": "start", "chunkData": {"messageId": "srv-1"}}),
        json!({"step": 1, "type": "text-delta", "phase": "research", "chunkData": {"textDelta": "Plants "}}),
        json!({"step": 2, "type": "text-delta", "phase": "generation", "chunkData": {"textDelta": "convert light."}}),
        json!({"step": 3, "type": "phase-complete", "phase": "generation", "chunkData": {}}),
    ];
    vec![
        HistoryRecord {
            message_id: Some("u-1".into()),
            message_type: Some("user".into()),
            user_message: Some(UserMessage { query: "q".into() }),
            agent_message: None,
        },
        HistoryRecord {
            message_id: Some("srv-1".into()),
            message_type: Some("agent".into()),
            user_message: None,
            agent_message: Some(AgentMessage { steps, flow_type: Some("worksheet".into()) }),
        },
    ]
}

#[tokio::test]
async fn history_fetch_is_skipped_once_after_local_append() {
    let history = MockHistory::new(Ok(stored_exchange()));
    let transport = MockTransport::new(vec![events(WORKSHEET_STREAM)]);
    let mut session = session(transport, history.clone());

    session.submit("q").await.unwrap();
    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Skipped);
    assert_eq!(history.calls(), 0);

    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Loaded { messages: 2 });
    assert_eq!(history.calls(), 1);

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_id, MessageId::Server("u-1".into()));
    assert_eq!(messages[1].message_id, MessageId::Server("srv-1".into()));
    assert_eq!(messages[1].content, "Plants convert light.");
    assert!(messages[1].is_frozen());
}

#[tokio::test]
async fn repeated_query_survives_stale_history() {
    let history = MockHistory::new(Ok(stored_exchange()));
    let transport = MockTransport::new(vec![events(&[
        r#"{"type":"start","messageId":"srv-2"}"#,
        r#"{"type":"text-delta","phase":"generation","textDelta":"new answer"}"#,
        r#"{"type":"phase-complete","phase":"generation"}"#,
    ])]);
    let mut session = session(transport, history);

    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Loaded { messages: 2 });
    assert_eq!(session.submit("q").await.unwrap(), StreamOutcome::Completed);
    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Skipped);
    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Loaded { messages: 4 });

    let messages = session.messages();
    let turns: Vec<_> = messages.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(
        turns,
        vec![
            (Role::User, "q"),
            (Role::Assistant, "Plants convert light."),
            (Role::User, "q"),
            (Role::Assistant, "new answer"),
        ]
    );
}

#[tokio::test]
async fn history_failure_empties_conversation() {
    let history = MockHistory::new(Err(HistoryError::Status { status: 500, body: String::new() }));
    let mut session = session(MockTransport::new(Vec::new()), history);
    session.set_messages(vec![ProcessedMessage::user(MessageId::local(), "draft")]);
    assert!(session.latch().is_armed());
    assert_eq!(session.load_history().await.unwrap(), HistoryLoad::Skipped);

    let err = session.load_history().await.unwrap_err();
    assert!(matches!(err, HistoryError::Status { status: 500, .. }));
    assert!(session.messages().is_empty());
    assert_eq!(session.notices()[0].code, "E_HISTORY_STATUS");
    assert!(session.notices()[0].retryable);
}

#[tokio::test]
async fn history_for_previous_chat_is_discarded() {
    let history = MockHistory::new(Ok(stored_exchange()));
    let mut session = session(MockTransport::new(Vec::new()), history);

    let batch = session.fetch_history().await;
    assert_eq!(batch.chat_id, "chat-1");
    session.switch_chat("chat-2");

    assert_eq!(session.apply_history(batch).unwrap(), HistoryLoad::Stale);
    assert_eq!(session.chat_id(), "chat-2");
    assert!(session.messages().is_empty());
}

#[tokio::test]
async fn switch_chat_resets_state_and_cancels() {
    let mut session = session(MockTransport::new(vec![events(WORKSHEET_STREAM)]), no_history());
    session.submit("q").await.unwrap();
    let old_handle = session.cancel_handle();

    session.switch_chat("chat-2");
    assert!(old_handle.is_cancelled());
    assert!(!session.cancel_handle().is_cancelled());
    assert!(!session.latch().is_armed());
    assert!(session.snapshot().is_empty());
}

#[test]
fn set_messages_dedups_and_arms_latch() {
    let mut session = session(MockTransport::new(Vec::new()), no_history());
    session.set_messages(vec![
        ProcessedMessage::user(MessageId::Server("u1".into()), "hi"),
        ProcessedMessage::user(MessageId::Server("u1".into()), "hi"),
        ProcessedMessage::user(MessageId::local(), "again"),
    ]);

    assert_eq!(session.messages().len(), 2);
    assert!(session.latch().is_armed());
}
