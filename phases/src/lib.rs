//! Phase accumulators folded from the agent chunk stream.
//!
//! Everything in this crate is pure. Folding the same ordered chunk sequence
//! always yields the same state, independent of timing or of where the
//! sequence was split, which is what lets live streaming and history replay
//! agree on what the UI shows.

use chunks::{Chunk, ChunkKind, FlowType, Phase, PhaseSummary};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_name: String,
    /// Chunk clock when present, otherwise the chunk's position in the message.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchPhaseState {
    pub statuses: Vec<String>,
    pub search_queries: Vec<String>,
    pub websites_researched: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub content: String,
    pub is_complete: bool,
}

impl ResearchPhaseState {
    pub fn apply(&mut self, chunk: &Chunk, seq: u64) {
        match &chunk.kind {
            ChunkKind::Status { status } => self.statuses.push(status.clone()),
            ChunkKind::SearchQuery { query } => push_query(&mut self.search_queries, query),
            ChunkKind::WebsiteVisited { url } => push_url(&mut self.websites_researched, url),
            ChunkKind::ToolCall { tool_name } => self.tool_calls.push(ToolCallRecord {
                tool_name: tool_name.clone(),
                timestamp: tool_timestamp(chunk, seq),
            }),
            ChunkKind::TextDelta { delta } => self.content.push_str(delta),
            ChunkKind::PhaseComplete(_) => self.is_complete = true,
            ChunkKind::Start { .. } | ChunkKind::Error { .. } | ChunkKind::Finish => {}
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPhaseState {
    pub statuses: Vec<String>,
    pub worksheet_title: Option<String>,
    pub content_length: Option<u64>,
    pub saved_successfully: Option<bool>,
    pub pdf_location: Option<String>,
    pub content: String,
    pub is_complete: bool,
}

impl GenerationPhaseState {
    pub fn apply(&mut self, chunk: &Chunk, _seq: u64) {
        match &chunk.kind {
            ChunkKind::Status { status } => self.statuses.push(status.clone()),
            ChunkKind::TextDelta { delta } => self.content.push_str(delta),
            ChunkKind::PhaseComplete(summary) => {
                self.is_complete = true;
                self.copy_summary(summary);
            }
            _ => {}
        }
    }

    fn copy_summary(&mut self, summary: &PhaseSummary) {
        if let Some(title) = &summary.worksheet_title {
            self.worksheet_title = Some(title.clone());
        }
        if let Some(length) = summary.content_length {
            self.content_length = Some(length);
        }
        if let Some(saved) = summary.saved_successfully {
            self.saved_successfully = Some(saved);
        }
        if let Some(location) = &summary.pdf_location {
            self.pdf_location = Some(location.clone());
        }
    }
}

/// Accumulator for a doubt-clearance flow.
///
/// Research-tagged chunks of the same flow land here too: their text becomes
/// `research_findings`, everything else becomes `final_answer`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubtClearanceState {
    pub statuses: Vec<String>,
    pub search_queries: Vec<String>,
    pub websites_researched: Vec<String>,
    pub research_findings: Option<String>,
    pub final_answer: Option<String>,
    pub tool_call_count: usize,
    pub research_complete: bool,
    pub is_complete: bool,
}

impl DoubtClearanceState {
    pub fn apply(&mut self, chunk: &Chunk, _seq: u64) {
        let researching = chunk.phase == Some(Phase::Research);
        match &chunk.kind {
            ChunkKind::Status { status } => self.statuses.push(status.clone()),
            ChunkKind::SearchQuery { query } => push_query(&mut self.search_queries, query),
            ChunkKind::WebsiteVisited { url } => push_url(&mut self.websites_researched, url),
            ChunkKind::ToolCall { .. } => self.tool_call_count += 1,
            ChunkKind::TextDelta { delta } if researching => self
                .research_findings
                .get_or_insert_with(String::new)
                .push_str(delta),
            ChunkKind::TextDelta { delta } => self
                .final_answer
                .get_or_insert_with(String::new)
                .push_str(delta),
            ChunkKind::PhaseComplete(_) if researching => self.research_complete = true,
            ChunkKind::PhaseComplete(summary) => {
                self.is_complete = true;
                if let Some(answer) = &summary.final_answer {
                    self.final_answer = Some(answer.clone());
                }
            }
            ChunkKind::Start { .. } | ChunkKind::Error { .. } | ChunkKind::Finish => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "kebab-case")]
pub enum PhaseState {
    Research(ResearchPhaseState),
    Generation(GenerationPhaseState),
    DoubtClearance(DoubtClearanceState),
}

impl PhaseState {
    #[must_use]
    pub fn empty(phase: Phase) -> Self {
        match phase {
            Phase::Research => Self::Research(ResearchPhaseState::default()),
            Phase::Generation => Self::Generation(GenerationPhaseState::default()),
            Phase::DoubtClearance => Self::DoubtClearance(DoubtClearanceState::default()),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Research(_) => Phase::Research,
            Self::Generation(_) => Phase::Generation,
            Self::DoubtClearance(_) => Phase::DoubtClearance,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Research(s) => s.is_complete,
            Self::Generation(s) => s.is_complete,
            Self::DoubtClearance(s) => s.is_complete,
        }
    }

    #[must_use]
    pub fn statuses(&self) -> &[String] {
        match self {
            Self::Research(s) => &s.statuses,
            Self::Generation(s) => &s.statuses,
            Self::DoubtClearance(s) => &s.statuses,
        }
    }

    /// The latest status line, shown as "current activity".
    #[must_use]
    pub fn current_status(&self) -> Option<&str> {
        self.statuses().last().map(String::as_str)
    }

    pub fn apply(&mut self, chunk: &Chunk, seq: u64) {
        match self {
            Self::Research(s) => s.apply(chunk, seq),
            Self::Generation(s) => s.apply(chunk, seq),
            Self::DoubtClearance(s) => s.apply(chunk, seq),
        }
    }
}

/// Fold one chunk into a phase state.
///
/// `seq` is the chunk's position within its message and stands in for the
/// tool-call timestamp when the chunk carries no clock of its own.
#[must_use]
pub fn fold(mut state: PhaseState, chunk: &Chunk, seq: u64) -> PhaseState {
    state.apply(chunk, seq);
    state
}

/// Where a message is in its phase lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "kebab-case")]
pub enum PhaseCursor {
    /// No phase-tagged chunk seen yet.
    #[default]
    Idle,
    /// The most recent phase-tagged chunk named this phase.
    Active(Phase),
    /// The flow's terminal phase completed. Absorbing.
    Complete,
}

/// Effect of a single [`PhaseTracker::apply`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The chunk changed nothing (control chunk, untagged, or already complete).
    Ignored,
    /// The chunk was folded into an accumulator.
    Folded,
    /// The chunk completed the flow's terminal phase.
    Completed,
}

/// Per-message phase state machine plus one accumulator per phase seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTracker {
    flow: FlowType,
    #[serde(skip)]
    pinned: bool,
    cursor: PhaseCursor,
    phases: Vec<PhaseState>,
}

impl PhaseTracker {
    #[must_use]
    pub fn new(flow: FlowType) -> Self {
        Self { flow, pinned: false, cursor: PhaseCursor::Idle, phases: Vec::new() }
    }

    /// A tracker whose flow was declared up front; `start` chunks cannot change it.
    #[must_use]
    pub fn pinned(flow: FlowType) -> Self {
        Self { pinned: true, ..Self::new(flow) }
    }

    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.flow
    }

    /// Change the flow while nothing has been folded yet.
    ///
    /// Returns whether the tracker now runs `flow`. Pinned trackers and
    /// trackers that already folded a phase-tagged chunk keep their flow.
    pub fn set_flow(&mut self, flow: FlowType) -> bool {
        if self.pinned || self.cursor != PhaseCursor::Idle || !self.phases.is_empty() {
            return self.flow == flow;
        }
        self.flow = flow;
        true
    }

    #[must_use]
    pub fn cursor(&self) -> PhaseCursor {
        self.cursor
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cursor == PhaseCursor::Complete
    }

    /// Accumulators in first-seen order.
    #[must_use]
    pub fn phases(&self) -> &[PhaseState] {
        &self.phases
    }

    /// Phases with an accumulator, in first-seen order.
    #[must_use]
    pub fn seen_phases(&self) -> Vec<Phase> {
        self.phases.iter().map(PhaseState::phase).collect()
    }

    /// The accumulator that receives chunks tagged `phase` in this flow.
    #[must_use]
    pub fn accumulator_for(&self, phase: Phase) -> Phase {
        match (self.flow, phase) {
            (FlowType::DoubtClearance, Phase::Research) => Phase::DoubtClearance,
            (_, phase) => phase,
        }
    }

    /// Accumulator currently receiving chunks, if any.
    #[must_use]
    pub fn active(&self) -> Option<&PhaseState> {
        match self.cursor {
            PhaseCursor::Active(phase) => self.state(self.accumulator_for(phase)),
            PhaseCursor::Idle | PhaseCursor::Complete => None,
        }
    }

    #[must_use]
    pub fn state(&self, accumulator: Phase) -> Option<&PhaseState> {
        self.phases.iter().find(|s| s.phase() == accumulator)
    }

    #[must_use]
    pub fn research(&self) -> Option<&ResearchPhaseState> {
        match self.state(Phase::Research) {
            Some(PhaseState::Research(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn generation(&self) -> Option<&GenerationPhaseState> {
        match self.state(Phase::Generation) {
            Some(PhaseState::Generation(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn doubt_clearance(&self) -> Option<&DoubtClearanceState> {
        match self.state(Phase::DoubtClearance) {
            Some(PhaseState::DoubtClearance(s)) => Some(s),
            _ => None,
        }
    }

    /// Fold one chunk, advancing the state machine.
    pub fn apply(&mut self, chunk: &Chunk, seq: u64) -> Transition {
        if self.cursor == PhaseCursor::Complete {
            return Transition::Ignored;
        }
        if let ChunkKind::Start { flow_type: Some(flow) } = chunk.kind {
            self.set_flow(flow);
        }
        let Some(phase) = chunk.phase else {
            return Transition::Ignored;
        };

        let accumulator = self.accumulator_for(phase);
        let index = match self.phases.iter().position(|s| s.phase() == accumulator) {
            Some(index) => index,
            None => {
                self.phases.push(PhaseState::empty(accumulator));
                self.phases.len() - 1
            }
        };
        self.phases[index].apply(chunk, seq);
        self.cursor = PhaseCursor::Active(phase);

        if matches!(chunk.kind, ChunkKind::PhaseComplete(_)) && phase == self.flow.terminal_phase() {
            self.cursor = PhaseCursor::Complete;
            return Transition::Completed;
        }
        Transition::Folded
    }

    /// Fold a run of chunks whose first element sits at position `start_seq`.
    pub fn extend<'a>(&mut self, chunks: impl IntoIterator<Item = &'a Chunk>, start_seq: u64) {
        for (seq, chunk) in (start_seq..).zip(chunks) {
            self.apply(chunk, seq);
        }
    }
}

/// Fold a whole ordered chunk sequence from the empty initial state.
#[must_use]
pub fn fold_all<'a>(flow: FlowType, chunks: impl IntoIterator<Item = &'a Chunk>) -> PhaseTracker {
    let mut tracker = PhaseTracker::new(flow);
    tracker.extend(chunks, 0);
    tracker
}

fn push_query(list: &mut Vec<String>, query: &str) {
    if list.last().map(String::as_str) != Some(query) {
        list.push(query.to_owned());
    }
}

fn push_url(list: &mut Vec<String>, url: &str) {
    if !list.iter().any(|seen| seen == url) {
        list.push(url.to_owned());
    }
}

fn tool_timestamp(chunk: &Chunk, seq: u64) -> i64 {
    chunk
        .timestamp
        .unwrap_or_else(|| i64::try_from(seq).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
