use serde::{Deserialize, Serialize};

use crate::{
    artifact::{RunArtifact, ToolCallRecord, TranscriptEntry},
    types::MessageRole,
};

/// Inclusive turn range plus the role whose messages a windowed assertion inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnWindow {
    pub turn_start: usize,
    pub turn_end: usize,
    pub role: MessageRole,
}

impl TurnWindow {
    pub fn new(turn_start: usize, turn_end: usize, role: MessageRole) -> Self {
        Self {
            turn_start,
            turn_end,
            role,
        }
    }

    pub fn contains(&self, turn: usize) -> bool {
        (self.turn_start..=self.turn_end).contains(&turn)
    }
}

/// Read-only slice of a run that clauses evaluate against. Built from a frozen
/// [`RunArtifact`] or from the in-progress records of a running conversation.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactView<'a> {
    transcript: &'a [TranscriptEntry],
    tool_calls: &'a [ToolCallRecord],
    window: Option<TurnWindow>,
}

impl<'a> ArtifactView<'a> {
    pub fn new(transcript: &'a [TranscriptEntry], tool_calls: &'a [ToolCallRecord]) -> Self {
        Self {
            transcript,
            tool_calls,
            window: None,
        }
    }

    pub fn of(artifact: &'a RunArtifact) -> Self {
        Self::new(&artifact.transcript, &artifact.tool_calls)
    }

    pub fn windowed(mut self, window: TurnWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn window(&self) -> Option<TurnWindow> {
        self.window
    }

    fn role(&self) -> MessageRole {
        self.window.map_or(MessageRole::Assistant, |w| w.role)
    }

    fn in_window(&self, turn: usize) -> bool {
        self.window.map_or(true, |w| w.contains(turn))
    }

    /// Entries that `response ...` clauses inspect: assistant messages, or the
    /// window's role when windowed.
    pub fn responses(&self) -> impl Iterator<Item = &'a TranscriptEntry> + '_ {
        let role = self.role();
        self.transcript
            .iter()
            .filter(move |entry| entry.role == role && self.in_window(entry.turn))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &'a ToolCallRecord> + '_ {
        self.tool_calls
            .iter()
            .filter(move |call| self.in_window(call.turn))
    }

    /// Response contents joined in transcript order.
    pub fn response_text(&self) -> String {
        self.responses()
            .map(|entry| entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_responses(&self) -> bool {
        self.responses().next().is_some()
    }
}
