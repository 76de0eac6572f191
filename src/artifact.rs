use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{error::HarnessError, persist, scenario::Scenario, tools::ToolCall, types::MessageRole};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where a transcript entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Scenario,
    InjectedSystemRule,
    Model,
    Tool,
    DynamicEvent,
    SimulatedUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub index: usize,
    pub turn: usize,
    pub role: MessageRole,
    pub content: String,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Allowed,
    Forbidden,
    BudgetExceeded,
    Unlisted,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::Allowed => "allowed",
            GateReason::Forbidden => "forbidden",
            GateReason::BudgetExceeded => "budget_exceeded",
            GateReason::Unlisted => "unlisted",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GateReason::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub tool_call_id: String,
    pub tool: String,
    pub allowed: bool,
    pub reason: GateReason,
    pub turn: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Value,
    pub success: bool,
    pub executed: bool,
    pub forbidden: bool,
    pub gate_reason: GateReason,
    pub turn: usize,
}

impl ToolCallRecord {
    /// A call the model just asked for, before it is gated or executed. Only
    /// name, arguments and turn are meaningful.
    pub(crate) fn requested(call: &ToolCall, turn: usize) -> Self {
        Self {
            id: call.id.clone().unwrap_or_default(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: Value::Null,
            success: false,
            executed: false,
            forbidden: false,
            gate_reason: GateReason::Unlisted,
            turn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ModelError,
    Cancelled,
    MaxTurns,
    StopCondition,
    NoToolCalls,
    CounterpartExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted {
        scenario_id: String,
    },
    ModelRequest {
        message_count: usize,
    },
    ModelResponse {
        tool_calls: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    GateDecision {
        tool: String,
        reason: GateReason,
    },
    ToolExecuted {
        tool: String,
        success: bool,
    },
    DynamicEventFired {
        rule_id: String,
    },
    ToolsRestricted {
        rule_id: String,
        denied: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allow_only: Option<Vec<String>>,
    },
    MessageInjected {
        rule_id: String,
        role: MessageRole,
    },
    StopCondition {
        condition: String,
    },
    CounterpartReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        remaining: usize,
    },
    Cancelled,
    Error {
        message: String,
    },
    RunFinished {
        reason: TerminationReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub turn: usize,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ModelSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, value: f32) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn with_seed(mut self, value: u64) -> Self {
        self.seed = Some(value);
        self
    }

    pub fn with_max_tokens(mut self, value: u32) -> Self {
        self.max_tokens = Some(value);
        self
    }

    pub fn with_timeout_ms(mut self, value: u64) -> Self {
        self.timeout_ms = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSummary {
    /// Allow-set after every dynamic-event restriction.
    pub effective_allowed_tools: BTreeSet<String>,
    /// Deny-set after every dynamic-event restriction.
    pub effective_forbidden_tools: BTreeSet<String>,
    pub turns: usize,
    pub tool_calls: usize,
    pub blocked_tool_calls: usize,
    pub counterpart_replies: usize,
    pub fired_events: Vec<String>,
    pub termination: TerminationReason,
}

/// The frozen record of one scenario execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run_id: String,
    pub scenario_id: String,
    pub scenario_version: String,
    #[serde(default)]
    pub knobs: BTreeMap<String, String>,
    pub provider: String,
    pub model: ModelSettings,
    pub transcript: Vec<TranscriptEntry>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub gate_decisions: Vec<GateDecision>,
    pub events: Vec<RunEvent>,
    pub summary: RuntimeSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl RunArtifact {
    pub fn assistant_messages(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.transcript
            .iter()
            .filter(|entry| entry.role == MessageRole::Assistant)
    }

    pub fn events_of<'a>(
        &'a self,
        pred: impl Fn(&RunEventKind) -> bool + 'a,
    ) -> impl Iterator<Item = &'a RunEvent> + 'a {
        self.events.iter().filter(move |event| pred(&event.kind))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| HarnessError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| HarnessError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes `<dir>/<run_id>.json` atomically and returns the path.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, HarnessError> {
        let path = dir.as_ref().join(format!("{}.json", self.run_id));
        persist::atomic_write_json(&path, self)?;
        Ok(path)
    }
}

pub(crate) fn new_run_id(scenario_id: &str, model: &str) -> String {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(scenario_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(model.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(RUN_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}-{}", now.format("%Y%m%dT%H%M%SZ"), sanitize(scenario_id), suffix)
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Mutable builder owned by exactly one active run. Converted into a
/// [`RunArtifact`] when the run reaches a terminal state.
pub(crate) struct RunRecorder {
    run_id: String,
    scenario_id: String,
    scenario_version: String,
    knobs: BTreeMap<String, String>,
    provider: String,
    model: ModelSettings,
    pub(crate) transcript: Vec<TranscriptEntry>,
    pub(crate) tool_calls: Vec<ToolCallRecord>,
    pub(crate) gate_decisions: Vec<GateDecision>,
    events: Vec<RunEvent>,
    error: Option<String>,
    start_time: DateTime<Utc>,
    next_seq: u64,
}

impl RunRecorder {
    pub(crate) fn new(scenario: &Scenario, provider: &str, model: ModelSettings) -> Self {
        Self {
            run_id: new_run_id(&scenario.id, &model.model),
            scenario_id: scenario.id.clone(),
            scenario_version: scenario.version.clone(),
            knobs: scenario.knobs.clone(),
            provider: provider.to_string(),
            model,
            transcript: Vec::new(),
            tool_calls: Vec::new(),
            gate_decisions: Vec::new(),
            events: Vec::new(),
            error: None,
            start_time: Utc::now(),
            next_seq: 0,
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn push_message(
        &mut self,
        turn: usize,
        role: MessageRole,
        content: impl Into<String>,
        provenance: Provenance,
    ) -> &TranscriptEntry {
        self.push_entry(turn, role, content.into(), provenance, None)
    }

    pub(crate) fn push_tool_result(
        &mut self,
        turn: usize,
        tool_call_id: &str,
        content: String,
    ) -> &TranscriptEntry {
        self.push_entry(
            turn,
            MessageRole::Tool,
            content,
            Provenance::Tool,
            Some(tool_call_id.to_string()),
        )
    }

    fn push_entry(
        &mut self,
        turn: usize,
        role: MessageRole,
        content: String,
        provenance: Provenance,
        tool_call_id: Option<String>,
    ) -> &TranscriptEntry {
        let index = self.transcript.len();
        self.transcript.push(TranscriptEntry {
            index,
            turn,
            role,
            content,
            provenance,
            tool_call_id,
        });
        &self.transcript[index]
    }

    pub(crate) fn event(&mut self, turn: usize, kind: RunEventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(RunEvent {
            seq,
            timestamp: Utc::now(),
            turn,
            kind,
        });
    }

    pub(crate) fn set_error(&mut self, turn: usize, message: String) {
        self.event(
            turn,
            RunEventKind::Error {
                message: message.clone(),
            },
        );
        self.error = Some(message);
    }

    pub(crate) fn finish(mut self, turn: usize, summary: RuntimeSummary) -> RunArtifact {
        self.event(
            turn,
            RunEventKind::RunFinished {
                reason: summary.termination,
            },
        );
        RunArtifact {
            run_id: self.run_id,
            scenario_id: self.scenario_id,
            scenario_version: self.scenario_version,
            knobs: self.knobs,
            provider: self.provider,
            model: self.model,
            transcript: self.transcript,
            tool_calls: self.tool_calls,
            gate_decisions: self.gate_decisions,
            events: self.events,
            summary,
            error: self.error,
            start_time: self.start_time,
            end_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_filesystem_safe() {
        let a = new_run_id("bank/transfer v2", "model");
        let b = new_run_id("bank/transfer v2", "model");
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn event_kind_serializes_flat() {
        let event = RunEvent {
            seq: 3,
            timestamp: Utc::now(),
            turn: 2,
            kind: RunEventKind::GateDecision {
                tool: "send_email".to_string(),
                reason: GateReason::BudgetExceeded,
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "gate_decision");
        assert_eq!(value["reason"], "budget_exceeded");
        let back: RunEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }
}
