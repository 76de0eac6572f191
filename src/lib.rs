pub mod artifact;
pub mod calibration;
pub mod checks;
pub mod config;
pub mod detection;
pub mod error;
pub mod orchestrator;
pub mod providers;
pub mod scenario;
pub mod suite;
pub mod tools;
pub mod types;

mod persist;

pub use artifact::{
    GateDecision, GateReason, ModelSettings, Provenance, RunArtifact, RunEvent, RunEventKind,
    RuntimeSummary, TerminationReason, ToolCallRecord, TranscriptEntry,
};
pub use calibration::{
    base_confidence, blended_confidence, clause_base_confidence, PatternHistory,
    PatternHistoryEntry, PatternHistoryStore, PatternObservation,
};
pub use checks::{
    apply_judge_overlay, evaluate_run, CheckKind, CheckResult, Judge, JudgeDecision,
    RunEvaluation,
};
pub use config::HarnessConfig;
pub use detection::{
    ArtifactView, ClauseEvaluationResult, ClauseObservation, ClauseRegistry, DetectionEngine,
    MacroTable, TurnWindow, UnsupportedClauseReport,
};
pub use error::{HarnessError, LLMError};
pub use orchestrator::{CancellationFlag, Orchestrator};
pub use providers::{
    scripted::{ScriptedProvider, ScriptedTurn},
    LLMProvider,
};
pub use scenario::{load_scenario, load_scenarios, Scenario};
pub use suite::{SuiteJob, SuiteOutcome, SuiteRunner};
pub use tools::{FixtureToolExecutor, Tool, ToolCall, ToolExecutor, ToolOutcome};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
