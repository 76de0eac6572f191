//! Grades a finished run against its scenario's declarative rules.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    artifact::RunArtifact,
    calibration::{blended_confidence, PatternHistory, PatternObservation},
    detection::{
        aggregate_unsupported, view::ArtifactView, ClauseEvaluationResult, DetectionEngine,
        TurnWindow, UnsupportedClauseReport,
    },
    error::HarnessError,
    persist,
    scenario::{Scenario, Severity},
    types::MessageRole,
};

/// Id of the synthetic check listing every unsupported clause of a run.
pub const UNSUPPORTED_CHECK_ID: &str = "unsupported_clauses";

const EXCERPT_LIMIT: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    SuccessCriterion,
    FailureMode,
    TurnAssertion,
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub kind: CheckKind,
    pub expression: String,
    /// `None` when the expression could not be evaluated.
    pub passed: Option<bool>,
    pub matched: bool,
    pub applicable: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported_clauses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TurnWindow>,
    /// Set when a judge upgraded a deterministic failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_rationale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvaluation {
    pub run_id: String,
    pub scenario_id: String,
    pub checks: Vec<CheckResult>,
    pub unsupported: UnsupportedClauseReport,
    #[serde(default)]
    pub observations: Vec<PatternObservation>,
}

impl RunEvaluation {
    pub fn check(&self, id: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|check| check.id == id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|check| check.passed == Some(false))
    }

    pub fn not_applicable(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|check| check.passed.is_none())
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed == Some(true))
    }

    /// Writes `<dir>/<run_id>.checks.json` next to the run artifact.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf, HarnessError> {
        let path = dir.as_ref().join(format!("{}.checks.json", self.run_id));
        persist::atomic_write_json(&path, self)?;
        Ok(path)
    }
}

struct Pending {
    id: String,
    kind: CheckKind,
    expression: String,
    result: ClauseEvaluationResult,
    passed: Option<bool>,
    severity: Option<Severity>,
    weight: Option<f64>,
    window: Option<TurnWindow>,
}

/// Evaluates success criteria, failure modes and turn assertions, attaches
/// calibrated confidence and derives the calibration observations of the run.
pub fn evaluate_run(
    engine: &DetectionEngine,
    scenario: &Scenario,
    artifact: &RunArtifact,
    history: &PatternHistory,
) -> RunEvaluation {
    let macros = engine.macros().merged(&scenario.macros);
    let view = ArtifactView::of(artifact);
    let mut pending = Vec::new();

    for criterion in &scenario.success_criteria {
        let result = engine.parse_with(&criterion.condition, &macros).evaluate(&view);
        pending.push(Pending {
            id: criterion.id.clone(),
            kind: CheckKind::SuccessCriterion,
            expression: criterion.condition.clone(),
            passed: result.applicable.then_some(result.matched),
            result,
            severity: None,
            weight: Some(criterion.weight),
            window: None,
        });
    }

    for mode in &scenario.failure_modes {
        let result = engine.parse_with(&mode.condition, &macros).evaluate(&view);
        pending.push(Pending {
            id: mode.id.clone(),
            kind: CheckKind::FailureMode,
            expression: mode.condition.clone(),
            passed: result.applicable.then_some(!result.matched),
            result,
            severity: Some(mode.severity),
            weight: None,
            window: None,
        });
    }

    for assertion in &scenario.turn_assertions {
        let window = TurnWindow::new(assertion.turn_start, assertion.turn_end, assertion.role);
        let result = engine
            .parse_with(&assertion.condition, &macros)
            .evaluate(&view.windowed(window));
        pending.push(Pending {
            id: assertion.id.clone(),
            kind: CheckKind::TurnAssertion,
            expression: assertion.condition.clone(),
            passed: result
                .applicable
                .then_some(result.matched == assertion.expect),
            result,
            severity: None,
            weight: None,
            window: Some(window),
        });
    }

    let unsupported = aggregate_unsupported(pending.iter().map(|p| &p.result));
    let unsupported_count = unsupported.clauses.len();
    if !unsupported.is_empty() {
        warn!(
            run_id = %artifact.run_id,
            count = unsupported_count,
            clauses = ?unsupported.clauses,
            "run touched unsupported detection clauses"
        );
    }

    let mut observations = Vec::new();
    let mut checks = Vec::with_capacity(pending.len() + 1);
    for p in pending {
        let confidence = calibrated(&p.result, history, unsupported_count);
        for obs in &p.result.observations {
            observations.push(PatternObservation {
                clause_type: obs.clause_type.clone(),
                pattern: obs.pattern.clone(),
                matched: obs.matched,
                applicable: obs.applicable,
                ground_truth: p.result.matched,
                unsupported_in_expression: p.result.has_unsupported(),
            });
        }
        debug!(check = %p.id, passed = ?p.passed, confidence, "check evaluated");
        checks.push(CheckResult {
            id: p.id,
            kind: p.kind,
            expression: p.expression,
            passed: p.passed,
            matched: p.result.matched,
            applicable: p.result.applicable,
            confidence,
            unsupported_clauses: p.result.unsupported_clauses,
            severity: p.severity,
            weight: p.weight,
            window: p.window,
            judge_rationale: None,
        });
    }

    checks.push(CheckResult {
        id: UNSUPPORTED_CHECK_ID.to_string(),
        kind: CheckKind::Diagnostic,
        expression: String::new(),
        passed: Some(unsupported.is_empty()),
        matched: !unsupported.is_empty(),
        applicable: true,
        confidence: 1.0,
        unsupported_clauses: unsupported.clauses.clone(),
        severity: (!unsupported.is_empty()).then_some(Severity::High),
        weight: None,
        window: None,
        judge_rationale: None,
    });

    RunEvaluation {
        run_id: artifact.run_id.clone(),
        scenario_id: artifact.scenario_id.clone(),
        checks,
        unsupported,
        observations,
    }
}

/// Lowest blended confidence over the expression's clauses; zero when it could
/// not be evaluated.
fn calibrated(result: &ClauseEvaluationResult, history: &PatternHistory, unsupported_count: usize) -> f64 {
    if !result.applicable {
        return 0.0;
    }
    result
        .observations
        .iter()
        .map(|obs| {
            blended_confidence(
                &obs.pattern,
                &obs.clause_type,
                history.entry(&obs.clause_type, &obs.pattern),
                unsupported_count,
            )
        })
        .reduce(f64::min)
        .unwrap_or(result.confidence)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeDecision {
    Keep,
    Upgrade { rationale: String },
}

/// Second opinion on checks the deterministic engine failed.
pub trait Judge: Send + Sync {
    fn reconsider(&self, check: &CheckResult, transcript_excerpt: &str) -> JudgeDecision;
}

impl<F> Judge for F
where
    F: Fn(&CheckResult, &str) -> JudgeDecision + Send + Sync,
{
    fn reconsider(&self, check: &CheckResult, transcript_excerpt: &str) -> JudgeDecision {
        self(check, transcript_excerpt)
    }
}

/// Offers every failed, non-diagnostic check to `judge`. Only failures can be
/// upgraded; passing and inapplicable checks are never shown to the judge.
/// Returns the number of upgraded checks.
pub fn apply_judge_overlay(
    evaluation: &mut RunEvaluation,
    artifact: &RunArtifact,
    judge: &dyn Judge,
) -> usize {
    let mut upgraded = 0;
    for check in evaluation.checks.iter_mut() {
        if check.passed != Some(false) || check.kind == CheckKind::Diagnostic {
            continue;
        }
        let excerpt = excerpt(artifact, check.window);
        if let JudgeDecision::Upgrade { rationale } = judge.reconsider(check, &excerpt) {
            debug!(check = %check.id, %rationale, "judge upgraded failed check");
            check.passed = Some(true);
            check.judge_rationale = Some(rationale);
            upgraded += 1;
        }
    }
    upgraded
}

fn excerpt(artifact: &RunArtifact, window: Option<TurnWindow>) -> String {
    let view = match window {
        Some(window) => ArtifactView::of(artifact).windowed(window),
        None => ArtifactView::of(artifact),
    };
    let role = window.map_or(MessageRole::Assistant, |w| w.role);
    let mut text = String::new();
    for entry in view.responses() {
        text.push_str(&format!("[{} t{}] {}\n", role.as_str(), entry.turn, entry.content));
        if text.len() >= EXCERPT_LIMIT {
            let mut cut = EXCERPT_LIMIT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            break;
        }
    }
    text
}
