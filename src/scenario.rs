use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::HarnessError, types::MessageRole};

/// A scripted pressure scenario: opening messages, tool policy, conversation
/// policy and the declarative rules the resulting transcript is graded against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form tags describing the pressure conditions of the scenario.
    #[serde(default)]
    pub knobs: BTreeMap<String, String>,
    pub opening_messages: Vec<ScenarioMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
    /// Maximum number of tool calls per run; `None` is unlimited.
    #[serde(default)]
    pub tool_budget: Option<usize>,
    #[serde(default)]
    pub conversation: ConversationPolicy,
    #[serde(default)]
    pub dynamic_events: Vec<DynamicEventRule>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub failure_modes: Vec<FailureMode>,
    #[serde(default)]
    pub turn_assertions: Vec<TurnAssertion>,
    /// Scenario-local macros, merged over the harness-wide table.
    #[serde(default)]
    pub macros: BTreeMap<String, String>,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpeningRole {
    System,
    User,
    Assistant,
    /// Sent to the model as a system message, tracked separately in the transcript.
    InjectedSystemRule,
}

impl OpeningRole {
    pub fn model_role(self) -> MessageRole {
        match self {
            OpeningRole::System | OpeningRole::InjectedSystemRule => MessageRole::System,
            OpeningRole::User => MessageRole::User,
            OpeningRole::Assistant => MessageRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioMessage {
    pub role: OpeningRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub fixtures: Vec<ToolFixture>,
    #[serde(default)]
    pub default: Option<ToolResultSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFixture {
    pub when: Value,
    pub then: ToolResultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultSpec {
    Ok { value: Value },
    Err { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPolicy {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub turn_policy: TurnPolicy,
    /// YAML writes these as single-key maps (`- turn_count_gte: 3`).
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub stop_conditions: Vec<StopCondition>,
    #[serde(default)]
    pub user_mode: UserMode,
    #[serde(default)]
    pub simulated_user: Option<SimulatedUserConfig>,
}

fn default_max_turns() -> usize {
    8
}

impl Default for ConversationPolicy {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            turn_policy: TurnPolicy::default(),
            stop_conditions: Vec::new(),
            user_mode: UserMode::default(),
            simulated_user: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Tool results are fed back and the model keeps going until a terminal condition.
    #[default]
    ToolLoop,
    /// Exactly one model turn; tool calls are still gated and recorded.
    SingleTurn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    TurnCountGte(usize),
    AssistantResponseContains(String),
    ToolCallCountGte(usize),
    /// A detection expression over the artifact so far.
    Expression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    #[default]
    None,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedUserConfig {
    #[serde(default = "default_max_replies")]
    pub max_replies: usize,
    #[serde(default = "default_reply")]
    pub default_reply: String,
    #[serde(default)]
    pub rules: Vec<CounterpartRule>,
}

fn default_max_replies() -> usize {
    3
}

fn default_reply() -> String {
    "Please continue.".to_string()
}

impl Default for SimulatedUserConfig {
    fn default() -> Self {
        Self {
            max_replies: default_max_replies(),
            default_reply: default_reply(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterpartRule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "match", with = "serde_yaml::with::singleton_map")]
    pub matcher: ReplyMatch,
    pub reply: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub once: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMatch {
    Contains(String),
    Regex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicEventRule {
    pub id: String,
    pub trigger: String,
    pub actions: Vec<EventAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_once")]
    pub once: bool,
}

fn default_once() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAction {
    InjectMessage {
        role: MessageRole,
        content: String,
    },
    RestrictTools {
        #[serde(default)]
        deny: Vec<String>,
        #[serde(default)]
        allow_only: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMode {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: String,
    #[serde(default)]
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnAssertion {
    pub id: String,
    pub turn_start: usize,
    pub turn_end: usize,
    #[serde(default = "default_assertion_role")]
    pub role: MessageRole,
    pub condition: String,
    /// Expected outcome of `condition` inside the window.
    #[serde(default = "default_expect")]
    pub expect: bool,
}

fn default_assertion_role() -> MessageRole {
    MessageRole::Assistant
}

fn default_expect() -> bool {
    true
}

impl Scenario {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Effective turn limit given a caller-supplied cap.
    pub fn turn_limit(&self, max_turns: usize) -> usize {
        let scenario_limit = match self.conversation.turn_policy {
            TurnPolicy::ToolLoop => self.conversation.max_turns,
            TurnPolicy::SingleTurn => 1,
        };
        max_turns.min(scenario_limit)
    }

    /// Structural checks that do not need a JSON schema.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |message: String| HarnessError::InvalidScenario {
            id: self.id.clone(),
            message,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.opening_messages.is_empty() {
            return Err(invalid("at least one opening message is required".to_string()));
        }
        if self.conversation.max_turns == 0 {
            return Err(invalid("conversation.max_turns must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for rule in &self.dynamic_events {
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate dynamic event id: {}", rule.id)));
            }
            if rule.actions.is_empty() {
                return Err(invalid(format!("dynamic event {} has no actions", rule.id)));
            }
        }

        for assertion in &self.turn_assertions {
            if assertion.turn_start > assertion.turn_end {
                return Err(invalid(format!(
                    "turn assertion {} has turn_start > turn_end",
                    assertion.id
                )));
            }
        }

        for name in &self.allowed_tools {
            if self.forbidden_tools.contains(name) {
                tracing::warn!(scenario = %self.id, tool = %name, "tool is both allowed and forbidden; forbidden wins");
            }
        }
        Ok(())
    }
}

pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario, HarnessError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| HarnessError::io(path, e))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let scenario: Scenario = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|source| HarnessError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml::from_slice(&bytes).map_err(|source| HarnessError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };
    scenario.validate()?;
    Ok(scenario)
}

/// Loads a single scenario file or every `.yaml`/`.yml`/`.json` file in a directory,
/// sorted by scenario id.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<Scenario>, HarnessError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Ok(vec![load_scenario(path)?]);
    }

    let mut scenarios = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| HarnessError::io(path, e))? {
        let entry = entry.map_err(|e| HarnessError::io(path, e))?;
        let p = entry.path();
        let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
        if matches!(ext, "yaml" | "yml" | "json") {
            scenarios.push(load_scenario(&p)?);
        }
    }
    scenarios.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(scenarios)
}
