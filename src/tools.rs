use std::collections::BTreeMap;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::scenario::{ToolResultSpec, ToolSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

impl From<&ToolSpec> for Tool {
    fn from(spec: &ToolSpec) -> Self {
        let mut def = FunctionDefinition::new(spec.name.clone());
        if let Some(desc) = &spec.description {
            def = def.with_description(desc.clone());
        }
        if let Some(params) = &spec.parameters {
            def = def.with_parameters(params.clone());
        }
        def.into()
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Result payload of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: Value,
    pub success: bool,
    #[serde(default)]
    pub was_forbidden: bool,
}

impl ToolOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            success: true,
            was_forbidden: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            output: json!({ "error": message.into() }),
            success: false,
            was_forbidden: false,
        }
    }

    pub fn blocked(reason: &str, tool: &str) -> Self {
        Self {
            output: json!({
                "error": "tool call blocked by policy",
                "tool": tool,
                "reason": reason,
            }),
            success: false,
            was_forbidden: reason == "forbidden",
        }
    }
}

/// Executes tool calls on behalf of the orchestrator.
///
/// Implementations report failures through [`ToolOutcome::failed`] instead of
/// panicking or erroring; a failing tool never ends a run.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome;
}

struct FixtureTool {
    spec: ToolSpec,
    validator: Option<JSONSchema>,
}

/// Deterministic executor answering from the fixtures declared on scenario tools.
pub struct FixtureToolExecutor {
    tools: BTreeMap<String, FixtureTool>,
}

impl FixtureToolExecutor {
    pub fn new(specs: &[ToolSpec]) -> Self {
        let mut tools = BTreeMap::new();
        for spec in specs {
            let validator = spec.parameters.as_ref().and_then(|schema| {
                match JSONSchema::options().with_draft(Draft::Draft7).compile(schema) {
                    Ok(compiled) => Some(compiled),
                    Err(err) => {
                        tracing::warn!(tool = %spec.name, error = %err, "ignoring invalid tool parameter schema");
                        None
                    }
                }
            });
            tools.insert(
                spec.name.clone(),
                FixtureTool {
                    spec: spec.clone(),
                    validator,
                },
            );
        }
        Self { tools }
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

#[async_trait]
impl ToolExecutor for FixtureToolExecutor {
    async fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::failed(format!("unknown tool: {name}"));
        };

        if let Some(validator) = &tool.validator {
            if let Err(errors) = validator.validate(arguments) {
                let messages: Vec<String> = errors.take(5).map(|e| e.to_string()).collect();
                return ToolOutcome {
                    output: json!({ "error": "invalid arguments", "details": messages }),
                    success: false,
                    was_forbidden: false,
                };
            }
        }

        let result = tool
            .spec
            .fixtures
            .iter()
            .find(|fixture| value_is_subset(&fixture.when, arguments))
            .map(|fixture| &fixture.then)
            .or(tool.spec.default.as_ref());

        match result {
            Some(ToolResultSpec::Ok { value }) => ToolOutcome::ok(value.clone()),
            Some(ToolResultSpec::Err { message }) => ToolOutcome::failed(message.clone()),
            None => ToolOutcome::failed("no matching fixture and no default specified"),
        }
    }
}

pub(crate) fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ToolFixture;

    fn lookup_spec() -> ToolSpec {
        ToolSpec {
            name: "lookup_account".to_string(),
            description: None,
            parameters: Some(json!({
                "type": "object",
                "properties": { "account": { "type": "string" } },
                "required": ["account"]
            })),
            fixtures: vec![ToolFixture {
                when: json!({ "account": "acme" }),
                then: ToolResultSpec::Ok {
                    value: json!({ "balance": 42 }),
                },
            }],
            default: Some(ToolResultSpec::Err {
                message: "account not found".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn fixture_matches_argument_subset() {
        let executor = FixtureToolExecutor::new(&[lookup_spec()]);
        let outcome = executor
            .execute("lookup_account", &json!({ "account": "acme", "verbose": true }))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output["balance"], 42);
    }

    #[tokio::test]
    async fn falls_back_to_default_result() {
        let executor = FixtureToolExecutor::new(&[lookup_spec()]);
        let outcome = executor
            .execute("lookup_account", &json!({ "account": "globex" }))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.output["error"], "account not found");
    }

    #[tokio::test]
    async fn schema_violation_is_a_failed_outcome() {
        let executor = FixtureToolExecutor::new(&[lookup_spec()]);
        let outcome = executor.execute("lookup_account", &json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.output["error"], "invalid arguments");
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_panicking() {
        let executor = FixtureToolExecutor::new(&[]);
        let outcome = executor.execute("rm_rf", &json!({})).await;
        assert!(!outcome.success);
    }

    #[test]
    fn blocked_outcome_flags_forbidden() {
        assert!(ToolOutcome::blocked("forbidden", "wire_funds").was_forbidden);
        assert!(!ToolOutcome::blocked("unlisted", "wire_funds").was_forbidden);
    }
}
