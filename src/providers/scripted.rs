use std::{collections::VecDeque, fs, path::Path, sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::HarnessError,
    providers::LLMProvider,
    tools::ToolCall,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned model reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// When set, the call fails with this provider error instead of replying.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl ScriptedTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Replays a fixed list of model turns; used for deterministic runs and tests.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| HarnessError::io(path, e))?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let turns: Vec<ScriptedTurn> = if ext == "json" {
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
        Ok(Self::new(turns))
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self
            .turns
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider state poisoned".to_string()))?
            .pop_front();
        let Some(turn) = next else {
            return Err(LLMError::Provider("no more scripted responses".to_string()));
        };

        if let Some(ms) = turn.latency_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = turn.error {
            return Err(LLMError::Provider(message));
        }

        let finish_reason = if turn.tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        Ok(CompletionResponse {
            message: ChatMessage::assistant(turn.content).with_tool_calls(turn.tool_calls),
            usage: None,
            finish_reason: Some(finish_reason.to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_turns_in_order_then_errors() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::text("first"),
            ScriptedTurn::text("").with_tool_call(ToolCall::new("search", json!({ "q": "x" }))),
        ]);

        let first = provider
            .complete(CompletionRequest::new("m", vec![]))
            .await
            .expect("first turn");
        assert_eq!(first.content(), "first");
        assert_eq!(first.finish_reason.as_deref(), Some("stop"));

        let second = provider
            .complete(CompletionRequest::new("m", vec![]))
            .await
            .expect("second turn");
        assert_eq!(second.message.tool_calls.len(), 1);

        let err = provider
            .complete(CompletionRequest::new("m", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Provider(_)));
        assert_eq!(provider.requests().len(), 3);
    }

    #[test]
    fn parses_yaml_script() {
        let yaml = r#"
- content: "Let me check."
  tool_calls:
    - name: lookup
      arguments: { id: 7 }
- content: "Done."
"#;
        let turns: Vec<ScriptedTurn> = serde_yaml::from_str(yaml).expect("script");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].tool_calls[0].name, "lookup");
        assert_eq!(turns[0].tool_calls[0].arguments["id"], 7);
    }
}
