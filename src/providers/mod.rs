use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod scripted;

/// The model caller consumed by the orchestrator.
///
/// Retry and backoff on transient failures belong to the implementation; the
/// orchestrator treats any returned error as terminal for the run.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;
}
