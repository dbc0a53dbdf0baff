//! Lookup 策略：仅知识问答，单轮补全，不开放任何工具

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::TriageError;
use crate::llm::{CompletionClient, CompletionMode, CompletionRequest};
use crate::store::Strategy;
use crate::strategy::{history_messages, prompts, RunContext, StrategyExecutor};

pub struct LookupStrategy {
    completion: Arc<dyn CompletionClient>,
}

impl LookupStrategy {
    pub fn new(completion: Arc<dyn CompletionClient>) -> Self {
        Self { completion }
    }
}

#[async_trait]
impl StrategyExecutor for LookupStrategy {
    fn strategy(&self) -> Strategy {
        Strategy::Lookup
    }

    async fn execute(&self, ctx: &RunContext) -> Result<String, TriageError> {
        let request = CompletionRequest {
            system: Some(prompts::LOOKUP_SYSTEM.to_string()),
            messages: history_messages(&ctx.thread, &ctx.task),
            mode: CompletionMode::Text,
        };

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TriageError::Cancelled),
            r = self.completion.complete(&request) => r?,
        };
        let answer = response.into_text();
        ctx.emitter.response(answer.clone()).await?;
        Ok(answer)
    }
}
