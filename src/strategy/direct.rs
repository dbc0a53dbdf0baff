//! Direct 策略：单个有界工具调用循环，工具绑定到线程的目标实例

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::TriageError;
use crate::react::{LoopRequest, ToolLoop};
use crate::store::Strategy;
use crate::strategy::{history_messages, prompts, RunContext, StrategyExecutor};

pub struct DirectStrategy {
    tool_loop: Arc<ToolLoop>,
}

impl DirectStrategy {
    pub fn new(tool_loop: Arc<ToolLoop>) -> Self {
        Self { tool_loop }
    }
}

#[async_trait]
impl StrategyExecutor for DirectStrategy {
    fn strategy(&self) -> Strategy {
        Strategy::Direct
    }

    async fn execute(&self, ctx: &RunContext) -> Result<String, TriageError> {
        let target = ctx.thread.target_instance();
        // 没有目标实例时不开放工具
        let allowed = match target {
            Some(_) => self.tool_loop.executor().tool_names(),
            None => {
                tracing::warn!(task_id = %ctx.task.id, "direct task without target instance, tools disabled");
                Vec::new()
            }
        };
        let system = match target {
            Some(instance) => format!("{}\n\nTarget instance: {instance}", prompts::DIRECT_SYSTEM),
            None => prompts::DIRECT_SYSTEM.to_string(),
        };

        let outcome = self
            .tool_loop
            .run(
                LoopRequest {
                    system,
                    messages: history_messages(&ctx.thread, &ctx.task),
                    allowed_tools: &allowed,
                    target,
                    scope: None,
                },
                Some(&ctx.emitter),
                &ctx.cancel,
            )
            .await?;

        let answer = outcome.render();
        ctx.emitter.response(answer.clone()).await?;
        Ok(answer)
    }
}
