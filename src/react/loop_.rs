//! 有界工具调用循环
//!
//! Plan -> Act (Tool) -> Observe -> 下一轮 Plan；每轮向补全服务请求「最终回答」或「工具调用」。
//! - 工具调用：检查白名单，经 ToolExecutor（缓存 + 超时）执行，结果（含失败）作为信封追加到记录
//! - 最终回答：结束循环
//! - 达到迭代上限：返回已有的部分记录，标记 `max_iterations_reached`
//!
//! 工具错误不会抛出，由模型在下一轮自行调整；补全服务错误与取消会抛出。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ToolsSection;
use crate::core::TriageError;
use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, Message, ToolCall};
use crate::store::TARGET_INSTANCE_KEY;
use crate::tasks::EventEmitter;
use crate::tools::{DiagnosticEnvelope, ToolError, ToolExecutor};

/// 回填给模型的工具结果最大字符数
const OBSERVATION_MAX_CHARS: usize = 4_000;

/// 迭代上限标记
pub const MAX_ITERATIONS_MARKER: &str = "max_iterations_reached";

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
}

impl LoopConfig {
    pub fn from_config(tools: &ToolsSection) -> Self {
        Self {
            max_iterations: tools.max_iterations.max(1),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { max_iterations: 25 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    FinalAnswer,
    MaxIterationsReached,
}

/// 记录中的一次工具调用（失败时 envelope.data = {"error": ...}）
#[derive(Debug, Clone, Serialize)]
pub struct ToolStep {
    pub iteration: usize,
    pub tool: String,
    pub args: Value,
    pub envelope: DiagnosticEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub answer: Option<String>,
    pub steps: Vec<ToolStep>,
    /// 实际发起的补全调用次数
    pub iterations: usize,
    pub stop: StopReason,
}

impl LoopOutcome {
    pub fn reached_ceiling(&self) -> bool {
        self.stop == StopReason::MaxIterationsReached
    }

    pub fn envelopes(&self) -> Vec<DiagnosticEnvelope> {
        self.steps.iter().map(|s| s.envelope.clone()).collect()
    }

    /// 面向调用方的文本：最终回答，或带标记的部分记录
    pub fn render(&self) -> String {
        match (&self.stop, &self.answer) {
            (StopReason::FinalAnswer, Some(answer)) => answer.clone(),
            _ => {
                let mut out = format!(
                    "[{MAX_ITERATIONS_MARKER}] Stopped after {} iterations without a final answer.\n",
                    self.iterations
                );
                if !self.steps.is_empty() {
                    out.push_str("\nCollected so far:\n");
                    for step in &self.steps {
                        out.push_str(&format!("- {}: {}\n", step.tool, step.envelope.preview(300)));
                    }
                }
                out
            }
        }
    }
}

/// 单次循环的输入
pub struct LoopRequest<'a> {
    pub system: String,
    pub messages: Vec<Message>,
    pub allowed_tools: &'a [String],
    /// 绑定的目标实例：注入每次工具调用的参数（也使缓存键按实例区分）
    pub target: Option<&'a str>,
    /// 事件元数据中的作用域（Deep 分支的 topic_id）
    pub scope: Option<&'a str>,
}

pub struct ToolLoop {
    completion: Arc<dyn CompletionClient>,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
}

impl ToolLoop {
    pub fn new(completion: Arc<dyn CompletionClient>, executor: Arc<ToolExecutor>, config: LoopConfig) -> Self {
        Self {
            completion,
            executor,
            config,
        }
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn completion(&self) -> &Arc<dyn CompletionClient> {
        &self.completion
    }

    pub async fn run(
        &self,
        request: LoopRequest<'_>,
        emitter: Option<&EventEmitter>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, TriageError> {
        let specs = self.executor.specs_for(request.allowed_tools);
        let mut messages = request.messages;
        let mut steps = Vec::new();

        for iteration in 1..=self.config.max_iterations {
            let completion_request =
                CompletionRequest::tool_choice(messages.clone(), specs.clone()).with_system(request.system.clone());

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(TriageError::Cancelled),
                r = self.completion.complete(&completion_request) => r?,
            };

            let call = match response {
                CompletionResponse::ToolCall(call) => call,
                CompletionResponse::Text(answer) => {
                    return Ok(LoopOutcome {
                        answer: Some(answer),
                        steps,
                        iterations: iteration,
                        stop: StopReason::FinalAnswer,
                    })
                }
                CompletionResponse::Structured(v) => {
                    return Ok(LoopOutcome {
                        answer: Some(v.to_string()),
                        steps,
                        iterations: iteration,
                        stop: StopReason::FinalAnswer,
                    })
                }
            };

            let args = bind_target(call.args.clone(), request.target);
            let outcome = if !request.allowed_tools.iter().any(|t| t == &call.tool) {
                if self.executor.has_tool(&call.tool) {
                    Err(ToolError::NotAllowed(call.tool.clone()))
                } else {
                    Err(ToolError::UnknownTool(call.tool.clone()))
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TriageError::Cancelled),
                    r = self.executor.invoke(&call.tool, args.clone()) => r,
                }
            };

            if let Some(emitter) = emitter {
                emitter.tool_call(&call.tool, &args, &outcome, request.scope).await?;
            }
            if let Err(e) = &outcome {
                tracing::debug!(tool = %call.tool, iteration, error = %e, "tool call failed, recorded in transcript");
            }

            let envelope = outcome.unwrap_or_else(|e| DiagnosticEnvelope::error(&call.tool, e.to_string()));
            push_observation(&mut messages, &call, &envelope);
            steps.push(ToolStep {
                iteration,
                tool: call.tool,
                args,
                envelope,
            });
        }

        tracing::warn!(
            iterations = self.config.max_iterations,
            scope = request.scope.unwrap_or("-"),
            "tool loop reached iteration ceiling"
        );
        Ok(LoopOutcome {
            answer: None,
            steps,
            iterations: self.config.max_iterations,
            stop: StopReason::MaxIterationsReached,
        })
    }
}

/// 把目标实例写入参数的 instance_id；模型自带的值一律被覆盖
pub fn bind_target(args: Value, target: Option<&str>) -> Value {
    let Some(target) = target else {
        return args;
    };
    let mut args = match args {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => return other,
    };
    args.insert(TARGET_INSTANCE_KEY.to_string(), Value::String(target.to_string()));
    Value::Object(args)
}

fn push_observation(messages: &mut Vec<Message>, call: &ToolCall, envelope: &DiagnosticEnvelope) {
    messages.push(Message::assistant(serde_json::to_string(call).unwrap_or_default()));
    let mut data = envelope.data.to_string();
    if data.chars().count() > OBSERVATION_MAX_CHARS {
        data = format!("{}...", data.chars().take(OBSERVATION_MAX_CHARS).collect::<String>());
    }
    let status = if envelope.is_error() { "failed" } else { "ok" };
    messages.push(Message::user(format!(
        "Tool result ({status}) from {} at {}:\n{data}",
        envelope.source, envelope.collected_at
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionMode, MockCompletion};
    use crate::tools::{EchoTool, ToolCache, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn tool_loop(mock: Arc<MockCompletion>, max_iterations: usize) -> ToolLoop {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("info"));
        reg.register(EchoTool::named("config_get"));
        let executor = ToolExecutor::new(
            Arc::new(reg),
            Arc::new(ToolCache::new(Duration::from_secs(60))),
            Duration::from_secs(1),
        );
        ToolLoop::new(mock, Arc::new(executor), LoopConfig { max_iterations })
    }

    fn request(allowed: &[String]) -> LoopRequest<'_> {
        LoopRequest {
            system: "investigate".into(),
            messages: vec![Message::user("why is memory high?")],
            allowed_tools: allowed,
            target: None,
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_iteration_ceiling_is_exact() {
        let mock = Arc::new(MockCompletion::new(|_| {
            Ok(CompletionResponse::ToolCall(ToolCall::new("info", json!({"section": "memory"}))))
        }));
        let allowed = vec!["info".to_string()];
        let outcome = tool_loop(mock.clone(), 7)
            .run(request(&allowed), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stop, StopReason::MaxIterationsReached);
        assert_eq!(outcome.iterations, 7);
        assert_eq!(outcome.steps.len(), 7);
        assert_eq!(mock.calls(), 7);
        assert!(outcome.render().contains(MAX_ITERATIONS_MARKER));
    }

    #[tokio::test]
    async fn test_tool_then_final_answer() {
        let mock = Arc::new(MockCompletion::scripted(vec![
            Ok(CompletionResponse::ToolCall(ToolCall::new("info", json!({})))),
            Ok(CompletionResponse::Text("used_memory is fine".into())),
        ]));
        let allowed = vec!["info".to_string()];
        let outcome = tool_loop(mock, 25)
            .run(request(&allowed), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stop, StopReason::FinalAnswer);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.render(), "used_memory is fine");
        assert_eq!(outcome.steps[0].envelope.source, "info");
    }

    #[tokio::test]
    async fn test_disallowed_and_unknown_tools_recorded_not_raised() {
        let mock = Arc::new(MockCompletion::scripted(vec![
            Ok(CompletionResponse::ToolCall(ToolCall::new("config_get", json!({})))),
            Ok(CompletionResponse::ToolCall(ToolCall::new("flushall", json!({})))),
            Ok(CompletionResponse::Text("done".into())),
        ]));
        let allowed = vec!["info".to_string()];
        let outcome = tool_loop(mock, 25)
            .run(request(&allowed), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps.iter().all(|s| s.envelope.is_error()));
        assert!(outcome.steps[0].envelope.data["error"].as_str().unwrap().contains("not allowed"));
        assert!(outcome.steps[1].envelope.data["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_tool_results_feed_next_prompt() {
        let mock = Arc::new(MockCompletion::new(|req| {
            let CompletionMode::ToolChoice { tools } = &req.mode else {
                return Ok(CompletionResponse::Text("wrong mode".into()));
            };
            assert_eq!(tools.len(), 1);
            if req.prompt_text().contains("Tool result (ok) from info") {
                Ok(CompletionResponse::Text("saw it".into()))
            } else {
                Ok(CompletionResponse::ToolCall(ToolCall::new("info", json!({}))))
            }
        }));
        let allowed = vec!["info".to_string()];
        let outcome = tool_loop(mock, 5)
            .run(request(&allowed), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.answer.as_deref(), Some("saw it"));
    }

    #[test]
    fn test_bind_target_overrides_model_instance() {
        assert_eq!(
            bind_target(json!({"count": 5}), Some("cache-1")),
            json!({"count": 5, "instance_id": "cache-1"})
        );
        assert_eq!(
            bind_target(json!({"instance_id": "other-prod"}), Some("cache-prod-1")),
            json!({"instance_id": "cache-prod-1"})
        );
        // 未绑定目标时不改动参数
        assert_eq!(
            bind_target(json!({"instance_id": "other-prod"}), None),
            json!({"instance_id": "other-prod"})
        );
        assert_eq!(bind_target(Value::Null, None), Value::Null);
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop() {
        let mock = Arc::new(MockCompletion::text("never").with_delay(Duration::from_secs(5)));
        let allowed = vec!["info".to_string()];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = tool_loop(mock, 5).run(request(&allowed), None, &cancel).await.unwrap_err();
        assert!(matches!(err, TriageError::Cancelled));
    }
}
