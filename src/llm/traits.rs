//! 补全服务抽象
//!
//! 两层接口：
//! - [`LlmClient`]：传输层，消息进、原始文本出（OpenAI 兼容 / Mock）
//! - [`CompletionClient`]：三种响应模式（自由文本 / 结构化对象 / 工具调用），由 PromptedCompletion 在任意 LlmClient 上实现

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::Message;
use crate::tools::ToolSpec;

/// 补全服务错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("completion request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    #[error("completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LlmError {
    /// 是否值得退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Transport(_) | Self::MalformedResponse(_)
        )
    }
}

/// LLM 传输层 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 请求的响应模式
#[derive(Debug, Clone)]
pub enum CompletionMode {
    /// 自由文本
    Text,
    /// 符合给定 JSON Schema 的结构化对象
    Structured { name: String, schema: Value },
    /// 从给定工具中选择一个调用，或给出最终回答
    ToolChoice { tools: Vec<ToolSpec> },
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub mode: CompletionMode,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            messages: vec![Message::user(prompt)],
            mode: CompletionMode::Text,
        }
    }

    pub fn structured(prompt: impl Into<String>, name: impl Into<String>, schema: Value) -> Self {
        Self {
            system: None,
            messages: vec![Message::user(prompt)],
            mode: CompletionMode::Structured {
                name: name.into(),
                schema,
            },
        }
    }

    pub fn tool_choice(messages: Vec<Message>, tools: Vec<ToolSpec>) -> Self {
        Self {
            system: None,
            messages,
            mode: CompletionMode::ToolChoice { tools },
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// system 与全部消息拼接后的文本（日志与测试桩按内容分派时使用）
    pub fn prompt_text(&self) -> String {
        let mut out = self.system.clone().unwrap_or_default();
        for m in &self.messages {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&m.content);
        }
        out
    }
}

/// 模型请求的工具调用（简化 JSON：{"tool": "slowlog", "args": {"count": 10}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResponse {
    Text(String),
    Structured(Value),
    ToolCall(ToolCall),
}

impl CompletionResponse {
    /// 以文本形式取出（结构化与工具调用按 JSON 输出）
    pub fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Structured(v) => v.to_string(),
            Self::ToolCall(call) => serde_json::to_string(&call).unwrap_or_default(),
        }
    }
}

/// 补全服务：complete(prompt, mode) -> response
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_retryable());
        assert!(!LlmError::Exhausted {
            attempts: 3,
            last: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_prompt_text_joins_system_and_messages() {
        let req = CompletionRequest::text("hello").with_system("sys");
        assert_eq!(req.prompt_text(), "sys\nhello");
    }
}
