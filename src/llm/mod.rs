//! LLM 层：传输客户端（OpenAI 兼容 / Mock）、提示协议、超时与重试

pub mod message;
pub mod mock;
pub mod openai;
pub mod protocol;
pub mod retry;
pub mod traits;

use std::sync::Arc;

pub use message::{Message, Role};
pub use mock::{MockCompletion, MockLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use protocol::{extract_json_block, parse_tool_reply, PromptedCompletion};
pub use retry::{RetryConfig, RetryingCompletion};
pub use traits::{
    CompletionClient, CompletionMode, CompletionRequest, CompletionResponse, LlmClient, LlmError, ToolCall,
};

use crate::config::AppConfig;

/// 根据配置创建传输客户端：有 API Key 时走 OpenAI 兼容端点，否则退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_some() && cfg.llm.provider.to_lowercase() != "mock" {
        tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            api_key.as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

/// 完整补全栈：传输客户端 -> 提示协议 -> 超时重试
pub fn create_completion_from_config(cfg: &AppConfig) -> Arc<dyn CompletionClient> {
    let prompted = Arc::new(PromptedCompletion::new(create_llm_from_config(cfg)));
    Arc::new(RetryingCompletion::new(prompted, RetryConfig::from_config(&cfg.llm)))
}
