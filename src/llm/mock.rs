//! Mock 补全客户端（用于测试与无 API Key 的本地运行）
//!
//! - [`MockLlmClient`]：传输层 Mock，直接回显最后一条 User 消息作为最终回答
//! - [`MockCompletion`]：按处理函数或脚本返回响应，并统计调用次数

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, LlmClient, LlmError, Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }
}

type Handler = dyn Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync;

pub struct MockCompletion {
    handler: Box<Handler>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockCompletion {
    pub fn new(
        handler: impl Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// 依次返回脚本中的响应；脚本耗尽后返回 MalformedResponse
    pub fn scripted(responses: Vec<Result<CompletionResponse, LlmError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::MalformedResponse("mock script exhausted".to_string())))
        })
    }

    /// 总是返回同一段文本
    pub fn text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(move |_| Ok(CompletionResponse::Text(reply.clone())))
    }

    /// 每次响应前等待（模拟慢速服务）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}
