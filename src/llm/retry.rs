//! 补全调用的超时与指数退避重试
//!
//! 每次尝试单独计时；可重试错误（超时、限流、传输、格式错误）退避后重试，
//! 超过 max_retries 返回 [`LlmError::Exhausted`]，由 Worker 将任务标记为 failed。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, LlmError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 单次请求超时
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn from_config(llm: &LlmSection) -> Self {
        Self {
            max_retries: llm.retry.max_retries,
            initial_backoff: Duration::from_millis(llm.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(llm.retry.max_backoff_ms),
            request_timeout: Duration::from_secs(llm.timeouts.request),
        }
    }
}

pub struct RetryingCompletion {
    inner: Arc<dyn CompletionClient>,
    config: RetryConfig,
}

impl RetryingCompletion {
    pub fn new(inner: Arc<dyn CompletionClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl CompletionClient for RetryingCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.config.request_timeout, self.inner.complete(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout(self.config.request_timeout),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt > self.config.max_retries {
                tracing::warn!(attempts = attempt, error = %err, "completion retries exhausted");
                return Err(LlmError::Exhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let wait = match &err {
                LlmError::RateLimited { retry_after_ms } => backoff.max(Duration::from_millis(*retry_after_ms)),
                _ => backoff,
            };
            tracing::warn!(attempt, error = %err, wait_ms = wait.as_millis() as u64, "completion failed, retrying");
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletion;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mock = Arc::new(MockCompletion::scripted(vec![
            Err(LlmError::Transport("reset".into())),
            Ok(CompletionResponse::Text("ok".into())),
        ]));
        let client = RetryingCompletion::new(mock.clone(), fast_config(2));
        let out = client.complete(&CompletionRequest::text("q")).await.unwrap();
        assert_eq!(out, CompletionResponse::Text("ok".into()));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_after_bound() {
        let mock = Arc::new(MockCompletion::new(|_| Err(LlmError::Transport("down".into()))));
        let client = RetryingCompletion::new(mock.clone(), fast_config(2));
        let err = client.complete(&CompletionRequest::text("q")).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 3, .. }));
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_per_attempt_timeout() {
        let mock = Arc::new(
            MockCompletion::new(|_| Ok(CompletionResponse::Text("late".into()))).with_delay(Duration::from_secs(5)),
        );
        let client = RetryingCompletion::new(mock, fast_config(0));
        let err = client.complete(&CompletionRequest::text("q")).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 1, .. }));
    }
}
