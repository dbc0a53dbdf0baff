//! 请求路由：把一次排查请求分类为 lookup / direct / deep
//!
//! 判定顺序：
//! 1. 调用方显式指定的策略原样返回
//! 2. 未绑定目标实例：lookup（没有目标就不开放工具）
//! 3. 命中触发词（按词边界、忽略大小写）：deep，不调用 LLM
//! 4. 低延迟的结构化分类调用；判定为 deep 则 deep，否则 direct
//!
//! 分类调用失败或超时降级为 direct，只记日志，不向调用方抛错。

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::json;

use crate::config::RouterSection;
use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, LlmError};
use crate::store::Strategy;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub trigger_terms: Vec<String>,
    pub classify_timeout: Duration,
}

impl RouterConfig {
    pub fn from_config(section: &RouterSection) -> Self {
        Self {
            trigger_terms: section.trigger_terms.clone(),
            classify_timeout: Duration::from_millis(section.classify_timeout_ms),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from_config(&RouterSection::default())
    }
}

pub struct Router {
    completion: Arc<dyn CompletionClient>,
    config: RouterConfig,
    trigger_patterns: Vec<(String, Regex)>,
}

impl Router {
    pub fn new(completion: Arc<dyn CompletionClient>, config: RouterConfig) -> Self {
        let trigger_patterns = config
            .trigger_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .filter_map(|term| {
                let words: Vec<String> = term.split_whitespace().map(regex::escape).collect();
                let pattern = format!(r"(?i)\b{}\b", words.join(r"\s+"));
                Regex::new(&pattern).ok().map(|re| (term, re))
            })
            .collect();
        Self {
            completion,
            config,
            trigger_patterns,
        }
    }

    pub async fn classify(&self, query: &str, has_target_instance: bool, explicit: Option<Strategy>) -> Strategy {
        if let Some(strategy) = explicit {
            return strategy;
        }
        if !has_target_instance {
            return Strategy::Lookup;
        }
        if let Some(term) = self.fast_match(query) {
            tracing::debug!(term = %term, "trigger term matched, routing to deep");
            return Strategy::Deep;
        }

        match tokio::time::timeout(self.config.classify_timeout, self.llm_classify(query)).await {
            Ok(Ok(strategy)) => strategy,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "classification failed, falling back to direct");
                Strategy::Direct
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.classify_timeout.as_millis() as u64,
                    "classification timed out, falling back to direct"
                );
                Strategy::Direct
            }
        }
    }

    /// 触发词规则匹配（不调用 LLM）
    fn fast_match(&self, query: &str) -> Option<&str> {
        self.trigger_patterns
            .iter()
            .find(|(_, re)| re.is_match(query))
            .map(|(term, _)| term.as_str())
    }

    async fn llm_classify(&self, query: &str) -> Result<Strategy, LlmError> {
        let system = format!(
            "You route requests for investigating a live data-store instance.\n\
             - deep: broad requests that need a full multi-area investigation (audits, health checks, \
             \"what is wrong\" with no specific symptom). Typical terms: {}.\n\
             - direct: a specific question answerable with a few targeted diagnostic commands.",
            self.config.trigger_terms.join(", ")
        );
        let schema = json!({
            "type": "object",
            "properties": {
                "strategy": { "type": "string", "enum": ["direct", "deep"] }
            },
            "required": ["strategy"]
        });
        let request = CompletionRequest::structured(format!("Request: {query}"), "classification", schema)
            .with_system(system);

        let verdict = match self.completion.complete(&request).await? {
            CompletionResponse::Structured(v) => v
                .get("strategy")
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| LlmError::MalformedResponse(format!("missing strategy in {v}")))?,
            CompletionResponse::Text(t) => t,
            CompletionResponse::ToolCall(call) => {
                return Err(LlmError::MalformedResponse(format!(
                    "unexpected tool call {}",
                    call.tool
                )))
            }
        };

        Ok(if verdict.trim().to_lowercase().contains("deep") {
            Strategy::Deep
        } else {
            Strategy::Direct
        })
    }
}
