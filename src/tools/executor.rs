//! 工具执行器
//!
//! 持有 ToolRegistry、共享 TTL 缓存与硬超时：invoke(tool_name, args) 先查缓存，未命中则在超时内调用工具，
//! 成功结果包装为诊断信封并写入缓存；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{DiagnosticEnvelope, Tool, ToolCache, ToolError, ToolRegistry, ToolSpec};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：所有 Worker 共享同一个实例（缓存跨任务共享）
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    cache: Arc<ToolCache>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, cache: Arc<ToolCache>, timeout: Duration) -> Self {
        Self {
            registry,
            cache,
            timeout,
        }
    }

    /// 执行指定工具；超时返回 ToolError::Timeout，未注册返回 UnknownTool
    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<DiagnosticEnvelope, ToolError> {
        let start = Instant::now();
        let args = if args.is_null() { Value::Object(Default::default()) } else { args };

        let Some(tool) = self.registry.get(tool_name) else {
            audit(tool_name, "error", start, &args);
            return Err(ToolError::UnknownTool(tool_name.to_string()));
        };

        if tool.cacheable() {
            if let Some(hit) = self.cache.get(tool_name, &args) {
                audit(tool_name, "cache_hit", start, &args);
                return Ok(hit);
            }
        }

        let result = timeout(self.timeout, tool.invoke(args.clone())).await;
        match result {
            Ok(Ok(data)) => {
                let envelope = DiagnosticEnvelope::new(tool_name, data);
                if tool.cacheable() {
                    self.cache.put(tool_name, &args, envelope.clone());
                }
                audit(tool_name, "ok", start, &args);
                Ok(envelope)
            }
            Ok(Err(e)) => {
                audit(tool_name, "error", start, &args);
                Err(e)
            }
            Err(_) => {
                audit(tool_name, "timeout", start, &args);
                Err(ToolError::Timeout {
                    tool: tool_name.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn specs_for(&self, names: &[String]) -> Vec<ToolSpec> {
        self.registry.specs_for(names)
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }
}

fn audit(tool_name: &str, outcome: &str, start: Instant, args: &Value) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool_name,
        "ok": matches!(outcome, "ok" | "cache_hit"),
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
