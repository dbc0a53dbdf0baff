//! 诊断信封：工具结果进入推理流水线的唯一形态 `{source, collected_at, data}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::now_millis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEnvelope {
    /// 产生该结果的工具名
    pub source: String,
    /// 采集时间（毫秒时间戳）
    pub collected_at: i64,
    pub data: Value,
}

impl DiagnosticEnvelope {
    pub fn new(source: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            collected_at: now_millis(),
            data,
        }
    }

    /// 失败的工具调用也以信封形式进入记录：data = {"error": "..."}
    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source, serde_json::json!({ "error": message.into() }))
    }

    pub fn is_error(&self) -> bool {
        self.data.get("error").is_some() && self.data.as_object().map(|o| o.len() == 1).unwrap_or(false)
    }

    /// data 的紧凑 JSON 预览（用于事件与提示）
    pub fn preview(&self, max_chars: usize) -> String {
        let s = self.data.to_string();
        if s.chars().count() > max_chars {
            format!("{}...", s.chars().take(max_chars).collect::<String>())
        } else {
            s
        }
    }
}
