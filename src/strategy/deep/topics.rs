//! Topics 分解：把诊断信封提交给补全服务，得到有序的 Topic 列表
//!
//! 标题归一化后相同的 Topic 只保留第一个（其 signal_refs 合并）；编号按去重后的顺序分配 topic-01、topic-02 ...
//! 分解结果为空（或分解调用失败）时合成一个覆盖全部信封的兜底 Topic，保证扇出阶段至少有一个工作单元。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::TriageError;
use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, LlmError};
use crate::strategy::prompts;
use crate::tools::DiagnosticEnvelope;

/// 分解提示中每个信封的预览长度
const ENVELOPE_PREVIEW_CHARS: usize = 1_500;

/// 兜底 Topic 标题
pub const CATCH_ALL_TITLE: &str = "General instance health review";

/// 扇出的一个工作单元，生成后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    /// 指向采集阶段信封列表的下标
    pub signal_refs: Vec<usize>,
}

/// 模型返回的原始 Topic
#[derive(Debug, Clone, Deserialize)]
struct RawTopic {
    title: String,
    #[serde(default)]
    signal_refs: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct Decomposition {
    #[serde(default)]
    topics: Vec<RawTopic>,
}

pub fn topic_id(index: usize) -> String {
    format!("topic-{:02}", index + 1)
}

/// topic-NN 的编号，用于按数值排序（topic-100 排在 topic-11 之后）
pub fn topic_ordinal(id: &str) -> Option<usize> {
    id.strip_prefix("topic-").and_then(|n| n.parse().ok())
}

/// 标题归一化键：小写、去标点、合并空白
pub fn normalize_title(title: &str) -> String {
    static NON_WORD: OnceLock<Option<Regex>> = OnceLock::new();
    let lower = title.to_lowercase();
    match NON_WORD.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").ok()) {
        Some(re) => re.replace_all(&lower, " ").trim().to_string(),
        None => lower.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// 请求分解，解析失败时返回错误（由调用方决定兜底）
pub async fn request_topics(
    completion: &dyn CompletionClient,
    subject: &str,
    envelopes: &[DiagnosticEnvelope],
) -> Result<Vec<Topic>, TriageError> {
    let mut prompt = format!("Investigation request: {subject}\n\nDiagnostic results:\n");
    for (i, env) in envelopes.iter().enumerate() {
        prompt.push_str(&format!("[{i}] {}: {}\n", env.source, env.preview(ENVELOPE_PREVIEW_CHARS)));
    }
    let schema = json!({
        "type": "object",
        "properties": {
            "topics": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "signal_refs": { "type": "array", "items": { "type": "integer", "minimum": 0 } }
                    },
                    "required": ["title"]
                }
            }
        },
        "required": ["topics"]
    });
    let request = CompletionRequest::structured(prompt, "topics", schema).with_system(prompts::DECOMPOSE_SYSTEM);

    let value = match completion.complete(&request).await? {
        CompletionResponse::Structured(v) => v,
        other => {
            return Err(LlmError::MalformedResponse(format!(
                "expected structured topics, got {}",
                other.into_text()
            ))
            .into())
        }
    };
    let decomposition: Decomposition = serde_json::from_value(value)
        .map_err(|e| TriageError::CompletionService(LlmError::MalformedResponse(format!("topics: {e}"))))?;
    Ok(dedupe_and_number(decomposition.topics, envelopes.len()))
}

/// 去重并编号；越界的 signal_refs 被丢弃
fn dedupe_and_number(raw: Vec<RawTopic>, envelope_count: usize) -> Vec<Topic> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut topics: Vec<Topic> = Vec::new();

    for candidate in raw {
        let key = normalize_title(&candidate.title);
        if key.is_empty() {
            continue;
        }
        let refs = candidate.signal_refs.into_iter().filter(|r| *r < envelope_count);
        match by_key.get(&key).copied() {
            Some(idx) => {
                let existing = &mut topics[idx];
                for r in refs {
                    if !existing.signal_refs.contains(&r) {
                        existing.signal_refs.push(r);
                    }
                }
            }
            None => {
                let mut signal_refs: Vec<usize> = Vec::new();
                for r in refs {
                    if !signal_refs.contains(&r) {
                        signal_refs.push(r);
                    }
                }
                by_key.insert(key, topics.len());
                topics.push(Topic {
                    id: topic_id(topics.len()),
                    title: candidate.title.trim().to_string(),
                    signal_refs,
                });
            }
        }
    }
    topics
}

/// 覆盖全部信封的兜底 Topic
pub fn catch_all(envelopes: &[DiagnosticEnvelope]) -> Topic {
    Topic {
        id: topic_id(0),
        title: CATCH_ALL_TITLE.to_string(),
        signal_refs: (0..envelopes.len()).collect(),
    }
}
