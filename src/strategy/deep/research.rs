//! 扇出阶段的单个研究分支：以 Topic 为作用域的有界工具调用循环
//!
//! 分支只能调用知识类工具，提示中附带 Topic 引用的信封。分支内的任何失败（工具全部失败、
//! 补全服务错误、输出无法解析）都转换为降级产物，不向兄弟分支传播；只有取消会向上返回。

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::llm::{extract_json_block, Message};
use crate::react::{LoopOutcome, LoopRequest, ToolLoop};
use crate::strategy::deep::{Topic, TopicArtifact};
use crate::strategy::prompts;
use crate::tasks::EventEmitter;
use crate::tools::DiagnosticEnvelope;

const SIGNAL_PREVIEW_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
struct ResearchReply {
    findings: String,
    #[serde(default)]
    recommended_actions: Vec<String>,
}

pub struct ResearchBranch {
    tool_loop: Arc<ToolLoop>,
    knowledge_tools: Arc<Vec<String>>,
}

impl ResearchBranch {
    pub fn new(tool_loop: Arc<ToolLoop>, knowledge_tools: Arc<Vec<String>>) -> Self {
        Self {
            tool_loop,
            knowledge_tools,
        }
    }

    /// 运行一个分支；返回 Err 仅表示被取消
    pub async fn run(
        &self,
        topic: &Topic,
        subject: &str,
        target: Option<&str>,
        envelopes: &[DiagnosticEnvelope],
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<TopicArtifact, TriageError> {
        let request = LoopRequest {
            system: prompts::RESEARCH_SYSTEM.to_string(),
            messages: vec![Message::user(research_prompt(topic, subject, envelopes))],
            allowed_tools: self.knowledge_tools.as_slice(),
            target,
            scope: Some(topic.id.as_str()),
        };

        match self.tool_loop.run(request, Some(emitter), cancel).await {
            Ok(outcome) => Ok(artifact_from_outcome(topic, &outcome)),
            Err(TriageError::Cancelled) => Err(TriageError::Cancelled),
            Err(e) => {
                tracing::warn!(topic_id = %topic.id, error = %e, "research branch degraded");
                Ok(TopicArtifact::degraded(&topic.id, e.to_string()))
            }
        }
    }
}

fn research_prompt(topic: &Topic, subject: &str, envelopes: &[DiagnosticEnvelope]) -> String {
    let mut prompt = format!("Investigation: {subject}\nTopic {}: {}\n\nSupporting signals:\n", topic.id, topic.title);
    let mut any = false;
    for idx in &topic.signal_refs {
        if let Some(env) = envelopes.get(*idx) {
            prompt.push_str(&format!("- {}: {}\n", env.source, env.preview(SIGNAL_PREVIEW_CHARS)));
            any = true;
        }
    }
    if !any {
        prompt.push_str("- (none)\n");
    }
    prompt
}

/// 循环结果 -> 产物
///
/// 有工具调用且全部失败时视为降级；未给出最终回答（触达迭代上限）同样降级。
pub(crate) fn artifact_from_outcome(topic: &Topic, outcome: &LoopOutcome) -> TopicArtifact {
    if !outcome.steps.is_empty() && outcome.steps.iter().all(|s| s.envelope.is_error()) {
        let last = outcome
            .steps
            .last()
            .map(|s| format!("{}: {}", s.tool, s.envelope.preview(300)))
            .unwrap_or_default();
        return TopicArtifact::degraded(&topic.id, format!("all tool calls failed ({last})"));
    }

    let answer = match (&outcome.answer, outcome.reached_ceiling()) {
        (Some(answer), false) => answer,
        _ => {
            return TopicArtifact::degraded(
                &topic.id,
                format!("no conclusion after {} iterations", outcome.iterations),
            )
        }
    };

    match extract_json_block(answer).and_then(|block| serde_json::from_str::<ResearchReply>(block).ok()) {
        Some(reply) => TopicArtifact::Recommendation {
            topic_id: topic.id.clone(),
            findings: reply.findings,
            recommended_actions: reply.recommended_actions,
        },
        None => TopicArtifact::Recommendation {
            topic_id: topic.id.clone(),
            findings: answer.trim().to_string(),
            recommended_actions: Vec::new(),
        },
    }
}
