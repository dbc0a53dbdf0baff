//! 汇总阶段：所有分支产物（成功或降级）齐全后，生成一份按 Topic 组织的报告
//!
//! 产物分组键以 `topic_id` 为准，旧字段名 `topic` 仅在反序列化时作为别名接受。
//! 报告中的 Topic 段落按 topic id 排序，与分支完成顺序无关；执行摘要由补全服务生成。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::llm::{CompletionClient, CompletionMode, CompletionRequest, Message};
use crate::strategy::deep::{topic_ordinal, Topic};
use crate::strategy::prompts;

/// 单个扇出分支的产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicArtifact {
    Recommendation {
        #[serde(alias = "topic")]
        topic_id: String,
        findings: String,
        #[serde(default)]
        recommended_actions: Vec<String>,
    },
    Degraded {
        #[serde(alias = "topic")]
        topic_id: String,
        error: String,
    },
}

impl TopicArtifact {
    pub fn degraded(topic_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Degraded {
            topic_id: topic_id.into(),
            error: error.into(),
        }
    }

    pub fn topic_id(&self) -> &str {
        match self {
            Self::Recommendation { topic_id, .. } | Self::Degraded { topic_id, .. } => topic_id,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// 按 topic id 归集产物；每个 Topic 必须恰好有一个产物
pub fn collect_artifacts(
    topics: &[Topic],
    artifacts: Vec<TopicArtifact>,
) -> Result<BTreeMap<String, TopicArtifact>, TriageError> {
    let mut by_topic = BTreeMap::new();
    for artifact in artifacts {
        let id = artifact.topic_id().to_string();
        if !topics.iter().any(|t| t.id == id) {
            return Err(TriageError::Validation(format!("artifact for unknown topic {id}")));
        }
        if by_topic.insert(id.clone(), artifact).is_some() {
            return Err(TriageError::Validation(format!("duplicate artifact for topic {id}")));
        }
    }

    let missing: Vec<&str> = topics
        .iter()
        .filter(|t| !by_topic.contains_key(&t.id))
        .map(|t| t.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(TriageError::Validation(format!(
            "cannot compose report, missing artifacts for {}",
            missing.join(", ")
        )));
    }
    Ok(by_topic)
}

/// 汇总：校验完整性 -> 请求执行摘要 -> 渲染报告
pub async fn compose(
    completion: &dyn CompletionClient,
    subject: &str,
    target: Option<&str>,
    topics: &[Topic],
    artifacts: Vec<TopicArtifact>,
    cancel: &CancellationToken,
) -> Result<String, TriageError> {
    let by_topic = collect_artifacts(topics, artifacts)?;

    let payload: Vec<serde_json::Value> = topics
        .iter()
        .filter_map(|t| {
            by_topic.get(&t.id).map(|a| {
                serde_json::json!({
                    "title": t.title,
                    "artifact": a,
                })
            })
        })
        .collect();
    let request = CompletionRequest {
        system: Some(prompts::SUMMARY_SYSTEM.to_string()),
        messages: vec![Message::user(format!(
            "Investigation: {subject}\n\nPer-topic results:\n{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        ))],
        mode: CompletionMode::Text,
    };

    let summary = tokio::select! {
        _ = cancel.cancelled() => return Err(TriageError::Cancelled),
        r = completion.complete(&request) => match r {
            Ok(response) => Some(response.into_text()),
            Err(e) => {
                tracing::warn!(error = %e, "executive summary failed, rendering report without it");
                None
            }
        },
    };

    Ok(render_report(subject, target, topics, &by_topic, summary.as_deref()))
}

pub fn render_report(
    subject: &str,
    target: Option<&str>,
    topics: &[Topic],
    by_topic: &BTreeMap<String, TopicArtifact>,
    summary: Option<&str>,
) -> String {
    let mut sorted: Vec<&Topic> = topics.iter().collect();
    sorted.sort_by(|a, b| (topic_ordinal(&a.id), &a.id).cmp(&(topic_ordinal(&b.id), &b.id)));

    let degraded = by_topic.values().filter(|a| a.is_degraded()).count();
    let mut out = format!("# Investigation report: {subject}\n");
    if let Some(target) = target {
        out.push_str(&format!("Target instance: {target}\n"));
    }
    out.push_str(&format!(
        "Topics investigated: {} ({} incomplete)\n\n## Summary\n\n",
        topics.len(),
        degraded
    ));
    out.push_str(summary.unwrap_or("Executive summary unavailable."));
    out.push('\n');

    for topic in sorted {
        out.push_str(&format!("\n## {}: {}\n\n", topic.id, topic.title));
        match by_topic.get(&topic.id) {
            Some(TopicArtifact::Recommendation {
                findings,
                recommended_actions,
                ..
            }) => {
                out.push_str("### Findings\n\n");
                out.push_str(findings.trim());
                out.push_str("\n\n### Recommended actions\n\n");
                if recommended_actions.is_empty() {
                    out.push_str("- No action required.\n");
                }
                for action in recommended_actions {
                    out.push_str(&format!("- {}\n", action.trim()));
                }
            }
            Some(TopicArtifact::Degraded { error, .. }) => {
                out.push_str(&format!(
                    "> **Investigation incomplete for {}**: {}\n",
                    topic.title, error
                ));
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, LlmError, MockCompletion};
    use serde_json::json;

    fn topics() -> Vec<Topic> {
        vec![
            Topic {
                id: "topic-01".into(),
                title: "Memory".into(),
                signal_refs: vec![0],
            },
            Topic {
                id: "topic-02".into(),
                title: "Slow commands".into(),
                signal_refs: vec![1],
            },
        ]
    }

    fn rec(id: &str) -> TopicArtifact {
        TopicArtifact::Recommendation {
            topic_id: id.into(),
            findings: format!("findings for {id}"),
            recommended_actions: vec!["raise maxmemory".into()],
        }
    }

    #[test]
    fn test_legacy_topic_key_accepted() {
        let legacy: TopicArtifact =
            serde_json::from_value(json!({"topic": "topic-01", "findings": "f", "recommended_actions": []})).unwrap();
        let canonical: TopicArtifact =
            serde_json::from_value(json!({"topic_id": "topic-01", "findings": "f", "recommended_actions": []}))
                .unwrap();
        assert_eq!(legacy, canonical);

        let degraded: TopicArtifact = serde_json::from_value(json!({"topic": "topic-02", "error": "timeout"})).unwrap();
        assert_eq!(degraded, TopicArtifact::degraded("topic-02", "timeout"));
        // 序列化只输出规范字段名
        assert_eq!(serde_json::to_value(&degraded).unwrap()["topic_id"], "topic-02");
    }

    #[test]
    fn test_sections_follow_numeric_topic_order() {
        let topics: Vec<Topic> = (0..120)
            .rev()
            .map(|i| Topic {
                id: crate::strategy::deep::topic_id(i),
                title: format!("Area {i}"),
                signal_refs: Vec::new(),
            })
            .collect();
        let by_topic: BTreeMap<String, TopicArtifact> =
            topics.iter().map(|t| (t.id.clone(), rec(&t.id))).collect();
        let report = render_report("audit", None, &topics, &by_topic, None);
        let ids: Vec<&str> = report
            .lines()
            .filter_map(|l| l.strip_prefix("## "))
            .filter_map(|l| l.split(':').next())
            .filter(|id| id.starts_with("topic-"))
            .collect();
        assert_eq!(ids.len(), 120);
        assert_eq!(ids[10], "topic-11");
        assert_eq!(ids[99], "topic-100");
        assert!(ids.windows(2).all(|w| topic_ordinal(w[0]) < topic_ordinal(w[1])));
    }

    #[test]
    fn test_missing_artifact_rejected() {
        let err = collect_artifacts(&topics(), vec![rec("topic-01")]).unwrap_err();
        assert!(err.to_string().contains("topic-02"));
        assert!(collect_artifacts(&topics(), vec![rec("topic-01"), rec("topic-01")]).is_err());
        assert!(collect_artifacts(&topics(), vec![rec("topic-01"), rec("topic-09")]).is_err());
    }

    #[tokio::test]
    async fn test_report_sorted_regardless_of_completion_order() {
        let mock = MockCompletion::text("Overall healthy.");
        let a = compose(
            &mock,
            "audit",
            Some("cache-1"),
            &topics(),
            vec![TopicArtifact::degraded("topic-02", "tool timed out"), rec("topic-01")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let b = compose(
            &mock,
            "audit",
            Some("cache-1"),
            &topics(),
            vec![rec("topic-01"), TopicArtifact::degraded("topic-02", "tool timed out")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.lines().filter(|l| l.starts_with("## topic-")).count(), 2);
        assert!(a.find("## topic-01").unwrap() < a.find("## topic-02").unwrap());
        assert!(a.contains("Investigation incomplete for Slow commands"));
        assert!(a.contains("Overall healthy."));
    }

    #[tokio::test]
    async fn test_summary_failure_still_renders() {
        let mock = MockCompletion::new(|_| Err::<CompletionResponse, _>(LlmError::Transport("down".into())));
        let report = compose(
            &mock,
            "audit",
            None,
            &topics(),
            vec![rec("topic-01"), rec("topic-02")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.contains("Executive summary unavailable."));
    }
}
