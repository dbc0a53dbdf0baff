//! Deep 策略：Topics 扇出/汇总
//!
//! 1. Collect：并发调用配置的初始诊断工具（经缓存执行器），每个结果包装为信封并记录 tool_call 事件
//! 2. Decompose：补全服务把信封分解为有序 Topic 列表，每个 Topic 记录一条 topic_found 事件
//! 3. Fan-out：每个 Topic 一个研究分支，并发数受 `max_parallel_topics` 限制；分支失败只降级自身
//! 4. Compose：所有分支返回后生成按 Topic 组织的报告
//!
//! 取消会传播到所有仍在运行的分支，已取消分支的部分产物直接丢弃。
//! 线程未绑定目标实例时不采集诊断数据，研究分支只凭知识作答。

mod compose;
mod research;
mod topics;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::DeepSection;
use crate::core::TriageError;
use crate::llm::CompletionClient;
use crate::react::{bind_target, ToolLoop};
use crate::store::{Event, EventType, Strategy};
use crate::strategy::{RunContext, StrategyExecutor};
use crate::tools::DiagnosticEnvelope;

pub use compose::{collect_artifacts, compose, render_report, TopicArtifact};
pub use research::ResearchBranch;
pub use topics::{catch_all, normalize_title, request_topics, topic_id, topic_ordinal, Topic, CATCH_ALL_TITLE};

#[derive(Debug, Clone)]
pub struct DeepConfig {
    pub initial_tools: Vec<String>,
    pub knowledge_tools: Vec<String>,
    pub max_parallel_topics: usize,
}

impl DeepConfig {
    pub fn from_config(deep: &DeepSection) -> Self {
        Self {
            initial_tools: deep.initial_tools.clone(),
            knowledge_tools: deep.knowledge_tools.clone(),
            max_parallel_topics: deep.max_parallel_topics.max(1),
        }
    }
}

impl Default for DeepConfig {
    fn default() -> Self {
        Self::from_config(&DeepSection::default())
    }
}

pub struct DeepStrategy {
    completion: Arc<dyn CompletionClient>,
    tool_loop: Arc<ToolLoop>,
    config: DeepConfig,
    knowledge_tools: Arc<Vec<String>>,
}

impl DeepStrategy {
    pub fn new(completion: Arc<dyn CompletionClient>, tool_loop: Arc<ToolLoop>, config: DeepConfig) -> Self {
        let knowledge_tools = Arc::new(config.knowledge_tools.clone());
        Self {
            completion,
            tool_loop,
            config,
            knowledge_tools,
        }
    }

    /// 阶段 1：每个已注册的初始工具调用一次，失败记录为错误信封
    async fn collect(&self, ctx: &RunContext, target: Option<&str>) -> Result<Vec<DiagnosticEnvelope>, TriageError> {
        let executor = self.tool_loop.executor();
        let mut tools: Vec<&str> = Vec::new();
        for name in &self.config.initial_tools {
            if tools.contains(&name.as_str()) {
                continue;
            }
            if !executor.has_tool(name) {
                tracing::warn!(tool = %name, task_id = %ctx.task.id, "initial tool not registered, skipped");
                continue;
            }
            tools.push(name);
        }

        let calls = tools.into_iter().map(move |name| async move {
            let args = bind_target(json!({}), target);
            let outcome = executor.invoke(name, args.clone()).await;
            ctx.emitter.tool_call(name, &args, &outcome, None).await?;
            Ok::<_, TriageError>(outcome.unwrap_or_else(|e| DiagnosticEnvelope::error(name, e.to_string())))
        });

        let results = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TriageError::Cancelled),
            r = join_all(calls) => r,
        };
        results.into_iter().collect()
    }

    /// 阶段 2：分解失败或为空时退回兜底 Topic
    async fn decompose(&self, ctx: &RunContext, envelopes: &[DiagnosticEnvelope]) -> Result<Vec<Topic>, TriageError> {
        let decomposed = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TriageError::Cancelled),
            r = request_topics(self.completion.as_ref(), &ctx.task.instructions, envelopes) => r,
        };
        let mut topics = match decomposed {
            Ok(topics) => topics,
            Err(e) => {
                tracing::warn!(task_id = %ctx.task.id, error = %e, "topic decomposition failed, using catch-all topic");
                Vec::new()
            }
        };
        if topics.is_empty() {
            topics.push(catch_all(envelopes));
        }

        for topic in &topics {
            ctx.emitter
                .emit(
                    Event::new(EventType::TopicFound, format!("{}: {}", topic.id, topic.title)).with_metadata(json!({
                        "topic_id": topic.id,
                        "title": topic.title,
                        "signal_refs": topic.signal_refs,
                    })),
                )
                .await?;
        }
        Ok(topics)
    }

    /// 阶段 3：并发研究分支，返回每个 Topic 恰好一个产物
    async fn fan_out(
        &self,
        ctx: &RunContext,
        topics: &[Topic],
        envelopes: Vec<DiagnosticEnvelope>,
        target: Option<&str>,
        knowledge_tools: Arc<Vec<String>>,
    ) -> Result<Vec<TopicArtifact>, TriageError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_topics));
        let envelopes = Arc::new(envelopes);
        let subject: Arc<str> = Arc::from(ctx.task.instructions.as_str());
        let target: Option<Arc<str>> = target.map(Arc::from);
        let branch_cancel = ctx.cancel.child_token();

        let mut set = JoinSet::new();
        for topic in topics.iter().cloned() {
            let branch = ResearchBranch::new(self.tool_loop.clone(), knowledge_tools.clone());
            let semaphore = semaphore.clone();
            let envelopes = envelopes.clone();
            let subject = subject.clone();
            let target = target.clone();
            let emitter = ctx.emitter.clone();
            let cancel = branch_cancel.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (topic.id, Err(TriageError::Cancelled)),
                    p = semaphore.acquire_owned() => match p {
                        Ok(permit) => permit,
                        Err(_) => return (topic.id, Err(TriageError::Cancelled)),
                    },
                };
                tracing::debug!(topic_id = %topic.id, "research branch started");
                let result = branch
                    .run(&topic, &subject, target.as_deref(), &envelopes, &emitter, &cancel)
                    .await;
                (topic.id, result)
            });
        }

        let mut artifacts: Vec<TopicArtifact> = Vec::with_capacity(topics.len());
        loop {
            let joined = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    set.abort_all();
                    return Err(TriageError::Cancelled);
                }
                joined = set.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok((_, Ok(artifact)))) => artifacts.push(artifact),
                Some(Ok((_, Err(TriageError::Cancelled)))) => {
                    set.abort_all();
                    return Err(TriageError::Cancelled);
                }
                Some(Ok((topic_id, Err(e)))) => artifacts.push(TopicArtifact::degraded(topic_id, e.to_string())),
                // panic 的分支拿不到 topic id，下面统一补降级产物
                Some(Err(e)) => tracing::warn!(task_id = %ctx.task.id, panic = e.is_panic(), error = %e, "research branch crashed"),
            }
        }

        for topic in topics {
            if !artifacts.iter().any(|a| a.topic_id() == topic.id) {
                artifacts.push(TopicArtifact::degraded(&topic.id, "research branch crashed before returning a result"));
            }
        }
        Ok(artifacts)
    }
}

#[async_trait]
impl StrategyExecutor for DeepStrategy {
    fn strategy(&self) -> Strategy {
        Strategy::Deep
    }

    async fn execute(&self, ctx: &RunContext) -> Result<String, TriageError> {
        let target = ctx.thread.target_instance();
        // 没有目标实例时跳过采集，分支也不开放工具
        let (envelopes, knowledge_tools) = match target {
            Some(_) => (self.collect(ctx, target).await?, self.knowledge_tools.clone()),
            None => {
                tracing::warn!(task_id = %ctx.task.id, "deep task without target instance, tools disabled");
                (Vec::new(), Arc::new(Vec::new()))
            }
        };
        tracing::info!(task_id = %ctx.task.id, envelopes = envelopes.len(), "diagnostics collected");

        let topics = self.decompose(ctx, &envelopes).await?;
        tracing::info!(task_id = %ctx.task.id, topics = topics.len(), "topics decomposed");

        let artifacts = self
            .fan_out(ctx, &topics, envelopes, target, knowledge_tools)
            .await?;
        let degraded = artifacts.iter().filter(|a| a.is_degraded()).count();
        tracing::info!(task_id = %ctx.task.id, artifacts = artifacts.len(), degraded, "fan-out finished");

        let report = compose(
            self.completion.as_ref(),
            &ctx.thread.subject,
            target,
            &topics,
            artifacts,
            &ctx.cancel,
        )
        .await?;
        ctx.emitter.response(report.clone()).await?;
        Ok(report)
    }
}
