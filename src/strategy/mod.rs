//! 策略执行器：Lookup / Direct / Deep，均在 Worker 内运行
//!
//! Worker 按 `task.strategy` 从 [`StrategySet`] 取出执行器，传入 [`RunContext`]（任务、线程快照、事件写入器、取消令牌）。

pub mod deep;
pub mod direct;
pub mod lookup;
pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::llm::{CompletionClient, Message};
use crate::react::ToolLoop;
use crate::store::{MessageRole, Strategy, Task, Thread};
use crate::tasks::EventEmitter;

pub use deep::{DeepConfig, DeepStrategy};
pub use direct::DirectStrategy;
pub use lookup::LookupStrategy;

/// 带入提示的线程历史消息条数
const HISTORY_LIMIT: usize = 12;

/// 一次执行的上下文
pub struct RunContext {
    pub task: Task,
    /// 认领时的线程快照
    pub thread: Thread,
    pub worker_id: String,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// 返回写入 task.result 的文本
    async fn execute(&self, ctx: &RunContext) -> Result<String, TriageError>;
}

#[derive(Default, Clone)]
pub struct StrategySet {
    executors: HashMap<Strategy, Arc<dyn StrategyExecutor>>,
}

impl StrategySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 三种标准策略
    pub fn standard(completion: Arc<dyn CompletionClient>, tool_loop: Arc<ToolLoop>, deep: DeepConfig) -> Self {
        Self::new()
            .with(Arc::new(LookupStrategy::new(completion.clone())))
            .with(Arc::new(DirectStrategy::new(tool_loop.clone())))
            .with(Arc::new(DeepStrategy::new(completion, tool_loop, deep)))
    }

    /// 注册（同一策略后注册者覆盖先注册者）
    pub fn with(mut self, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.executors.insert(executor.strategy(), executor);
        self
    }

    pub fn get(&self, strategy: Strategy) -> Option<Arc<dyn StrategyExecutor>> {
        self.executors.get(&strategy).cloned()
    }
}

/// 线程中先前的 user/assistant 消息（不含本任务），最后附上本任务的请求
pub fn history_messages(thread: &Thread, task: &Task) -> Vec<Message> {
    let prior: Vec<Message> = thread
        .messages
        .iter()
        .filter(|m| m.task_id.as_deref() != Some(task.id.as_str()))
        .filter_map(|m| match m.role {
            MessageRole::User => Some(Message::user(m.content.clone())),
            MessageRole::Assistant => Some(Message::assistant(m.content.clone())),
            MessageRole::Tool => None,
        })
        .collect();
    let skip = prior.len().saturating_sub(HISTORY_LIMIT);
    let mut messages: Vec<Message> = prior.into_iter().skip(skip).collect();
    messages.push(Message::user(task.instructions.clone()));
    messages
}
