//! 排查系统错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 TriageError 决定 Fail / Requeue / Ignore。

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::{StoreError, TaskId, TaskStatus, TransitionError};
use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum TriageError {
    /// 任务/线程输入不合法：立即返回调用方，不重试
    #[error("validation error: {0}")]
    Validation(String),

    /// 工具调用失败：通常记录在对话记录中，只有在无法继续时才会上抛
    #[error("tool invocation failed: {0}")]
    ToolInvocation(#[from] ToolError),

    /// 补全服务失败（已按退避重试耗尽）
    #[error("completion service error: {0}")]
    CompletionService(#[from] LlmError),

    /// 租约已过期或被其它 Worker 接管（内部信号，触发重新排队）
    #[error("lease expired for task {0}")]
    LeaseExpired(TaskId),

    /// 试图修改已终止的任务
    #[error("task {task_id} is already {status}")]
    TaskTerminal { task_id: TaskId, status: TaskStatus },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}

impl TriageError {
    /// 从存储错误映射，附带任务 ID 以便终态/租约错误携带上下文
    pub fn from_store(err: StoreError, task_id: &str) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::Transition(TransitionError::Terminal(status)) => Self::TaskTerminal {
                task_id: task_id.to_string(),
                status,
            },
            StoreError::Transition(TransitionError::LeaseNotHeld { .. })
            | StoreError::Transition(TransitionError::LeaseHeld { .. }) => Self::LeaseExpired(task_id.to_string()),
            StoreError::Transition(e @ TransitionError::Invalid { .. }) => Self::Validation(e.to_string()),
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }

    /// 调用方可见的冲突（终态任务上的修改请求），对外表现为 no-op
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::TaskTerminal { .. })
    }
}

impl From<StoreError> for TriageError {
    fn from(err: StoreError) -> Self {
        Self::from_store(err, "")
    }
}

impl From<config::ConfigError> for TriageError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 标记任务失败，附带给调用方看的错误信息
    Fail(String),
    /// 归还租约，任务回到 queued 等待重投
    Requeue,
    /// 不做任何迁移（已取消、已终态、已删除、租约已丢失）
    Ignore,
}
