//! 错误恢复引擎
//!
//! Worker 在策略执行失败后调用：根据 TriageError 与已尝试次数返回 RecoveryAction。
//! - 存储暂时不可用且仍有剩余次数：Requeue
//! - 取消、终态冲突、任务/线程已删除、租约已丢失：Ignore
//! - 其它（补全服务耗尽、校验失败、配置错误等）：Fail

use crate::core::{RecoveryAction, TriageError};

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &TriageError, attempt: u32, max_attempts: u32) -> RecoveryAction {
        match err {
            TriageError::Cancelled
            | TriageError::TaskTerminal { .. }
            | TriageError::LeaseExpired(_)
            | TriageError::NotFound { .. } => RecoveryAction::Ignore,
            TriageError::Store(_) if attempt < max_attempts => RecoveryAction::Requeue,
            TriageError::Store(msg) => {
                RecoveryAction::Fail(format!("store unavailable after {attempt} attempts: {msg}"))
            }
            TriageError::CompletionService(e) => RecoveryAction::Fail(format!("completion service failed: {e}")),
            TriageError::ToolInvocation(e) => RecoveryAction::Fail(format!("tool invocation failed: {e}")),
            TriageError::Validation(msg) => RecoveryAction::Fail(format!("invalid task: {msg}")),
            TriageError::Config(msg) => RecoveryAction::Fail(format!("configuration error: {msg}")),
        }
    }
}
