//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发关闭令牌：Worker 停止认领新任务；正在执行的任务收到取消信号后归还租约，
//! 未能归还的租约自然过期，由下一次启动的 Worker 重新认领。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 命令行提交的任务已终止
    Finished,
    FatalError(String),
}

/// 进程级关闭信号：一个根令牌 + 原因广播
#[derive(Clone)]
pub struct ShutdownManager {
    root: CancellationToken,
    reasons: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reasons, _) = broadcast::channel(4);
        Self {
            root: CancellationToken::new(),
            reasons,
        }
    }

    /// Worker 池与运行中任务使用的令牌（根令牌的克隆）
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 只触发一次；之后的调用仅记录日志
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.root.is_cancelled() {
            tracing::debug!(?reason, "shutdown already in progress");
            return;
        }
        tracing::info!(?reason, "shutting down worker pool");
        let _ = self.reasons.send(reason);
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reasons.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await
    }

    /// 监听 Ctrl+C 与（Unix 上的）SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let on_ctrl_c = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => on_ctrl_c.shutdown(ShutdownReason::UserInitiated),
                Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl+C"),
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let on_term = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        if sigterm.recv().await.is_some() {
                            on_term.shutdown(ShutdownReason::Signal);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
