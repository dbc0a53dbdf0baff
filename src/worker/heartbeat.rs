//! 租约心跳：执行期间周期性续约
//!
//! 续约失败说明任务已被取消/删除，或租约已被其它 Worker 接管；此时取消本地执行，
//! 结果交由 Worker 丢弃。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::store::TaskId;
use crate::tasks::TaskManager;

pub struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// 启动心跳；`task_cancel` 在租约丢失时被触发
    pub fn spawn(
        manager: Arc<TaskManager>,
        task_id: TaskId,
        worker_id: String,
        lease: Duration,
        interval: Duration,
        task_cancel: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stop_rx = stop.clone();
        let extension_ms = lease.as_millis() as i64;
        let interval = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.renew(&task_id, &worker_id, extension_ms).await {
                    Ok(_) => tracing::trace!(task_id = %task_id, worker_id = %worker_id, "lease renewed"),
                    Err(TriageError::TaskTerminal { status, .. }) => {
                        tracing::info!(task_id = %task_id, status = %status, "task finished elsewhere, stopping execution");
                        task_cancel.cancel();
                        break;
                    }
                    Err(e @ (TriageError::LeaseExpired(_) | TriageError::NotFound { .. })) => {
                        tracing::warn!(task_id = %task_id, worker_id = %worker_id, error = %e, "lease lost, stopping execution");
                        task_cancel.cancel();
                        break;
                    }
                    // 存储暂时不可用：下一次心跳再试，租约余量足够时不影响执行
                    Err(e) => tracing::warn!(task_id = %task_id, error = %e, "lease renewal failed"),
                }
            }
        });

        Self { stop, handle }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "heartbeat task ended abnormally");
        }
    }
}
