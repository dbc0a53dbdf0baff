//! Worker 池：N 个 Worker 循环认领任务并执行，外加一个租约过期扫描
//!
//! 每个 Worker 一次只执行一个任务：认领 -> 登记取消令牌 -> 启动心跳 -> 执行策略 -> 完成/失败/归还。
//! 策略执行在独立的 tokio 任务中进行；执行器 panic 时不修改任务，租约到期后由其它 Worker 重新认领。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSection;
use crate::core::{RecoveryAction, RecoveryEngine, TriageError};
use crate::store::Task;
use crate::strategy::{RunContext, StrategySet};
use crate::tasks::{EventEmitter, TaskManager};
use crate::tools::ToolCache;
use crate::worker::Heartbeat;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease: Duration,
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl WorkerConfig {
    pub fn from_config(worker: &WorkerSection) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            lease: worker.lease(),
            heartbeat: worker.heartbeat(),
            poll_interval: worker.poll_interval(),
            max_attempts: worker.max_attempts.max(1),
        }
    }

    fn lease_ms(&self) -> i64 {
        self.lease.as_millis() as i64
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&WorkerSection::default())
    }
}

/// 一次执行的结局
enum RunOutcome {
    Finished(Result<String, TriageError>),
    /// 执行器 panic：不做任何状态修改，等待租约过期后重投递
    Panicked,
}

pub struct WorkerPool {
    manager: Arc<TaskManager>,
    strategies: StrategySet,
    config: WorkerConfig,
    recovery: RecoveryEngine,
    shutdown: CancellationToken,
    /// 扫描时顺带清除过期的工具结果
    tool_cache: Option<Arc<ToolCache>>,
    /// 区分不同进程的 Worker ID 前缀
    instance: String,
}

impl WorkerPool {
    pub fn new(
        manager: Arc<TaskManager>,
        strategies: StrategySet,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            manager,
            strategies,
            config,
            recovery: RecoveryEngine::new(),
            shutdown,
            tool_cache: None,
            instance: uuid[..8].to_string(),
        }
    }

    pub fn with_tool_cache(mut self, cache: Arc<ToolCache>) -> Self {
        self.tool_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!("worker-{}-{}", self.instance, index)
    }

    /// 启动 concurrency 个 Worker 循环与过期扫描
    pub fn start(self: &Arc<Self>) -> WorkerPoolHandle {
        let mut handles = Vec::with_capacity(self.config.concurrency + 1);
        for index in 0..self.config.concurrency {
            let pool = self.clone();
            let worker_id = self.worker_id(index);
            handles.push(tokio::spawn(async move { pool.worker_loop(worker_id).await }));
        }
        let pool = self.clone();
        handles.push(tokio::spawn(async move { pool.sweep_loop().await }));

        tracing::info!(
            workers = self.config.concurrency,
            lease_secs = self.config.lease.as_secs(),
            "worker pool started"
        );
        WorkerPoolHandle {
            shutdown: self.shutdown.clone(),
            handles,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        tracing::debug!(worker_id = %worker_id, "worker started");
        while !self.shutdown.is_cancelled() {
            match self.run_once(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "claim failed"),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.manager.wait_for_work() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(worker_id = %worker_id, "worker stopped");
    }

    /// 周期性把租约过期的任务放回队列，使轮询方及时看到 queued
    async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            self.sweep_once().await;
        }
    }

    /// 一次扫描：过期租约放回队列，过期工具结果清出缓存
    pub async fn sweep_once(&self) {
        if let Err(e) = self.manager.requeue_expired().await {
            tracing::warn!(error = %e, "expired lease sweep failed");
        }
        if let Some(cache) = &self.tool_cache {
            let remaining = cache.purge_expired();
            tracing::trace!(remaining, "tool cache purged");
        }
    }

    /// 认领并执行一个任务；队列为空时返回 false
    pub async fn run_once(&self, worker_id: &str) -> Result<bool, TriageError> {
        let Some(task) = self.manager.claim_next(worker_id, self.config.lease_ms()).await? else {
            return Ok(false);
        };
        tracing::info!(
            task_id = %task.id,
            worker_id = %worker_id,
            strategy = %task.strategy,
            attempt = task.attempt_count,
            "task claimed"
        );

        if task.attempt_count > self.config.max_attempts {
            let error = format!("exhausted retries after {} attempts", task.attempt_count - 1);
            tracing::warn!(task_id = %task.id, attempts = task.attempt_count - 1, "task exceeded max attempts");
            self.manager.fail(&task.id, Some(worker_id), error).await?;
            return Ok(true);
        }

        self.execute(worker_id, task).await;
        Ok(true)
    }

    async fn execute(&self, worker_id: &str, task: Task) {
        let task_id = task.id.clone();
        let attempt = task.attempt_count;
        let cancel = self.shutdown.child_token();
        self.manager.register_running(&task_id, cancel.clone());

        let heartbeat = Heartbeat::spawn(
            self.manager.clone(),
            task_id.clone(),
            worker_id.to_string(),
            self.config.lease,
            self.config.heartbeat,
            cancel.clone(),
        );
        let outcome = self.run_strategy(worker_id, task, cancel).await;
        heartbeat.stop().await;
        self.manager.unregister_running(&task_id);

        self.settle(worker_id, &task_id, attempt, outcome).await;
    }

    async fn run_strategy(&self, worker_id: &str, task: Task, cancel: CancellationToken) -> RunOutcome {
        let Some(executor) = self.strategies.get(task.strategy) else {
            return RunOutcome::Finished(Err(TriageError::Validation(format!(
                "no executor registered for strategy {}",
                task.strategy
            ))));
        };
        let thread = match self.manager.get_thread(&task.thread_id).await {
            Ok(thread) => thread,
            Err(e) => return RunOutcome::Finished(Err(e)),
        };

        let ctx = RunContext {
            emitter: EventEmitter::new(self.manager.clone(), task.id.clone(), task.thread_id.clone()),
            task,
            thread,
            worker_id: worker_id.to_string(),
            cancel,
        };
        let handle: JoinHandle<Result<String, TriageError>> = tokio::spawn(async move { executor.execute(&ctx).await });
        match handle.await {
            Ok(result) => RunOutcome::Finished(result),
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "strategy executor panicked");
                RunOutcome::Panicked
            }
        }
    }

    async fn settle(&self, worker_id: &str, task_id: &str, attempt: u32, outcome: RunOutcome) {
        let settled = match outcome {
            RunOutcome::Panicked => {
                tracing::warn!(task_id = %task_id, "lease left to expire for redelivery");
                return;
            }
            RunOutcome::Finished(Ok(result)) => self.manager.complete(task_id, worker_id, result).await.map(|_| ()),
            // 进程关闭导致的取消：归还租约，由其它 Worker 继续
            RunOutcome::Finished(Err(TriageError::Cancelled)) if self.shutdown.is_cancelled() => {
                self.manager.release(task_id, worker_id).await.map(|_| ())
            }
            RunOutcome::Finished(Err(e)) => match self.recovery.handle(&e, attempt, self.config.max_attempts) {
                RecoveryAction::Fail(message) => {
                    tracing::warn!(task_id = %task_id, error = %e, "task failed");
                    self.manager.fail(task_id, Some(worker_id), message).await.map(|_| ())
                }
                RecoveryAction::Requeue => {
                    tracing::warn!(task_id = %task_id, attempt, error = %e, "task requeued");
                    self.manager.release(task_id, worker_id).await.map(|_| ())
                }
                RecoveryAction::Ignore => {
                    tracing::info!(task_id = %task_id, reason = %e, "execution stopped");
                    Ok(())
                }
            },
        };

        match settled {
            Ok(()) => tracing::info!(task_id = %task_id, worker_id = %worker_id, "task settled"),
            // 执行期间任务被取消/删除，或租约已被接管：结果丢弃
            Err(e @ (TriageError::TaskTerminal { .. } | TriageError::LeaseExpired(_) | TriageError::NotFound { .. })) => {
                tracing::info!(task_id = %task_id, reason = %e, "result discarded")
            }
            Err(e) => tracing::error!(task_id = %task_id, error = %e, "failed to record task outcome"),
        }
    }
}

/// 运行中的 Worker 池
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// 通知关闭并等待所有 Worker 退出
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockCompletion};
    use crate::store::{MemoryStore, Strategy, TaskStatus};
    use crate::strategy::{LookupStrategy, StrategyExecutor};
    use crate::tasks::NewTask;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl StrategyExecutor for FailingStore {
        fn strategy(&self) -> Strategy {
            Strategy::Direct
        }

        async fn execute(&self, _ctx: &RunContext) -> Result<String, TriageError> {
            Err(TriageError::Store("database is locked".into()))
        }
    }

    fn pool(manager: Arc<TaskManager>, strategies: StrategySet) -> WorkerPool {
        WorkerPool::new(manager, strategies, WorkerConfig::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_run_once_completes_lookup_task() {
        let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
        let strategies = StrategySet::new().with(Arc::new(LookupStrategy::new(Arc::new(MockCompletion::text(
            "maxmemory-policy controls eviction.",
        )))));
        let pool = pool(manager.clone(), strategies);

        let task = manager.create(NewTask::new("what is maxmemory-policy?", Strategy::Lookup)).await.unwrap();
        assert!(pool.run_once("w1").await.unwrap());
        assert!(!pool.run_once("w1").await.unwrap());

        let task = manager.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("maxmemory-policy controls eviction."));
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_completion_failure_marks_task_failed() {
        let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
        let completion = MockCompletion::scripted(vec![Err(LlmError::Exhausted {
            attempts: 3,
            last: "rate limited".into(),
        })]);
        let strategies = StrategySet::new().with(Arc::new(LookupStrategy::new(Arc::new(completion))));
        let pool = pool(manager.clone(), strategies);

        let task = manager.create(NewTask::new("explain eviction", Strategy::Lookup)).await.unwrap();
        pool.run_once("w1").await.unwrap();

        let task = manager.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_store_error_requeues_until_max_attempts() {
        let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
        let pool = pool(manager.clone(), StrategySet::new().with(Arc::new(FailingStore)));

        let task = manager.create(NewTask::new("check latency", Strategy::Direct)).await.unwrap();
        pool.run_once("w1").await.unwrap();
        let after_first = manager.get(&task.id).await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Queued);
        assert_eq!(after_first.attempt_count, 1);

        pool.run_once("w1").await.unwrap();
        pool.run_once("w1").await.unwrap();
        let finished = manager.get(&task.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert_eq!(finished.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_tool_results() {
        let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
        let cache = Arc::new(ToolCache::new(std::time::Duration::from_millis(10)));
        let pool = pool(manager, StrategySet::new()).with_tool_cache(cache.clone());

        for section in ["memory", "stats", "clients"] {
            cache.put(
                "info",
                &serde_json::json!({ "section": section }),
                crate::tools::DiagnosticEnvelope::new("info", serde_json::json!({})),
            );
        }
        assert_eq!(cache.len(), 3);

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        pool.sweep_once().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_executor_fails_task() {
        let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
        let pool = pool(manager.clone(), StrategySet::new());

        let task = manager.create(NewTask::new("full audit", Strategy::Deep)).await.unwrap();
        pool.run_once("w1").await.unwrap();
        let task = manager.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("deep"));
    }
}
