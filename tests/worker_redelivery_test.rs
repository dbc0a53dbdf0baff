//! Worker 池重投递测试：租约独占、执行器崩溃后重新认领、取消传播

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use triage::core::TriageError;
use triage::llm::{MockCompletion, MockLlmClient, PromptedCompletion};
use triage::store::{EventType, MemoryStore, Store, Strategy, Task, TaskStatus, Thread};
use triage::strategy::{LookupStrategy, RunContext, StrategyExecutor, StrategySet};
use triage::tasks::{NewTask, TaskManager};
use triage::worker::{WorkerConfig, WorkerPool};
use triage::{CreateTaskRequest, RuntimeBuilder};

use common::{fast_config, wait_status, wait_terminal};

fn short_lease() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        lease: Duration::from_millis(300),
        heartbeat: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        max_attempts: 3,
    }
}

async fn wait_finished(manager: &TaskManager, task_id: &str) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = manager.get(task_id).await.unwrap();
        if task.is_finished() {
            return task;
        }
        assert!(tokio::time::Instant::now() < deadline, "task still {}", task.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 第一次执行 panic，之后正常返回
struct PanicOnce {
    runs: AtomicUsize,
}

#[async_trait]
impl StrategyExecutor for PanicOnce {
    fn strategy(&self) -> Strategy {
        Strategy::Direct
    }

    async fn execute(&self, ctx: &RunContext) -> Result<String, TriageError> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("executor crashed");
        }
        Ok(format!("done on attempt {}", ctx.task.attempt_count))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_exactly_one_wins() {
    let store = Arc::new(MemoryStore::new());
    let thread = Thread::new("race");
    store.insert_thread(thread.clone()).await.unwrap();
    store.insert_task(Task::new(&thread.id, "only task", Strategy::Direct)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&format!("w{i}"), 60_000, triage::store::now_millis())
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicked_executor_is_redelivered() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
    let executor = Arc::new(PanicOnce {
        runs: AtomicUsize::new(0),
    });
    let pool = Arc::new(WorkerPool::new(
        manager.clone(),
        StrategySet::new().with(executor.clone()),
        short_lease(),
        CancellationToken::new(),
    ));
    let handle = pool.start();

    let task = manager.create(NewTask::new("why is latency high?", Strategy::Direct)).await.unwrap();
    let task = wait_finished(&manager, &task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.result.as_deref(), Some("done on attempt 2"));
    assert_eq!(executor.runs.load(Ordering::SeqCst), 2);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_lease_is_reclaimed() {
    let manager = Arc::new(TaskManager::new(Arc::new(MemoryStore::new())));
    let task = manager.create(NewTask::new("explain eviction", Strategy::Lookup)).await.unwrap();

    // 原持有者认领后失联，不再续约
    let claimed = manager.claim_next("dead-worker", 200).await.unwrap().unwrap();
    assert_eq!(claimed.attempt_count, 1);

    let strategies =
        StrategySet::new().with(Arc::new(LookupStrategy::new(Arc::new(MockCompletion::text("LRU eviction")))));
    let pool = Arc::new(WorkerPool::new(manager.clone(), strategies, short_lease(), CancellationToken::new()));
    let handle = pool.start();

    let task = wait_finished(&manager, &task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 2);

    // 失联的 Worker 恢复后无法覆盖新的结果
    let stale = manager.complete(&task.id, "dead-worker", "stale".into()).await;
    assert!(matches!(stale, Err(TriageError::TaskTerminal { .. })));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_running_task() {
    let slow = MockCompletion::text("late answer").with_delay(Duration::from_secs(30));
    let runtime = RuntimeBuilder::new(fast_config())
        .with_completion(Arc::new(slow))
        .build()
        .await
        .unwrap();
    let pool = runtime.start();
    let service = runtime.service().clone();

    let handle = service.create_task(CreateTaskRequest::new("what is a hot key?")).await.unwrap();
    wait_status(&service, &handle.task_id, TaskStatus::Running).await;

    let view = service.cancel_task(&handle.task_id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
    let view = wait_terminal(&service, &handle.task_id).await;
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert!(view.result.is_none());
    let cancelled_events = view
        .events
        .iter()
        .filter(|e| e.metadata.get("status").and_then(|s| s.as_str()) == Some("cancelled"))
        .count();
    assert_eq!(cancelled_events, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_mock_transport_lookup_end_to_end() {
    let completion = Arc::new(PromptedCompletion::new(Arc::new(MockLlmClient)));
    let runtime = RuntimeBuilder::new(fast_config())
        .with_completion(completion)
        .build()
        .await
        .unwrap();
    let pool = runtime.start();
    let service = runtime.service().clone();

    let handle = service
        .create_task(CreateTaskRequest::new("what does maxmemory-policy do"))
        .await
        .unwrap();
    assert_eq!(handle.strategy, Strategy::Lookup);
    let view = wait_terminal(&service, &handle.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    // 未绑定目标：日志中没有任何工具调用
    assert!(view.events.iter().all(|e| e.event_type != EventType::ToolCall));
    assert!(view.result.unwrap().contains("what does maxmemory-policy do"));

    let thread = service.get_thread(&handle.thread_id).await.unwrap();
    assert_eq!(thread.messages.len(), 2);

    pool.shutdown().await;
}
