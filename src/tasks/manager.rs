//! 任务/线程生命周期管理
//!
//! 所有状态修改都经由 Store 的原子迁移完成；TaskManager 负责：
//! - 提交：校验输入、按需创建线程、写入用户消息与 user_message 事件、唤醒 Worker
//! - 调用方操作：get / cancel（幂等）/ delete（幂等，可级联删除线程）
//! - Worker 操作：claim / renew / complete / fail / release / requeue_expired
//! - 进程内取消：运行中任务登记 CancellationToken，cancel 时立即触发

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::store::{
    derive_subject, now_millis, Event, EventType, Store, Strategy, Task, TaskId, TaskPriority, TaskStatus,
    Thread, ThreadId, ThreadMessage, Transition,
};

/// 提交新任务的参数（策略已由 Router 决定）
#[derive(Debug, Clone)]
pub struct NewTask {
    pub instructions: String,
    pub thread_id: Option<ThreadId>,
    pub strategy: Strategy,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    /// 合并进线程 context
    pub context: BTreeMap<String, String>,
    /// 由 Scheduler 产生时的计划名（新线程以其为主题）
    pub schedule_name: Option<String>,
}

impl NewTask {
    pub fn new(instructions: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            instructions: instructions.into(),
            thread_id: None,
            strategy,
            priority: TaskPriority::default(),
            tags: Vec::new(),
            user_id: None,
            context: BTreeMap::new(),
            schedule_name: None,
        }
    }

    pub fn in_thread(mut self, thread_id: Option<ThreadId>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }
}

pub struct TaskManager {
    store: Arc<dyn Store>,
    /// 有新任务入队时唤醒空闲 Worker
    queue_notify: Notify,
    /// 本进程内运行中任务的取消令牌
    running: DashMap<TaskId, CancellationToken>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            queue_notify: Notify::new(),
            running: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// 创建任务（线程不存在时创建），返回入队后的任务
    pub async fn create(&self, new: NewTask) -> Result<Task, TriageError> {
        let instructions = new.instructions.trim();
        if instructions.is_empty() {
            return Err(TriageError::Validation("instructions must not be empty".to_string()));
        }

        let thread_id = match &new.thread_id {
            Some(id) => {
                if self.store.get_thread(id).await?.is_none() {
                    return Err(TriageError::NotFound {
                        kind: "thread",
                        id: id.clone(),
                    });
                }
                if !new.context.is_empty() {
                    self.store.merge_context(id, &new.context).await?;
                }
                id.clone()
            }
            None => {
                let subject = match &new.schedule_name {
                    Some(name) => name.clone(),
                    None => derive_subject(instructions),
                };
                let mut thread = Thread::new(subject)
                    .with_context(new.context.clone())
                    .with_tags(new.tags.clone());
                if new.schedule_name.is_some() {
                    thread = thread.automated(new.schedule_name.clone());
                }
                let id = thread.id.clone();
                self.store.insert_thread(thread).await?;
                id
            }
        };

        let task = Task::new(&thread_id, instructions, new.strategy)
            .with_priority(new.priority)
            .with_tags(new.tags)
            .with_user(new.user_id);

        self.store
            .append_message(&thread_id, ThreadMessage::user(instructions).for_task(&task.id))
            .await?;
        self.store.insert_task(task.clone()).await?;
        self.emit(
            &thread_id,
            &task.id,
            Event::new(EventType::UserMessage, instructions).with_metadata(json!({
                "strategy": task.strategy,
                "priority": task.priority,
            })),
        )
        .await?;

        tracing::info!(task_id = %task.id, thread_id = %thread_id, strategy = %task.strategy, "task queued");
        self.queue_notify.notify_one();
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, TriageError> {
        self.store.get_task(task_id).await?.ok_or_else(|| TriageError::NotFound {
            kind: "task",
            id: task_id.to_string(),
        })
    }

    /// 按任务追加事件（线程由任务记录确定）
    pub async fn append_event(&self, task_id: &str, event: Event) -> Result<Event, TriageError> {
        let task = self.get(task_id).await?;
        self.emit(&task.thread_id, task_id, event).await
    }

    pub(crate) async fn emit(&self, thread_id: &str, task_id: &str, mut event: Event) -> Result<Event, TriageError> {
        event.thread_id = thread_id.to_string();
        event.task_id = task_id.to_string();
        Ok(self.store.append_event(event).await?)
    }

    /// 取消任务：已终止的任务上为 no-op；正在本进程运行的任务立即收到取消信号
    pub async fn cancel(&self, task_id: &str) -> Result<Task, TriageError> {
        let task = self.get(task_id).await?;
        if task.is_finished() {
            return Ok(task);
        }

        let cancelled = match self.store.transition(task_id, Transition::Cancel, now_millis()).await {
            Ok(t) => t,
            // 与完成并发：对方已先进入终态
            Err(e) => match TriageError::from_store(e, task_id) {
                TriageError::TaskTerminal { .. } => return self.get(task_id).await,
                other => return Err(other),
            },
        };

        if let Some((_, token)) = self.running.remove(task_id) {
            token.cancel();
        }
        self.emit(
            &cancelled.thread_id,
            task_id,
            Event::new(EventType::Completion, "Task cancelled").with_metadata(json!({ "status": "cancelled" })),
        )
        .await?;
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(cancelled)
    }

    /// 删除任务（幂等）；also_delete_thread 时级联删除线程、线程内所有任务与事件
    pub async fn delete(&self, task_id: &str, also_delete_thread: bool) -> Result<(), TriageError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };

        let victims = if also_delete_thread {
            self.store.tasks_for_thread(&task.thread_id).await?
        } else {
            vec![task.clone()]
        };

        for victim in &victims {
            if !victim.is_finished() {
                self.cancel(&victim.id).await?;
            }
            self.store.delete_task(&victim.id).await?;
            self.running.remove(&victim.id);
        }
        if also_delete_thread {
            self.store.delete_thread(&task.thread_id).await?;
            tracing::info!(task_id = %task_id, thread_id = %task.thread_id, tasks = victims.len(), "thread deleted");
        } else {
            tracing::info!(task_id = %task_id, "task deleted");
        }
        Ok(())
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Thread, TriageError> {
        self.store.get_thread(thread_id).await?.ok_or_else(|| TriageError::NotFound {
            kind: "thread",
            id: thread_id.to_string(),
        })
    }

    pub async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> Result<(), TriageError> {
        Ok(self.store.append_message(thread_id, message).await?)
    }

    pub async fn events_for_task(&self, task_id: &str) -> Result<Vec<Event>, TriageError> {
        Ok(self.store.events_for_task(task_id).await?)
    }

    pub async fn events_for_thread(&self, thread_id: &str, after_seq: u64) -> Result<Vec<Event>, TriageError> {
        Ok(self.store.events_for_thread(thread_id, after_seq).await?)
    }

    pub fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event> {
        self.store.subscribe(thread_id)
    }

    /// 等待新任务入队通知
    pub async fn wait_for_work(&self) {
        self.queue_notify.notified().await;
    }

    pub(crate) fn wake_workers(&self) {
        self.queue_notify.notify_one();
    }

    // ---- Worker 侧操作 ----

    pub async fn claim_next(&self, worker_id: &str, lease_ms: i64) -> Result<Option<Task>, TriageError> {
        Ok(self.store.claim_next(worker_id, lease_ms, now_millis()).await?)
    }

    pub async fn renew(&self, task_id: &str, worker_id: &str, extension_ms: i64) -> Result<Task, TriageError> {
        self.transition(
            task_id,
            Transition::Renew {
                worker_id: worker_id.to_string(),
                extension_ms,
            },
        )
        .await
    }

    /// 标记完成，并把结果作为 assistant 消息写入线程
    pub async fn complete(&self, task_id: &str, worker_id: &str, result: String) -> Result<Task, TriageError> {
        let task = self
            .transition(
                task_id,
                Transition::Complete {
                    worker_id: worker_id.to_string(),
                    result: result.clone(),
                },
            )
            .await?;
        self.store
            .append_message(&task.thread_id, ThreadMessage::assistant(result).for_task(task_id))
            .await?;
        self.emit(
            &task.thread_id,
            task_id,
            Event::new(EventType::Completion, "Task completed").with_metadata(json!({
                "status": TaskStatus::Completed,
                "attempt": task.attempt_count,
            })),
        )
        .await?;
        Ok(task)
    }

    /// 标记失败；worker_id 为 None 表示非租约持有者发起（如重试次数耗尽）
    pub async fn fail(&self, task_id: &str, worker_id: Option<&str>, error: String) -> Result<Task, TriageError> {
        let task = self
            .transition(
                task_id,
                Transition::Fail {
                    worker_id: worker_id.map(String::from),
                    error: error.clone(),
                },
            )
            .await?;
        self.emit(
            &task.thread_id,
            task_id,
            Event::new(EventType::Error, error).with_metadata(json!({
                "status": TaskStatus::Failed,
                "attempt": task.attempt_count,
            })),
        )
        .await?;
        Ok(task)
    }

    /// 持有者主动归还租约，任务回到 queued
    pub async fn release(&self, task_id: &str, worker_id: &str) -> Result<Task, TriageError> {
        let task = self
            .transition(
                task_id,
                Transition::Release {
                    worker_id: worker_id.to_string(),
                },
            )
            .await?;
        self.wake_workers();
        Ok(task)
    }

    pub async fn requeue_expired(&self) -> Result<Vec<TaskId>, TriageError> {
        let requeued = self.store.requeue_expired(now_millis()).await?;
        if !requeued.is_empty() {
            tracing::warn!(count = requeued.len(), tasks = ?requeued, "expired leases requeued");
            self.wake_workers();
        }
        Ok(requeued)
    }

    async fn transition(&self, task_id: &str, transition: Transition) -> Result<Task, TriageError> {
        self.store
            .transition(task_id, transition, now_millis())
            .await
            .map_err(|e| TriageError::from_store(e, task_id))
    }

    // ---- 进程内取消登记 ----

    pub(crate) fn register_running(&self, task_id: &str, token: CancellationToken) {
        self.running.insert(task_id.to_string(), token);
    }

    pub(crate) fn unregister_running(&self, task_id: &str) {
        self.running.remove(task_id);
    }
}
