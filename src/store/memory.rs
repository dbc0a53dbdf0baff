//! 内存存储（默认后端）
//!
//! 单把 RwLock 保护全部记录，认领、迁移与追加都在一次写锁内完成，因此天然原子。
//! 锁内不做任何 await。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::bus::EventBus;
use super::types::{Event, Task, TaskId, Thread, ThreadMessage, Transition};
use super::{now_millis, Store, StoreError};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    threads: HashMap<String, Thread>,
    /// thread_id -> 按 seq 递增的事件
    events: HashMap<String, Vec<Event>>,
}

/// 进程内存储：测试与单机部署使用
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    bus: EventBus,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_thread(&self, thread: Thread) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.threads.contains_key(&thread.id) {
            return Err(StoreError::Backend(format!("thread {} already exists", thread.id)));
        }
        inner.threads.insert(thread.id.clone(), thread);
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        Ok(self.inner.read().await.threads.get(thread_id).cloned())
    }

    async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let thread = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::thread_not_found(thread_id))?;
        // 保证追加顺序即时间顺序
        let mut message = message;
        if let Some(last) = thread.messages.last() {
            message.timestamp = message.timestamp.max(last.timestamp);
        }
        thread.metadata.updated_at = message.timestamp;
        thread.messages.push(message);
        Ok(())
    }

    async fn merge_context(
        &self,
        thread_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let thread = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::thread_not_found(thread_id))?;
        for (k, v) in context {
            thread.context.insert(k.clone(), v.clone());
        }
        thread.metadata.updated_at = now_millis();
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        let existed = {
            let mut inner = self.inner.write().await;
            inner.events.remove(thread_id);
            inner.threads.remove(thread_id).is_some()
        };
        self.bus.close(thread_id);
        Ok(existed)
    }

    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.threads.contains_key(&task.thread_id) {
            return Err(StoreError::thread_not_found(&task.thread_id));
        }
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Backend(format!("task {} already exists", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(task_id).cloned())
    }

    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.thread_id == thread_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.write().await.tasks.remove(task_id))
    }

    async fn claim_next(&self, worker_id: &str, lease_ms: i64, now: i64) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.write().await;
        let next_id = inner
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|t| t.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::task_not_found(&id))?;
        task.apply(
            &Transition::Claim {
                worker_id: worker_id.to_string(),
                lease_ms,
            },
            now,
        )?;
        Ok(Some(task.clone()))
    }

    async fn transition(&self, task_id: &str, transition: Transition, now: i64) -> Result<Task, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::task_not_found(task_id))?;
        // 在副本上迁移，失败时原记录不受影响
        let mut next = task.clone();
        next.apply(&transition, now)?;
        *task = next.clone();
        Ok(next)
    }

    async fn requeue_expired(&self, now: i64) -> Result<Vec<TaskId>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut requeued = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.status == super::TaskStatus::Running && !task.lease_active(now) {
                task.apply(&Transition::Expire, now)?;
                requeued.push(task.id.clone());
            }
        }
        Ok(requeued)
    }

    async fn append_event(&self, event: Event) -> Result<Event, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.threads.contains_key(&event.thread_id) {
            return Err(StoreError::thread_not_found(&event.thread_id));
        }
        let log = inner.events.entry(event.thread_id.clone()).or_default();
        let mut event = event;
        event.seq = log.last().map(|e| e.seq + 1).unwrap_or(1);
        if let Some(last) = log.last() {
            event.timestamp = event.timestamp.max(last.timestamp);
        }
        log.push(event.clone());
        // 持写锁推送，订阅者收到的顺序与 seq 一致
        self.bus.publish(&event);
        Ok(event)
    }

    async fn events_for_task(&self, task_id: &str) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        let filter = |log: &Vec<Event>| log.iter().filter(|e| e.task_id == task_id).cloned().collect::<Vec<_>>();
        match inner.tasks.get(task_id) {
            Some(task) => Ok(inner.events.get(&task.thread_id).map(filter).unwrap_or_default()),
            // 任务记录已删除时按任务 ID 扫描
            None => Ok(inner.events.values().flat_map(filter).collect()),
        }
    }

    async fn events_for_thread(&self, thread_id: &str, after_seq: u64) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .get(thread_id)
            .map(|log| log.iter().filter(|e| e.seq > after_seq).cloned().collect())
            .unwrap_or_default())
    }

    fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event> {
        self.bus.subscribe(thread_id)
    }
}
