//! 存储层：任务记录、线程记录、按线程有序的事件日志，以及带可见性超时（租约）的工作队列
//!
//! 所有实现共享 [`Task::apply`] 状态机；认领必须是原子的：同一任务的并发认领只有一个成功。

mod bus;
mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use bus::EventBus;
pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
pub use types::{
    derive_subject, now_millis, target_in, Event, EventType, MessageRole, Strategy, Task, TaskId, TaskPriority,
    TaskStatus, Thread, ThreadId, ThreadMessage, ThreadMetadata, Transition, TransitionError,
    TARGET_INSTANCE_KEY,
};

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn task_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    pub fn thread_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "thread",
            id: id.to_string(),
        }
    }
}

/// 持久化后端接口
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_thread(&self, thread: Thread) -> Result<(), StoreError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError>;

    /// 追加消息；消息只追加，不重排、不改写
    async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> Result<(), StoreError>;

    /// 合并 context 键值（已存在的键被覆盖）
    async fn merge_context(
        &self,
        thread_id: &str,
        context: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// 删除线程及其事件日志；返回是否存在
    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError>;

    async fn insert_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError>;

    /// 删除任务记录；返回被删除的任务
    async fn delete_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// 原子认领下一个可执行任务：优先级高者优先，其次创建时间早者优先
    async fn claim_next(&self, worker_id: &str, lease_ms: i64, now: i64) -> Result<Option<Task>, StoreError>;

    /// 原子地对单个任务执行状态迁移，返回迁移后的任务
    async fn transition(&self, task_id: &str, transition: Transition, now: i64) -> Result<Task, StoreError>;

    /// 将租约过期的 running 任务放回 queued，返回被放回的任务 ID
    async fn requeue_expired(&self, now: i64) -> Result<Vec<TaskId>, StoreError>;

    /// 追加事件，返回分配了 seq 的事件
    async fn append_event(&self, event: Event) -> Result<Event, StoreError>;

    async fn events_for_task(&self, task_id: &str) -> Result<Vec<Event>, StoreError>;

    /// 读取线程中 seq > after_seq 的事件（断线重连后补齐）
    async fn events_for_thread(&self, thread_id: &str, after_seq: u64) -> Result<Vec<Event>, StoreError>;

    /// 订阅线程的新事件
    fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event>;
}
