//! 对外服务门面：提交、查询、取消/删除任务，读取与续写线程，订阅事件，计划任务触发
//!
//! 路由在提交时完成：调用方未指定策略时由 Router 决定，结果写入任务记录后不再改变。

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::TriageError;
use crate::router::Router;
use crate::store::{
    target_in, Event, Strategy, Task, TaskId, TaskPriority, TaskStatus, Thread, ThreadId,
    TARGET_INSTANCE_KEY,
};
use crate::tasks::{NewTask, TaskManager};

/// 计划任务写入线程 context 的键
pub const SCHEDULE_CONTEXT_KEY: &str = "schedule";

/// 提交任务请求
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub instructions: String,
    pub thread_id: Option<ThreadId>,
    /// 指定策略时跳过 Router
    pub strategy: Option<Strategy>,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl CreateTaskRequest {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Default::default()
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<ThreadId>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// 绑定目标实例（写入线程 context）
    pub fn with_target(mut self, instance_id: impl Into<String>) -> Self {
        self.context.insert(TARGET_INSTANCE_KEY.to_string(), instance_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub thread_id: ThreadId,
    pub strategy: Strategy,
}

impl From<&Task> for TaskHandle {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            thread_id: task.thread_id.clone(),
            strategy: task.strategy,
        }
    }
}

/// 轮询视图：状态、事件、结果或错误
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub thread_id: ThreadId,
    pub status: TaskStatus,
    pub strategy: Strategy,
    pub attempt_count: u32,
    pub events: Vec<Event>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskView {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 外部调度器的一次触发
#[derive(Debug, Clone)]
pub struct ScheduleRun {
    pub name: String,
    pub instructions: String,
    /// 固定写入的线程；为空时按计划名复用本进程内上次创建的线程
    pub thread_id: Option<ThreadId>,
    pub context: BTreeMap<String, String>,
}

impl ScheduleRun {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            thread_id: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, instance_id: impl Into<String>) -> Self {
        self.context.insert(TARGET_INSTANCE_KEY.to_string(), instance_id.into());
        self
    }
}

pub struct InvestigationService {
    manager: Arc<TaskManager>,
    router: Arc<Router>,
    schedule_threads: DashMap<String, ThreadId>,
}

impl InvestigationService {
    pub fn new(manager: Arc<TaskManager>, router: Arc<Router>) -> Self {
        Self {
            manager,
            router,
            schedule_threads: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<TaskHandle, TriageError> {
        self.submit(request, None).await
    }

    async fn submit(&self, mut request: CreateTaskRequest, schedule_name: Option<String>) -> Result<TaskHandle, TriageError> {
        if request.instructions.trim().is_empty() {
            return Err(TriageError::Validation("instructions must not be empty".to_string()));
        }

        // 空白目标等同未绑定，不能覆盖线程上已有的目标
        if target_in(&request.context).is_none() {
            request.context.remove(TARGET_INSTANCE_KEY);
        }
        let mut has_target = target_in(&request.context).is_some();
        if let (false, Some(thread_id)) = (has_target, &request.thread_id) {
            has_target = self.manager.get_thread(thread_id).await?.target_instance().is_some();
        }
        let strategy = self
            .router
            .classify(&request.instructions, has_target, request.strategy)
            .await;

        let task = self
            .manager
            .create(NewTask {
                instructions: request.instructions,
                thread_id: request.thread_id,
                strategy,
                priority: request.priority,
                tags: request.tags,
                user_id: request.user_id,
                context: request.context,
                schedule_name,
            })
            .await?;
        Ok(TaskHandle::from(&task))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView, TriageError> {
        let task = self.manager.get(task_id).await?;
        let events = self.manager.events_for_task(task_id).await?;
        Ok(TaskView {
            task_id: task.id,
            thread_id: task.thread_id,
            status: task.status,
            strategy: task.strategy,
            attempt_count: task.attempt_count,
            events,
            result: task.result,
            error: task.error_message,
        })
    }

    /// 取消（幂等）：已终止的任务原样返回
    pub async fn cancel_task(&self, task_id: &str) -> Result<TaskView, TriageError> {
        self.manager.cancel(task_id).await?;
        self.get_task(task_id).await
    }

    /// 删除（幂等）；cascade 时连同所属线程一起删除
    pub async fn delete_task(&self, task_id: &str, cascade: bool) -> Result<(), TriageError> {
        self.manager.delete(task_id, cascade).await
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Thread, TriageError> {
        self.manager.get_thread(thread_id).await
    }

    /// 向已有线程追加一轮用户消息，作为新的任务执行
    pub async fn post_message(&self, thread_id: &str, content: impl Into<String>) -> Result<TaskHandle, TriageError> {
        self.create_task(CreateTaskRequest::new(content).in_thread(thread_id)).await
    }

    /// 订阅线程事件；落后或重连后用 [`Self::events_since`] 补齐
    pub fn subscribe(&self, thread_id: &str) -> broadcast::Receiver<Event> {
        self.manager.subscribe(thread_id)
    }

    pub async fn events_since(&self, thread_id: &str, after_seq: u64) -> Result<Vec<Event>, TriageError> {
        self.manager.events_for_thread(thread_id, after_seq).await
    }

    /// 计划任务触发：写入计划的固定线程，线程不存在时新建自动化线程
    pub async fn trigger_schedule(&self, run: ScheduleRun) -> Result<TaskHandle, TriageError> {
        let thread_id = match run.thread_id {
            Some(id) => Some(id),
            None => self.schedule_threads.get(&run.name).map(|id| id.value().clone()),
        };
        // 线程已被删除时退回新建
        let thread_id = match thread_id {
            Some(id) => match self.manager.get_thread(&id).await {
                Ok(_) => Some(id),
                Err(TriageError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut context = run.context;
        context.insert(SCHEDULE_CONTEXT_KEY.to_string(), run.name.clone());
        let request = CreateTaskRequest {
            instructions: run.instructions,
            thread_id,
            context,
            ..Default::default()
        };
        let handle = self.submit(request, Some(run.name.clone())).await?;
        tracing::info!(schedule = %run.name, task_id = %handle.task_id, thread_id = %handle.thread_id, "schedule triggered");
        self.schedule_threads.insert(run.name, handle.thread_id.clone());
        Ok(handle)
    }
}
