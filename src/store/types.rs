//! 持久化数据模型：Task / Thread / Event，以及任务状态机
//!
//! 状态迁移只通过 [`Task::apply`] 完成，内存与 SQLite 两种存储共用同一份迁移规则：
//!
//! ```text
//! queued  --claim-->            running   --complete-->  completed
//! running --fail-->             failed
//! running --expire (无心跳)-->  queued    (下次 claim 时 attempt_count += 1)
//! queued | running --cancel-->  cancelled
//! ```
//!
//! completed / failed / cancelled 为终态，任何迁移都返回 [`TransitionError::Terminal`]。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 任务 ID
pub type TaskId = String;
/// 线程 ID
pub type ThreadId = String;

/// Thread context 中标识目标实例的键
pub const TARGET_INSTANCE_KEY: &str = "instance_id";

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待认领
    Queued,
    /// 某个 Worker 持有租约执行中
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// 执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 仅知识问答，单轮，无工具
    Lookup,
    /// 单个有界工具调用循环
    Direct,
    /// Topics 扇出/汇总
    Deep,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Direct => "direct",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lookup" => Ok(Self::Lookup),
            "direct" => Ok(Self::Direct),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// 任务优先级（仅影响认领顺序）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl TaskPriority {
    pub fn from_i64(p: i64) -> Self {
        match p {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

/// 一个排队、由 Worker 执行、有终态结果的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub thread_id: ThreadId,
    /// 用户请求原文
    pub instructions: String,
    pub status: TaskStatus,
    pub strategy: Strategy,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    /// 被认领执行的次数（首次执行为 1）
    pub attempt_count: u32,
    /// 当前租约持有者
    pub lease_owner: Option<String>,
    /// 租约到期时间（毫秒时间戳）
    pub lease_expires_at: Option<i64>,
    /// 仅 completed 时存在
    pub result: Option<String>,
    /// 仅 failed 时存在
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(thread_id: impl Into<ThreadId>, instructions: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            thread_id: thread_id.into(),
            instructions: instructions.into(),
            status: TaskStatus::Queued,
            strategy,
            priority: TaskPriority::Normal,
            tags: Vec::new(),
            user_id: None,
            attempt_count: 0,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            error_message: None,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 租约在 now 时刻是否仍有效
    pub fn lease_active(&self, now: i64) -> bool {
        self.status == TaskStatus::Running && self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }

    /// 可被认领：排队中，或运行中但租约已过期
    pub fn is_claimable(&self, now: i64) -> bool {
        match self.status {
            TaskStatus::Queued => true,
            TaskStatus::Running => !self.lease_active(now),
            _ => false,
        }
    }

    /// 应用一次状态迁移；失败时任务保持不变
    pub fn apply(&mut self, transition: &Transition, now: i64) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }

        match transition {
            Transition::Claim { worker_id, lease_ms } => {
                if !self.is_claimable(now) {
                    return Err(TransitionError::LeaseHeld {
                        owner: self.lease_owner.clone().unwrap_or_default(),
                    });
                }
                self.status = TaskStatus::Running;
                self.lease_owner = Some(worker_id.clone());
                self.lease_expires_at = Some(now + lease_ms);
                self.attempt_count += 1;
                self.started_at.get_or_insert(now);
            }
            Transition::Renew { worker_id, extension_ms } => {
                self.ensure_owner(worker_id)?;
                self.lease_expires_at = Some(now + extension_ms);
            }
            Transition::Complete { worker_id, result } => {
                self.ensure_owner(worker_id)?;
                self.status = TaskStatus::Completed;
                self.result = Some(result.clone());
                self.finish(now);
            }
            Transition::Fail { worker_id, error } => {
                if let Some(worker_id) = worker_id {
                    self.ensure_owner(worker_id)?;
                }
                self.status = TaskStatus::Failed;
                self.error_message = Some(error.clone());
                self.finish(now);
            }
            Transition::Release { worker_id } => {
                self.ensure_owner(worker_id)?;
                self.status = TaskStatus::Queued;
                self.clear_lease();
            }
            Transition::Expire => {
                if self.status != TaskStatus::Running || self.lease_active(now) {
                    return Err(TransitionError::Invalid {
                        from: self.status,
                        action: "expire",
                    });
                }
                self.status = TaskStatus::Queued;
                self.clear_lease();
            }
            Transition::Cancel => {
                self.status = TaskStatus::Cancelled;
                self.finish(now);
            }
        }
        Ok(())
    }

    fn ensure_owner(&self, worker_id: &str) -> Result<(), TransitionError> {
        if self.status == TaskStatus::Running && self.lease_owner.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(TransitionError::LeaseNotHeld {
                worker_id: worker_id.to_string(),
            })
        }
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    fn finish(&mut self, now: i64) {
        self.clear_lease();
        self.completed_at = Some(now);
    }
}

/// 任务状态迁移请求
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// 认领（queued 或租约过期的 running）并设置租约
    Claim { worker_id: String, lease_ms: i64 },
    /// 心跳续约
    Renew { worker_id: String, extension_ms: i64 },
    Complete { worker_id: String, result: String },
    /// worker_id 为 None 表示非 Worker 发起（如重试次数耗尽时的判定）
    Fail { worker_id: Option<String>, error: String },
    /// 持有者主动归还租约，任务回到 queued
    Release { worker_id: String },
    /// 租约过期且无心跳，任务回到 queued
    Expire,
    Cancel,
}

/// 状态迁移失败原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task is already {0}")]
    Terminal(TaskStatus),

    #[error("lease is held by {owner}")]
    LeaseHeld { owner: String },

    #[error("lease is not held by {worker_id}")]
    LeaseNotHeld { worker_id: String },

    #[error("cannot {action} a {from} task")]
    Invalid { from: TaskStatus, action: &'static str },
}

/// Thread 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Thread 中的一条消息（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
    /// 产生该消息的任务
    pub task_id: Option<TaskId>,
}

impl ThreadMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_millis(),
            task_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub created_at: i64,
    pub updated_at: i64,
    pub tags: Vec<String>,
    /// 由 Scheduler 产生
    pub automated: bool,
    pub schedule_name: Option<String>,
}

/// 一次会话/排查的持久记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub subject: String,
    pub messages: Vec<ThreadMessage>,
    pub metadata: ThreadMetadata,
    /// 调用方提供的键值对（如目标实例），对写入该线程的每个任务可见
    pub context: BTreeMap<String, String>,
}

impl Thread {
    pub fn new(subject: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: format!("thread_{}", uuid::Uuid::new_v4()),
            subject: subject.into(),
            messages: Vec::new(),
            metadata: ThreadMetadata {
                created_at: now,
                updated_at: now,
                ..ThreadMetadata::default()
            },
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    pub fn automated(mut self, schedule_name: Option<String>) -> Self {
        self.metadata.automated = true;
        self.metadata.schedule_name = schedule_name;
        self
    }

    /// 绑定的目标实例（没有则不允许使用工具）
    pub fn target_instance(&self) -> Option<&str> {
        target_in(&self.context)
    }
}

/// context 中的目标实例；空白值视为未绑定
pub fn target_in(context: &BTreeMap<String, String>) -> Option<&str> {
    context
        .get(TARGET_INSTANCE_KEY)
        .map(|s| s.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// 由请求文本推导 Thread 主题：首行，最长 80 字符
pub fn derive_subject(text: &str) -> String {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let subject: String = first_line.chars().take(80).collect();
    if subject.is_empty() {
        "Untitled investigation".to_string()
    } else if first_line.chars().count() > 80 {
        format!("{}...", subject)
    } else {
        subject
    }
}

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    ToolCall,
    TopicFound,
    Response,
    Completion,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::ToolCall => "tool_call",
            Self::TopicFound => "topic_found",
            Self::Response => "response",
            Self::Completion => "completion",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_message" => Ok(Self::UserMessage),
            "tool_call" => Ok(Self::ToolCall),
            "topic_found" => Ok(Self::TopicFound),
            "response" => Ok(Self::Response),
            "completion" => Ok(Self::Completion),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// 任务运行时写入线程事件日志的一条进度通知（只追加，不修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 线程内单调递增序号，由存储在追加时分配
    pub seq: u64,
    pub thread_id: ThreadId,
    pub task_id: TaskId,
    pub timestamp: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            seq: 0,
            thread_id: String::new(),
            task_id: String::new(),
            timestamp: now_millis(),
            message: message.into(),
            event_type,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
