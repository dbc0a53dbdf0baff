//! 运行中任务的进度写入：事件日志 + 线程中的 tool 消息

use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::TriageError;
use crate::store::{Event, EventType, TaskId, ThreadId, ThreadMessage};
use crate::tasks::TaskManager;
use crate::tools::{DiagnosticEnvelope, ToolError};

/// 线程消息与事件中工具结果的预览长度
const TOOL_PREVIEW_CHARS: usize = 500;

#[derive(Clone)]
pub struct EventEmitter {
    manager: Arc<TaskManager>,
    task_id: TaskId,
    thread_id: ThreadId,
}

impl EventEmitter {
    pub fn new(manager: Arc<TaskManager>, task_id: impl Into<TaskId>, thread_id: impl Into<ThreadId>) -> Self {
        Self {
            manager,
            task_id: task_id.into(),
            thread_id: thread_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn emit(&self, event: Event) -> Result<Event, TriageError> {
        self.manager.emit(&self.thread_id, &self.task_id, event).await
    }

    pub async fn response(&self, message: impl Into<String>) -> Result<Event, TriageError> {
        self.emit(Event::new(EventType::Response, message)).await
    }

    /// 记录一次工具调用：tool_call 事件 + 线程中的 tool 消息
    pub async fn tool_call(
        &self,
        tool: &str,
        args: &Value,
        outcome: &Result<DiagnosticEnvelope, ToolError>,
        scope: Option<&str>,
    ) -> Result<(), TriageError> {
        let (ok, preview) = match outcome {
            Ok(envelope) => (true, envelope.preview(TOOL_PREVIEW_CHARS)),
            Err(e) => (false, e.to_string()),
        };
        let mut metadata = json!({
            "tool": tool,
            "args": args,
            "ok": ok,
        });
        if let Some(scope) = scope {
            metadata["topic_id"] = json!(scope);
        }
        self.emit(Event::new(EventType::ToolCall, format!("{tool}: {preview}")).with_metadata(metadata))
            .await?;
        self.manager
            .append_message(
                &self.thread_id,
                ThreadMessage::tool(format!("[{tool}] {preview}")).for_task(&self.task_id),
            )
            .await
    }
}
