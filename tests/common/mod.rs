//! 集成测试公共工具：测试配置、计数/慢速工具、等待任务终止

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use triage::config::AppConfig;
use triage::store::TaskStatus;
use triage::tools::{Tool, ToolError};
use triage::{InvestigationService, TaskView};

/// 快速轮询、短租约的测试配置
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.concurrency = 2;
    config.worker.poll_interval_ms = 20;
    config.worker.heartbeat_secs = 1;
    config.tools.tool_timeout_secs = 1;
    config.deep.initial_tools = vec!["info".into(), "slowlog".into(), "memory_stats".into()];
    config.deep.knowledge_tools = vec!["knowledge_search".into()];
    config
}

/// 轮询直到任务终止
pub async fn wait_terminal(service: &InvestigationService, task_id: &str) -> TaskView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = service.get_task(task_id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        assert!(tokio::time::Instant::now() < deadline, "task {task_id} still {}", view.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 轮询直到任务进入给定状态
pub async fn wait_status(service: &InvestigationService, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while service.get_task(task_id).await.unwrap().status != status {
        assert!(tokio::time::Instant::now() < deadline, "task {task_id} never reached {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 记录调用次数并回显参数的工具
pub struct CountingTool {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.to_string(),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a canned diagnostic payload"
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "tool": self.name, "args": args, "used_memory_human": "1.2G" }))
    }
}

/// 永远超时的工具
pub struct SlowTool {
    name: String,
}

impl SlowTool {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Searches the operations knowledge base"
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({ "hits": [] }))
    }
}
