//! Deep 策略端到端测试：路由 -> 采集 -> 分解 -> 扇出 -> 汇总

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use triage::llm::{CompletionMode, CompletionRequest, CompletionResponse, LlmError, MockCompletion, ToolCall};
use triage::store::{EventType, Strategy, TaskStatus};
use triage::tools::ToolRegistry;
use triage::{CreateTaskRequest, RuntimeBuilder};

use common::{fast_config, wait_terminal, CountingTool, SlowTool};

/// 分解出三个 Topic，其中两个标题归一化后相同
fn deep_script(request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
    match &request.mode {
        CompletionMode::Structured { .. } => Ok(CompletionResponse::Structured(json!({
            "topics": [
                { "title": "Memory pressure", "signal_refs": [0, 2] },
                { "title": "Slow commands", "signal_refs": [1] },
                { "title": "memory-pressure", "signal_refs": [2] }
            ]
        }))),
        CompletionMode::ToolChoice { .. } => {
            let prompt = request.prompt_text();
            let observed = request.messages.len() > 1;
            if prompt.contains("Topic topic-02") && !observed {
                return Ok(CompletionResponse::ToolCall(ToolCall::new(
                    "knowledge_search",
                    json!({ "query": "slowlog KEYS" }),
                )));
            }
            Ok(CompletionResponse::Text(
                json!({
                    "findings": "used_memory is close to maxmemory",
                    "recommended_actions": ["raise maxmemory", "review eviction policy"]
                })
                .to_string(),
            ))
        }
        CompletionMode::Text => Ok(CompletionResponse::Text("Two areas need attention.".to_string())),
    }
}

fn registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    for name in ["info", "slowlog", "memory_stats"] {
        tools.register(CountingTool::new(name).0);
    }
    tools.register(SlowTool::new("knowledge_search"));
    tools
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_comprehensive_audit_produces_section_per_topic() {
    let runtime = RuntimeBuilder::new(fast_config())
        .with_completion(Arc::new(MockCompletion::new(deep_script)))
        .with_tools(registry())
        .build()
        .await
        .unwrap();
    let pool = runtime.start();
    let service = runtime.service().clone();

    let handle = service
        .create_task(CreateTaskRequest::new("comprehensive audit of the cache").with_target("cache-prod-1"))
        .await
        .unwrap();
    assert_eq!(handle.strategy, Strategy::Deep);

    let view = wait_terminal(&service, &handle.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed, "error: {:?}", view.error);
    let report = view.result.unwrap();

    let topic_events: Vec<_> = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::TopicFound)
        .collect();
    assert_eq!(topic_events.len(), 2);

    // 报告段落数等于分解出的 Topic 数，且按 id 排序
    let sections: Vec<&str> = report.lines().filter(|l| l.starts_with("## topic-")).collect();
    assert_eq!(sections, vec!["## topic-01: Memory pressure", "## topic-02: Slow commands"]);

    // topic-02 唯一的工具调用超时：降级段落，其它段落正常
    assert!(report.contains("Investigation incomplete for Slow commands"));
    assert!(report.contains("raise maxmemory"));
    assert!(report.contains("Two areas need attention."));

    let scoped_calls: Vec<_> = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall)
        .filter(|e| e.metadata.get("topic_id").and_then(|v| v.as_str()) == Some("topic-02"))
        .collect();
    assert_eq!(scoped_calls.len(), 1);
    assert_eq!(scoped_calls[0].metadata["ok"], json!(false));

    let collected = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall && e.metadata.get("topic_id").is_none())
        .count();
    assert_eq!(collected, 3);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_decomposition_uses_catch_all_topic() {
    let completion = MockCompletion::new(|request| match &request.mode {
        CompletionMode::Structured { .. } => Err(LlmError::MalformedResponse("not json".into())),
        CompletionMode::ToolChoice { .. } => Ok(CompletionResponse::Text("Instance looks healthy.".into())),
        CompletionMode::Text => Ok(CompletionResponse::Text("Nothing urgent.".into())),
    });
    let runtime = RuntimeBuilder::new(fast_config())
        .with_completion(Arc::new(completion))
        .with_tools(registry())
        .build()
        .await
        .unwrap();
    let pool = runtime.start();
    let service = runtime.service().clone();

    let handle = service
        .create_task(
            CreateTaskRequest::new("check it")
                .with_target("cache-prod-1")
                .with_strategy(Strategy::Deep),
        )
        .await
        .unwrap();
    let view = wait_terminal(&service, &handle.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed);
    let report = view.result.unwrap();
    assert!(report.contains("## topic-01: General instance health review"));
    assert!(report.contains("Instance looks healthy."));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deep_override_without_target_runs_no_tools() {
    let mut tools = ToolRegistry::new();
    let mut counters: Vec<Arc<AtomicUsize>> = Vec::new();
    for name in ["info", "slowlog", "memory_stats", "knowledge_search"] {
        let (tool, calls) = CountingTool::new(name);
        tools.register(tool);
        counters.push(calls);
    }
    let runtime = RuntimeBuilder::new(fast_config())
        .with_completion(Arc::new(MockCompletion::new(deep_script)))
        .with_tools(tools)
        .build()
        .await
        .unwrap();
    let pool = runtime.start();
    let service = runtime.service().clone();

    let handle = service
        .create_task(CreateTaskRequest::new("comprehensive audit").with_strategy(Strategy::Deep))
        .await
        .unwrap();
    assert_eq!(handle.strategy, Strategy::Deep);

    let view = wait_terminal(&service, &handle.task_id).await;
    assert_eq!(view.status, TaskStatus::Completed, "error: {:?}", view.error);
    assert!(view.result.unwrap().contains("## topic-01: Memory pressure"));

    // 没有采集阶段的调用
    let unscoped = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall && e.metadata.get("topic_id").is_none())
        .count();
    assert_eq!(unscoped, 0);

    // 分支请求的工具被拒绝，没有真正执行
    assert!(view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::ToolCall)
        .all(|e| e.metadata["ok"] == json!(false)));
    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 0));

    pool.shutdown().await;
}
