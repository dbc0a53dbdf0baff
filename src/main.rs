//! Triage 命令行入口
//!
//! 加载配置、初始化日志、启动 Worker 池，提交命令行中的请求（目标实例取自 TRIAGE_TARGET_INSTANCE），
//! 把线程事件实时打印到标准输出，任务终止后输出结果。

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use triage::core::{create_runtime_builder, ShutdownReason};
use triage::store::EventType;
use triage::CreateTaskRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("usage: triage <request>   (set TRIAGE_TARGET_INSTANCE to investigate a live instance)");
    }

    let builder = create_runtime_builder(std::env::var("TRIAGE_CONFIG").ok().map(Into::into))
        .context("Failed to load configuration")?;
    triage::observability::init(&builder.config().app.log_level);
    let runtime = builder.build().await.context("Failed to assemble runtime")?;
    runtime.shutdown().install_signal_handlers();
    let pool = runtime.start();

    let mut request = CreateTaskRequest::new(query);
    if let Ok(target) = std::env::var("TRIAGE_TARGET_INSTANCE") {
        request = request.with_target(target);
    }
    let service = runtime.service().clone();
    let handle = service.create_task(request).await.context("Failed to submit task")?;
    println!("task {} on thread {} ({})", handle.task_id, handle.thread_id, handle.strategy);

    // 先订阅再补齐，避免漏掉订阅前已写入的事件
    let mut events = service.subscribe(&handle.thread_id);
    let mut last_seq = 0;
    for event in service.events_since(&handle.thread_id, 0).await? {
        last_seq = event.seq;
        println!("[{}] {}", event.event_type.as_str(), event.message);
    }

    loop {
        let view = service.get_task(&handle.task_id).await?;
        if view.is_terminal() {
            break;
        }
        tokio::select! {
            _ = runtime.shutdown().wait_for_shutdown() => break,
            received = events.recv() => match received {
                Ok(event) if event.seq > last_seq => {
                    last_seq = event.seq;
                    if event.event_type != EventType::Response {
                        println!("[{}] {}", event.event_type.as_str(), event.message);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    for event in service.events_since(&handle.thread_id, last_seq).await? {
                        last_seq = event.seq;
                        println!("[{}] {}", event.event_type.as_str(), event.message);
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let view = service.get_task(&handle.task_id).await?;
    match (&view.result, &view.error) {
        (Some(result), _) => println!("\n{result}"),
        (None, Some(error)) => eprintln!("\ntask {}: {error}", view.status),
        (None, None) => eprintln!("\ntask {}", view.status),
    }

    runtime.shutdown().shutdown(ShutdownReason::Finished);
    pool.join().await;
    Ok(())
}
