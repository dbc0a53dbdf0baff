//! Triage - 数据存储实例自动排查系统
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、优雅关闭、运行时装配
//! - **llm**: 补全服务客户端（OpenAI 兼容 / Mock）、提示协议、超时与重试
//! - **observability**: 日志初始化
//! - **react**: 有界工具调用循环
//! - **router**: 请求分类（lookup / direct / deep）
//! - **service**: 对外服务门面（提交、轮询、取消、线程、订阅、计划触发）
//! - **store**: 任务/线程/事件持久化与租约队列（内存 / SQLite）
//! - **strategy**: Lookup、Direct、Deep（Topics 扇出/汇总）执行器
//! - **tasks**: 任务生命周期管理与进度事件写入
//! - **tools**: 工具注册表、TTL 缓存、执行器、远端工具提供方
//! - **worker**: Worker 池与租约心跳

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod router;
pub mod service;
pub mod store;
pub mod strategy;
pub mod tasks;
pub mod tools;
pub mod worker;

pub use crate::core::{Runtime, RuntimeBuilder, TriageError};
pub use crate::service::{CreateTaskRequest, InvestigationService, ScheduleRun, TaskHandle, TaskView};
