//! 运行时构建器：统一的组件装配逻辑
//!
//! 配置 -> 存储 -> 补全栈 -> 工具注册表/执行器 -> Router -> 策略 -> Worker 池 -> 服务门面。
//! 每个组件都可以在测试中替换（with_store / with_completion / with_tools）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{ShutdownManager, TriageError};
use crate::llm::{create_completion_from_config, CompletionClient};
use crate::react::{LoopConfig, ToolLoop};
use crate::router::{Router, RouterConfig};
use crate::service::InvestigationService;
use crate::store::{MemoryStore, Store};
use crate::strategy::{DeepConfig, StrategySet};
use crate::tasks::TaskManager;
use crate::tools::{EchoTool, RemoteToolProvider, ToolCache, ToolExecutor, ToolRegistry};
use crate::worker::{WorkerConfig, WorkerPool, WorkerPoolHandle};

pub struct RuntimeBuilder {
    config: AppConfig,
    store: Option<Arc<dyn Store>>,
    completion: Option<Arc<dyn CompletionClient>>,
    tools: Option<ToolRegistry>,
    shutdown: Option<Arc<ShutdownManager>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            completion: None,
            tools: None,
            shutdown: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// 使用给定的工具注册表（不再访问远端工具提供方）
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    async fn build_store(&self) -> Result<Arc<dyn Store>, TriageError> {
        match self.config.store.backend.to_lowercase().as_str() {
            "memory" => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "async-sqlite")]
            "sqlite" => {
                let path = &self.config.store.sqlite_path;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| TriageError::Config(format!("cannot create {}: {e}", parent.display())))?;
                }
                let store = crate::store::SqliteStore::open(path).await?;
                tracing::info!(path = %path.display(), "using sqlite store");
                Ok(Arc::new(store))
            }
            other => Err(TriageError::Config(format!(
                "unsupported store backend '{other}' (sqlite requires the async-sqlite feature)"
            ))),
        }
    }

    /// 工具注册表：远端提供方；未配置时注册回显工具作为演练替身
    async fn build_tool_registry(&self) -> Result<ToolRegistry, TriageError> {
        let mut tools = ToolRegistry::new();
        if let Some(url) = &self.config.tools.provider_url {
            let provider = RemoteToolProvider::new(url, Duration::from_secs(self.config.tools.tool_timeout_secs))?;
            provider.register_into(&mut tools).await?;
            return Ok(tools);
        }

        tracing::warn!("no tool provider configured, registering echo tools for a dry run");
        for name in self
            .config
            .deep
            .initial_tools
            .iter()
            .chain(self.config.deep.knowledge_tools.iter())
        {
            if !tools.contains(name) {
                tools.register(EchoTool::named(name));
            }
        }
        Ok(tools)
    }

    pub async fn build(mut self) -> Result<Runtime, TriageError> {
        let store = match self.store.take() {
            Some(store) => store,
            None => self.build_store().await?,
        };
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => create_completion_from_config(&self.config),
        };
        let tools = match self.tools.take() {
            Some(tools) => tools,
            None => self.build_tool_registry().await?,
        };
        let shutdown = self.shutdown.take().unwrap_or_else(|| Arc::new(ShutdownManager::new()));

        let cache = Arc::new(ToolCache::new(Duration::from_secs(self.config.tools.cache_ttl_secs)));
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(tools),
            cache.clone(),
            Duration::from_secs(self.config.tools.tool_timeout_secs),
        ));
        let tool_loop = Arc::new(ToolLoop::new(
            completion.clone(),
            executor.clone(),
            LoopConfig::from_config(&self.config.tools),
        ));
        let strategies = StrategySet::standard(
            completion.clone(),
            tool_loop,
            DeepConfig::from_config(&self.config.deep),
        );

        let manager = Arc::new(TaskManager::new(store));
        let router = Arc::new(Router::new(completion, RouterConfig::from_config(&self.config.router)));
        let service = Arc::new(InvestigationService::new(manager.clone(), router));
        let pool = Arc::new(WorkerPool::new(
            manager.clone(),
            strategies,
            WorkerConfig::from_config(&self.config.worker),
            shutdown.token(),
        )
        .with_tool_cache(cache));

        tracing::info!(
            tools = executor.tool_names().len(),
            store = %self.config.store.backend,
            "runtime assembled"
        );
        Ok(Runtime {
            config: self.config,
            manager,
            service,
            executor,
            pool,
            shutdown,
        })
    }
}

/// 装配完成的运行时：服务门面 + Worker 池 + 关闭信号
pub struct Runtime {
    config: AppConfig,
    manager: Arc<TaskManager>,
    service: Arc<InvestigationService>,
    executor: Arc<ToolExecutor>,
    pool: Arc<WorkerPool>,
    shutdown: Arc<ShutdownManager>,
}

impl Runtime {
    /// 启动 Worker 池
    pub fn start(&self) -> WorkerPoolHandle {
        self.pool.start()
    }

    pub fn service(&self) -> &Arc<InvestigationService> {
        &self.service
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn shutdown(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 便捷函数：加载配置并创建构建器
///
/// 显式给出的配置文件缺失或无法解析时返回错误；未指定时默认配置加载失败则退回内置默认值。
pub fn create_runtime_builder(config_path: Option<PathBuf>) -> Result<RuntimeBuilder, TriageError> {
    let explicit = config_path.is_some();
    let config = match crate::config::load_config(config_path) {
        Ok(config) => config,
        Err(e) if explicit => return Err(e.into()),
        Err(e) => {
            tracing::warn!("Config load failed ({}), using defaults", e);
            AppConfig::default()
        }
    };
    Ok(RuntimeBuilder::new(config))
}
