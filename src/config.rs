//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAGE__*` 覆盖（双下划线表示嵌套，如 `TRIAGE__WORKER__CONCURRENCY=8`）。
//! 加载完成后 AppConfig 视为不可变，各组件从中派生自己的配置结构体并在构造时传入。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub worker: WorkerSection,
    pub tools: ToolsSection,
    pub deep: DeepSection,
    pub store: StoreSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 默认日志级别，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_app_name() -> String {
    "triage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [llm] 段：补全服务后端、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [llm.retry] 段：可重试错误的指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct LlmRetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

/// [router] 段：触发 Deep 策略的关键词与分类调用预算
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_trigger_terms")]
    pub trigger_terms: Vec<String>,
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            trigger_terms: default_trigger_terms(),
            classify_timeout_ms: default_classify_timeout_ms(),
        }
    }
}

fn default_trigger_terms() -> Vec<String> {
    vec![
        "full".into(),
        "comprehensive".into(),
        "audit".into(),
        "triage".into(),
        "deep dive".into(),
        "health check".into(),
    ]
}

fn default_classify_timeout_ms() -> u64 {
    3000
}

/// [worker] 段：并发度、租约与心跳
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 单个任务最多被认领执行的次数（含重投递）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lease_secs: default_lease_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    300
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

/// [tools] 段：工具超时、缓存 TTL、循环步数上限、外部工具提供方地址
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    pub provider_url: Option<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_iterations: default_max_iterations(),
            provider_url: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_iterations() -> usize {
    25
}

/// [deep] 段：采集阶段的初始工具、研究分支可用的知识工具、分支并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct DeepSection {
    #[serde(default = "default_initial_tools")]
    pub initial_tools: Vec<String>,
    #[serde(default = "default_knowledge_tools")]
    pub knowledge_tools: Vec<String>,
    #[serde(default = "default_max_parallel_topics")]
    pub max_parallel_topics: usize,
}

impl Default for DeepSection {
    fn default() -> Self {
        Self {
            initial_tools: default_initial_tools(),
            knowledge_tools: default_knowledge_tools(),
            max_parallel_topics: default_max_parallel_topics(),
        }
    }
}

fn default_initial_tools() -> Vec<String> {
    vec![
        "info".into(),
        "slowlog".into(),
        "memory_stats".into(),
        "latency_doctor".into(),
        "client_list".into(),
    ]
}

fn default_knowledge_tools() -> Vec<String> {
    vec!["knowledge_search".into()]
}

fn default_max_parallel_topics() -> usize {
    4
}

/// [store] 段：memory（默认）或 sqlite（需 async-sqlite feature）
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/triage.db")
}

impl WorkerSection {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// 从 config 目录加载配置，环境变量 TRIAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    // 显式指定的文件必须存在且可解析
    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAGE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("router.trigger_terms")
            .with_list_parse_key("deep.initial_tools")
            .with_list_parse_key("deep.knowledge_tools")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.lease(), Duration::from_secs(300));
        assert_eq!(config.tools.tool_timeout_secs, 60);
        assert_eq!(config.tools.max_iterations, 25);
        assert!(config.router.trigger_terms.iter().any(|t| t == "audit"));
        assert_eq!(config.store.backend, "memory");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.toml");
        std::fs::write(
            &path,
            "[worker]\nconcurrency = 8\nlease_secs = 30\n\n[tools]\nmax_iterations = 5\n",
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.lease_secs, 30);
        assert_eq!(config.tools.max_iterations, 5);
        // 未覆盖的键保持默认
        assert_eq!(config.worker.max_attempts, 3);
    }
}
