//! 工具层：Tool 能力接口与注册表、诊断信封、TTL 缓存、带超时与审计的执行器、远端工具发现

pub mod cache;
pub mod echo;
pub mod envelope;
pub mod executor;
pub mod registry;
pub mod remote;
pub mod schema;

pub use cache::{normalize_args, ToolCache};
pub use echo::EchoTool;
pub use envelope::DiagnosticEnvelope;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolError, ToolRegistry, ToolSpec};
pub use remote::{RemoteTool, RemoteToolProvider};
pub use schema::tool_call_schema_json;
