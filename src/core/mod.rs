//! 核心层：错误分类与恢复策略、优雅关闭、运行时装配

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use builder::{create_runtime_builder, Runtime, RuntimeBuilder};
pub use error::{RecoveryAction, TriageError};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
