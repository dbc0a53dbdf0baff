//! 有界工具调用循环（Direct 策略与 Deep 扇出分支共用）

pub mod loop_;

pub use loop_::{bind_target, LoopConfig, LoopOutcome, LoopRequest, StopReason, ToolLoop, ToolStep, MAX_ITERATIONS_MARKER};
