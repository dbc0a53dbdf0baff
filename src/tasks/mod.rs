//! 任务层：生命周期管理与运行期事件写入

pub mod emitter;
pub mod manager;

pub use emitter::EventEmitter;
pub use manager::{NewTask, TaskManager};
