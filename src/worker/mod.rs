//! Worker 池与租约心跳

mod heartbeat;
mod pool;

pub use heartbeat::Heartbeat;
pub use pool::{WorkerConfig, WorkerPool, WorkerPoolHandle};
