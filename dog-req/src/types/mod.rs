pub mod ids;
pub mod task;
pub mod ctx;
pub mod stats;

pub use ids::{LockToken, QueueId, TaskId};
pub use task::Task;
pub use ctx::QueueCtx;
pub use stats::QueueStats;
