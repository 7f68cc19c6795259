//! Task execution support: the cancellable task unit, the barrier-aware
//! task queue that drives stage progression, per-task accounting records,
//! and timing helpers.

pub mod queue;
pub mod task;
pub mod thread_data;
pub mod timer;

pub use queue::{TaskEntry, TaskQueue};
pub use task::{FatalErrorSink, Task, TaskContext, TaskPayload};
pub use thread_data::{RenderStats, SharedThreadData, ThreadData, TimeKind};
