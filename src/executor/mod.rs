// Executor module - runs tasks against hosts

pub mod result;
pub mod scheduler;
pub mod task;

pub use result::{AggregatedResult, TaskError, TaskPanicked, TaskResult};
pub use scheduler::Scheduler;
pub use task::{
    task_fn, FnTask, Outcome, Task, TaskContext, TaskHandle, TaskParams, UnexpectedParam,
};
