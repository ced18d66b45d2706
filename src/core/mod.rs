//! 核心编排层：任务模型、任务图与构建、派发、调度、请求监管

pub mod dispatch;
pub mod error;
pub mod graph;
pub mod planner;
pub mod scheduler;
pub mod supervisor;
pub mod task;

pub use dispatch::Dispatcher;
pub use error::{ErrorKind, HiveError, TaskError};
pub use graph::TaskGraph;
pub use planner::TaskGraphBuilder;
pub use scheduler::{RequestOutcome, Scheduler, TaskReport};
pub use supervisor::RequestSupervisor;
pub use task::{
    ActionRequest, ActionSuggestion, EdgeKind, Role, Task, TaskId, TaskOrigin, TaskResult, TaskState,
    TaskStatus,
};
