pub mod builtin;
pub mod factory;
pub mod info;
pub mod manager;
pub mod runner;
pub mod status;
pub mod task;

pub use factory::{TaskFactory, TaskRegistry};
pub use info::{RunClaim, TaskConfig, TaskStatusInfo};
pub use manager::TaskManager;
pub use runner::TaskRunner;
pub use status::TaskStatus;
pub use task::{Task, TaskContext, TaskError, TaskExecution, TaskExecutionContext, TaskHandle};
