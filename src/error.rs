use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskerError {
    #[error("Unsupported task type: {0}")]
    UnsupportedTask(String),

    #[error("Invalid task configuration: {0}")]
    TaskConfiguration(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Lock timeout for task {0}")]
    LockTimeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskerError {
    /// Errors raised by task validation, before anything is persisted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TaskerError::UnsupportedTask(_) | TaskerError::TaskConfiguration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
