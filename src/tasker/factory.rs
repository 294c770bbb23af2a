use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, TaskerError};
use crate::tasker::info::TaskConfig;
use crate::tasker::task::Task;

/// Creates task instances from their type and configuration.
///
/// `create_task` is used for validation too: the manager calls it before a task is
/// persisted and drops the instance.
pub trait TaskFactory: Send + Sync {
    /// Create a task instance.
    ///
    /// Returns [`TaskerError::UnsupportedTask`] for an unknown type and
    /// [`TaskerError::TaskConfiguration`] for a configuration the type rejects.
    fn create_task(&self, task_type: &str, task_config: Option<&TaskConfig>)
        -> Result<Box<dyn Task>>;

    fn list_supported_task_types(&self) -> Vec<String>;
}

type Constructor = Arc<dyn Fn(Option<&TaskConfig>) -> Result<Box<dyn Task>> + Send + Sync>;

/// [`TaskFactory`] backed by a map of task type to constructor.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `task_type`, replacing any previous one.
    pub fn register<F>(&mut self, task_type: impl Into<String>, constructor: F)
    where
        F: Fn(Option<&TaskConfig>) -> Result<Box<dyn Task>> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        tracing::debug!(task_type = %task_type, "Registered task type");
        self.constructors.insert(task_type, Arc::new(constructor));
    }

    pub fn with<F>(mut self, task_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(Option<&TaskConfig>) -> Result<Box<dyn Task>> + Send + Sync + 'static,
    {
        self.register(task_type, constructor);
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.constructors.contains_key(task_type)
    }
}

impl TaskFactory for TaskRegistry {
    fn create_task(
        &self,
        task_type: &str,
        task_config: Option<&TaskConfig>,
    ) -> Result<Box<dyn Task>> {
        let constructor = self
            .constructors
            .get(task_type)
            .ok_or_else(|| TaskerError::UnsupportedTask(task_type.to_string()))?;
        constructor(task_config)
    }

    fn list_supported_task_types(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.list_supported_task_types())
            .finish()
    }
}

// ============================================================================
// Configuration helpers
// ============================================================================

/// Mandatory non-blank string field of a task configuration.
pub fn config_str<'a>(task_config: Option<&'a TaskConfig>, key: &str) -> Result<&'a str> {
    match task_config.and_then(|cfg| cfg.get(key)) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(_) => Err(TaskerError::TaskConfiguration(format!(
            "{} must be a non empty string",
            key
        ))),
        None => Err(TaskerError::TaskConfiguration(format!("{} is missing", key))),
    }
}

/// Mandatory unsigned integer field of a task configuration.
pub fn config_u64(task_config: Option<&TaskConfig>, key: &str) -> Result<u64> {
    match task_config.and_then(|cfg| cfg.get(key)) {
        Some(value) => value.as_u64().ok_or_else(|| {
            TaskerError::TaskConfiguration(format!("{} must be a non negative integer", key))
        }),
        None => Err(TaskerError::TaskConfiguration(format!("{} is missing", key))),
    }
}

/// Optional unsigned integer field of a task configuration.
pub fn config_u64_or(task_config: Option<&TaskConfig>, key: &str, default: u64) -> Result<u64> {
    match task_config.and_then(|cfg| cfg.get(key)) {
        Some(_) => config_u64(task_config, key),
        None => Ok(default),
    }
}
