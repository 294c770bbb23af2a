use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TaskerConfig;
use crate::error::Result;
use crate::persister::TaskPersister;
use crate::tasker::factory::TaskFactory;
use crate::tasker::info::{TaskConfig, TaskStatusInfo};
use crate::tasker::runner::TaskRunner;
use crate::tasker::status::TaskStatus;

struct RunnerHandle {
    runner: Arc<TaskRunner>,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

/// Entry point of the task subsystem on a node.
///
/// Validates and persists new tasks, answers queries, and owns the lifecycle of the
/// local [`TaskRunner`].
pub struct TaskManager {
    config: TaskerConfig,
    factory: Arc<dyn TaskFactory>,
    persister: Arc<dyn TaskPersister>,
    runner: Mutex<Option<RunnerHandle>>,
}

impl TaskManager {
    pub fn new(
        config: TaskerConfig,
        factory: Arc<dyn TaskFactory>,
        persister: Arc<dyn TaskPersister>,
    ) -> Self {
        Self {
            config,
            factory,
            persister,
            runner: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn persister(&self) -> &Arc<dyn TaskPersister> {
        &self.persister
    }

    /// Start the local runner. Does nothing if it already runs.
    pub async fn start_tasks_execution(&self) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return;
        }
        let task_runner = Arc::new(TaskRunner::new(
            self.config.node_id.clone(),
            self.factory.clone(),
            self.persister.clone(),
            self.config.runner.clone(),
        ));
        let stop = CancellationToken::new();
        let join = tokio::spawn(task_runner.clone().run(stop.clone()));
        *runner = Some(RunnerHandle {
            runner: task_runner,
            stop,
            join,
        });
    }

    /// Stop the local runner and wait until its tasks are interrupted.
    pub async fn stop_tasks_execution(&self) {
        let handle = self.runner.lock().await.take();
        if let Some(handle) = handle {
            handle.stop.cancel();
            if let Err(e) = handle.join.await {
                tracing::warn!(node_id = %self.config.node_id, error = %e, "Task runner ended abnormally");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.runner.lock().await.is_some()
    }

    pub fn list_supported_task_types(&self) -> Vec<String> {
        self.factory.list_supported_task_types()
    }

    /// Validate and persist a new task, returning its id.
    ///
    /// Validation instantiates the task once, so an unsupported type or invalid
    /// configuration fails here and nothing is stored.
    pub async fn create_task(
        &self,
        task_type: &str,
        task_config: Option<&TaskConfig>,
    ) -> Result<String> {
        self.factory.create_task(task_type, task_config)?;
        let id = self.persister.create_task(task_type, task_config).await?;
        tracing::info!(task_id = %id, task_type, "Task created");

        if let Some(handle) = self.runner.lock().await.as_ref() {
            handle.runner.notify_new_task_available_for_run();
        }
        Ok(id)
    }

    pub async fn get_task_status_info(&self, id: &str) -> Result<Option<TaskStatusInfo>> {
        self.persister.get_task_status_info(id).await
    }

    /// Request cancellation. Returns false if the task can't be canceled any more.
    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        if id.trim().is_empty() {
            return Ok(false);
        }
        let marked = self.persister.mark_task_to_be_cancelled(id).await?;
        if marked {
            tracing::info!(task_id = %id, "Task marked to be cancelled");
            if let Some(handle) = self.runner.lock().await.as_ref() {
                handle.runner.cancel_task(id).await;
            }
        }
        Ok(marked)
    }

    pub async fn list_tasks(
        &self,
        task_type: Option<&str>,
        statuses: &[TaskStatus],
        from: usize,
        size: usize,
    ) -> Result<Vec<TaskStatusInfo>> {
        self.persister
            .list_tasks(task_type, statuses, from, size)
            .await
    }
}
