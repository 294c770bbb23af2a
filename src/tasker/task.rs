//! Task contract and the execution template around it.
//!
//! A [`Task`] is a plain unit of work. [`TaskExecution`] owns everything needed to
//! run it: the task id, the callback used to report the outcome, the cancel flag and
//! the interrupt token. The runner keeps a [`TaskHandle`] to cancel, interrupt and
//! reap the execution.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::tasker::status::TaskStatus;

pub const MSG_INTERRUPTED: &str = "Task execution was interrupted";
pub const MSG_PANIC: &str =
    "ERROR: Task execution interrupted due panic, see log file for details";

/// How a task failed. The variant decides whether the task is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Execution was interrupted, the task is retried later
    #[error("interrupted")]
    Interrupted,

    /// A resource the task works on does not exist (e.g. a search index).
    /// Not retried, the data has to be fixed first.
    #[error("{0}")]
    MissingResource(String),

    /// System error (timeout, unavailable service). The task is retried later.
    #[error("{0}")]
    Transient(String),

    /// Permanent failure, not retried
    #[error("{0}")]
    Permanent(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        TaskError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        TaskError::Permanent(msg.into())
    }

    pub fn missing_resource(msg: impl Into<String>) -> Self {
        TaskError::MissingResource(msg.into())
    }
}

/// Callback used by running tasks to report back. A task never touches the store directly.
#[async_trait]
pub trait TaskExecutionContext: Send + Sync {
    /// Report the final status of the task.
    async fn report_status(&self, task_id: &str, status: TaskStatus, message: Option<&str>);

    /// Append a line to the task processing log.
    async fn append_log(&self, task_id: &str, message: &str);
}

/// Long running task implementation.
#[async_trait]
pub trait Task: Send + Sync {
    /// Do the work. Implementations must check [`TaskContext::is_canceled_or_interrupted`]
    /// regularly and return as soon as it is true.
    ///
    /// Returning `Ok(())` finishes the task, or cancels it if cancellation was requested.
    /// Errors are mapped to statuses by [`TaskExecution`].
    async fn perform_task(&self, ctx: &TaskContext) -> Result<(), TaskError>;
}

/// Everything a running task may use: its id, the log, and the cancellation signals.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Arc<str>,
    callback: Arc<dyn TaskExecutionContext>,
    canceled: Arc<AtomicBool>,
    interrupt: CancellationToken,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn is_canceled_or_interrupted(&self) -> bool {
        self.is_canceled() || self.is_interrupted()
    }

    /// Resolves when the task is interrupted. Use it to abort blocking awaits.
    pub fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.interrupt.cancelled()
    }

    /// Sleep, returning `Err(TaskError::Interrupted)` if interrupted meanwhile.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.interrupt.cancelled() => Err(TaskError::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Write a line into the task processing log.
    pub async fn write_task_log(&self, message: &str) {
        self.callback.append_log(&self.task_id, message).await;
    }
}

/// One execution of a task, ready to be spawned.
pub struct TaskExecution {
    task: Arc<dyn Task>,
    context: TaskContext,
}

impl TaskExecution {
    pub fn new(
        task_id: impl Into<Arc<str>>,
        task: Box<dyn Task>,
        callback: Arc<dyn TaskExecutionContext>,
    ) -> Self {
        Self {
            task: Arc::from(task),
            context: TaskContext {
                task_id: task_id.into(),
                callback,
                canceled: Arc::new(AtomicBool::new(false)),
                interrupt: CancellationToken::new(),
            },
        }
    }

    /// Start the execution on its own tokio task.
    pub fn spawn(self) -> TaskHandle {
        let canceled = self.context.canceled.clone();
        let interrupt = self.context.interrupt.clone();
        let join = tokio::spawn(self.run());
        TaskHandle {
            canceled,
            interrupt,
            join,
        }
    }

    /// Perform the task and report exactly one final status.
    pub async fn run(self) {
        let ctx = self.context;
        tracing::debug!(task_id = %ctx.task_id, "Starting task");

        let task = self.task;
        let work_ctx = ctx.clone();
        let result = tokio::spawn(async move { task.perform_task(&work_ctx).await }).await;

        let (status, message) = map_outcome(
            &ctx.task_id,
            result,
            ctx.is_interrupted(),
            ctx.is_canceled(),
        );
        ctx.callback
            .report_status(&ctx.task_id, status, message.as_deref())
            .await;

        tracing::debug!(task_id = %ctx.task_id, status = %status, "Finished task");
    }
}

/// Map the result of [`Task::perform_task`] to the status written for the task.
fn map_outcome(
    task_id: &str,
    result: Result<Result<(), TaskError>, JoinError>,
    interrupted: bool,
    canceled: bool,
) -> (TaskStatus, Option<String>) {
    match result {
        Ok(Ok(())) if interrupted => (TaskStatus::Failover, Some(MSG_INTERRUPTED.to_string())),
        Ok(Ok(())) if canceled => (TaskStatus::Canceled, None),
        Ok(Ok(())) => (TaskStatus::FinishedOk, None),
        Ok(Err(TaskError::Interrupted)) => {
            (TaskStatus::Failover, Some(MSG_INTERRUPTED.to_string()))
        }
        Ok(Err(TaskError::MissingResource(msg))) => (
            TaskStatus::FinishedError,
            Some(format!("ERROR: Task finished due missing resource: {}", msg)),
        ),
        Ok(Err(TaskError::Transient(msg))) => (
            TaskStatus::Failover,
            Some(format!("ERROR: Task execution interrupted due {}", msg)),
        ),
        Ok(Err(TaskError::Permanent(msg))) => (
            TaskStatus::FinishedError,
            Some(format!("ERROR: Task finished due error: {}", msg)),
        ),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            tracing::error!(
                task_id,
                panic = panic_message(payload.as_ref()),
                "Task finished due panic"
            );
            (TaskStatus::Failover, Some(MSG_PANIC.to_string()))
        }
        Err(_) => (TaskStatus::Failover, Some(MSG_INTERRUPTED.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Runner side handle of a spawned [`TaskExecution`].
#[derive(Debug)]
pub struct TaskHandle {
    canceled: Arc<AtomicBool>,
    interrupt: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Request cooperative cancellation.
    pub fn set_canceled(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Interrupt blocking awaits of the task.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_canceled_or_interrupted(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.interrupt.is_cancelled()
    }

    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Wait for the execution to finish, including its final status report.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Task execution ended abnormally");
        }
    }
}
