//! Shared store of task records.
//!
//! Every node of the cluster talks to the same store. Mutual exclusion between nodes
//! comes only from the row lock each backend takes around a read-modify-write of a
//! record, so no two nodes can claim the same task.

mod memory;
mod sqlite;

pub use memory::MemoryTaskPersister;
pub use sqlite::SqliteTaskPersister;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::tasker::info::{RunClaim, TaskConfig, TaskStatusInfo};
use crate::tasker::status::TaskStatus;

#[async_trait]
pub trait TaskPersister: Send + Sync {
    /// Persist a new task in `NEW` status and return its id.
    async fn create_task(&self, task_type: &str, task_config: Option<&TaskConfig>)
        -> Result<String>;

    /// List tasks, newest first.
    ///
    /// A blank `task_type` and an empty `statuses` slice do not filter. `size == 0`
    /// means no limit.
    async fn list_tasks(
        &self,
        task_type: Option<&str>,
        statuses: &[TaskStatus],
        from: usize,
        size: usize,
    ) -> Result<Vec<TaskStatusInfo>>;

    async fn get_task_status_info(&self, id: &str) -> Result<Option<TaskStatusInfo>>;

    /// Request cancellation. Returns false if the task is unknown, finished, already
    /// marked, or its lock could not be taken in time.
    async fn mark_task_to_be_cancelled(&self, id: &str) -> Result<bool>;

    /// Apply a status transition. Returns false for unknown ids and transitions the
    /// status table does not allow.
    async fn change_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Like [`TaskPersister::change_task_status`], but only while the record still runs
    /// under `claim`. Used to report job outcomes, so a job which lost its record to a
    /// failover cannot overwrite the state written by the new owner.
    async fn change_task_status_for_run(
        &self,
        id: &str,
        claim: &RunClaim,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Append a line to the task processing log.
    async fn write_task_log(&self, id: &str, message: &str) -> Result<()>;

    /// Claim the oldest task which may run on `node_id` now and switch it to `RUNNING`.
    ///
    /// Candidates with a pending cancel request, or failover tasks out of attempts, are
    /// canceled on the way. Candidates locked by another node are skipped.
    async fn get_task_to_run(&self, node_id: &str) -> Result<Option<TaskStatusInfo>>;

    /// Refresh heartbeats of tasks running on `node_id` and fail over `RUNNING` tasks
    /// whose heartbeat is older than `failover_timeout`.
    async fn heartbeat(
        &self,
        node_id: &str,
        running_task_ids: &HashSet<String>,
        failover_timeout: Duration,
    ) -> Result<()>;
}

/// In-memory paging of a listing which is already sorted newest first.
fn page<T>(items: Vec<T>, from: usize, size: usize) -> Vec<T> {
    let items = items.into_iter().skip(from);
    if size == 0 {
        items.collect()
    } else {
        items.take(size).collect()
    }
}

/// Treat blank type filters as no filter.
fn type_filter(task_type: Option<&str>) -> Option<&str> {
    task_type.map(str::trim).filter(|t| !t.is_empty())
}
