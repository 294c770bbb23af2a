use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::StoreConfig;
use crate::error::{Result, TaskerError};
use crate::persister::{page, type_filter, TaskPersister};
use crate::tasker::info::{now, HeartbeatOutcome, RunClaim, TaskConfig, TaskStatusInfo};
use crate::tasker::status::TaskStatus;

type Record = Arc<Mutex<TaskStatusInfo>>;

#[derive(Debug)]
struct Row {
    created_at: DateTime<Utc>,
    /// Insertion order, breaks ties between records created in the same millisecond
    seq: u64,
    record: Record,
}

/// Task store held in process memory.
///
/// Each record sits behind its own mutex, which plays the role of a database row lock.
/// Cloning the persister shares the table, so one instance can serve several
/// simulated nodes.
#[derive(Debug, Clone)]
pub struct MemoryTaskPersister {
    rows: Arc<RwLock<HashMap<String, Row>>>,
    seq: Arc<AtomicU64>,
    config: StoreConfig,
}

impl Default for MemoryTaskPersister {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryTaskPersister {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Insert a record as is. Lets tests set up records in any state.
    pub async fn put(&self, info: TaskStatusInfo) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write().await;
        match rows.get_mut(&info.id) {
            Some(row) => {
                row.created_at = info.created_at;
                *row.record.lock().await = info;
            }
            None => {
                rows.insert(
                    info.id.clone(),
                    Row {
                        created_at: info.created_at,
                        seq,
                        record: Arc::new(Mutex::new(info)),
                    },
                );
            }
        }
    }

    async fn record(&self, id: &str) -> Option<Record> {
        self.rows.read().await.get(id).map(|row| row.record.clone())
    }

    /// Records oldest first, cloned out so no table lock is held while rows are locked.
    async fn all_records(&self) -> Vec<Record> {
        let rows = self.rows.read().await;
        let mut records: Vec<_> = rows
            .values()
            .map(|row| (row.created_at, row.seq, row.record.clone()))
            .collect();
        records.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        records.into_iter().map(|(_, _, record)| record).collect()
    }

    /// Lock a row, giving up after the configured lock timeout.
    async fn lock(&self, record: &Record) -> Option<OwnedMutexGuard<TaskStatusInfo>> {
        tokio::time::timeout(self.config.lock_timeout, record.clone().lock_owned())
            .await
            .ok()
    }

    async fn lock_by_id(&self, id: &str) -> Result<Option<OwnedMutexGuard<TaskStatusInfo>>> {
        let Some(record) = self.record(id).await else {
            return Ok(None);
        };
        match self.lock(&record).await {
            Some(guard) => Ok(Some(guard)),
            None => Err(TaskerError::LockTimeout(id.to_string())),
        }
    }
}

#[async_trait]
impl TaskPersister for MemoryTaskPersister {
    async fn create_task(
        &self,
        task_type: &str,
        task_config: Option<&TaskConfig>,
    ) -> Result<String> {
        let info = TaskStatusInfo::new(task_type, task_config)?;
        let id = info.id.clone();
        self.put(info).await;
        tracing::debug!(task_id = %id, task_type, "Task created");
        Ok(id)
    }

    async fn list_tasks(
        &self,
        task_type: Option<&str>,
        statuses: &[TaskStatus],
        from: usize,
        size: usize,
    ) -> Result<Vec<TaskStatusInfo>> {
        let task_type = type_filter(task_type);
        let mut matching = Vec::new();
        for record in self.all_records().await.into_iter().rev() {
            let info = record.lock().await.clone();
            if task_type.is_some_and(|t| t != info.task_type) {
                continue;
            }
            if !statuses.is_empty() && !statuses.contains(&info.status) {
                continue;
            }
            matching.push(info);
        }
        Ok(page(matching, from, size))
    }

    async fn get_task_status_info(&self, id: &str) -> Result<Option<TaskStatusInfo>> {
        match self.record(id).await {
            Some(record) => Ok(Some(record.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn mark_task_to_be_cancelled(&self, id: &str) -> Result<bool> {
        let Some(record) = self.record(id).await else {
            return Ok(false);
        };
        let Some(mut info) = self.lock(&record).await else {
            tracing::debug!(task_id = %id, "Lock timeout while marking task to be cancelled");
            return Ok(false);
        };
        Ok(info.request_cancel())
    }

    async fn change_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let Some(mut info) = self.lock_by_id(id).await? else {
            return Ok(false);
        };
        Ok(info.change_status(status, message, now()))
    }

    async fn change_task_status_for_run(
        &self,
        id: &str,
        claim: &RunClaim,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let Some(mut info) = self.lock_by_id(id).await? else {
            return Ok(false);
        };
        if !info.is_running_under(claim) {
            return Ok(false);
        }
        Ok(info.change_status(status, message, now()))
    }

    async fn write_task_log(&self, id: &str, message: &str) -> Result<()> {
        match self.lock_by_id(id).await? {
            Some(mut info) => {
                info.append_processing_log(message);
                Ok(())
            }
            None => Err(TaskerError::TaskNotFound(id.to_string())),
        }
    }

    async fn get_task_to_run(&self, node_id: &str) -> Result<Option<TaskStatusInfo>> {
        let policy = &self.config.failover;

        for record in self.all_records().await {
            let Some(mut info) = self.lock(&record).await else {
                tracing::debug!(node_id, "Task locked by another node, skipping");
                continue;
            };
            let at = now();
            if !info.is_runnable_now(node_id, policy, at) {
                continue;
            }
            if info.start_task_execution(node_id, policy.max_attempts, at) {
                tracing::info!(task_id = %info.id, node_id, run_count = info.run_count, "Task claimed");
                return Ok(Some(info.clone()));
            }
            if info.status == TaskStatus::Canceled {
                tracing::info!(task_id = %info.id, node_id, "Task canceled before start");
            }
        }
        Ok(None)
    }

    async fn heartbeat(
        &self,
        node_id: &str,
        running_task_ids: &HashSet<String>,
        failover_timeout: Duration,
    ) -> Result<()> {
        for record in self.all_records().await {
            let Some(mut info) = self.lock(&record).await else {
                tracing::debug!(node_id, "Task locked during heartbeat, skipping");
                continue;
            };
            let outcome = info.heartbeat_check(node_id, running_task_ids, failover_timeout, now());
            if outcome == HeartbeatOutcome::FailedOver {
                tracing::info!(
                    task_id = %info.id,
                    node_id,
                    previous_node = info.execution_node_id.as_deref().unwrap_or(""),
                    "Task failed over due stale heartbeat"
                );
            }
        }
        Ok(())
    }
}
