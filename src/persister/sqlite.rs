use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};

use crate::config::StoreConfig;
use crate::error::{Result, TaskerError};
use crate::persister::{type_filter, TaskPersister};
use crate::tasker::info::{now, HeartbeatOutcome, RunClaim, TaskConfig, TaskStatusInfo};
use crate::tasker::status::TaskStatus;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    task_type TEXT NOT NULL,
    task_config TEXT,
    status TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    last_run_started_at_ms INTEGER,
    last_run_finished_at_ms INTEGER,
    run_count INTEGER NOT NULL DEFAULT 0,
    execution_node_id TEXT,
    heartbeat_ms INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    processing_log TEXT
);
CREATE INDEX IF NOT EXISTS tasks_status_created ON tasks(status, created_at_ms);
";

const COLUMNS: &str = "id, task_type, task_config, status, created_at_ms, last_run_started_at_ms, \
     last_run_finished_at_ms, run_count, execution_node_id, heartbeat_ms, cancel_requested, processing_log";

/// Task store on a SQLite database file.
///
/// Every read-modify-write runs in a `BEGIN IMMEDIATE` transaction. The database write
/// lock is the row lock and `busy_timeout` is the lock timeout, so any number of
/// processes opening the same file coordinate through it.
#[derive(Debug, Clone)]
pub struct SqliteTaskPersister {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    config: StoreConfig,
}

impl SqliteTaskPersister {
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(config.lock_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "Opened task database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Insert or replace a record as is. Lets tests set up records in any state.
    pub async fn put(&self, info: TaskStatusInfo) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists = tx
                .query_row("SELECT 1 FROM tasks WHERE id=?1", params![info.id], |_| Ok(()))
                .optional()?
                .is_some();
            if exists {
                update_info(&tx, &info)?;
                tx.execute(
                    "UPDATE tasks SET created_at_ms=?2 WHERE id=?1",
                    params![info.id, info.created_at.timestamp_millis()],
                )?;
            } else {
                insert_info(&tx, &info)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Run blocking database work off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| TaskerError::Internal("database connection poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| TaskerError::Internal(format!("database task failed: {}", e)))?
    }

    /// Read-modify-write of one record under the database write lock.
    ///
    /// `f` returns whether the record changed. Unknown ids yield `Ok(None)`.
    async fn update_one<T, F>(&self, id: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut TaskStatusInfo) -> (bool, T) + Send + 'static,
        T: Send + 'static,
    {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn, &id)?;
            let Some(mut info) = select_info(&tx, &id)? else {
                return Ok(None);
            };
            let (changed, result) = f(&mut info);
            if changed {
                update_info(&tx, &info)?;
                tx.commit()?;
            }
            Ok(Some(result))
        })
        .await
    }
}

#[async_trait]
impl TaskPersister for SqliteTaskPersister {
    async fn create_task(
        &self,
        task_type: &str,
        task_config: Option<&TaskConfig>,
    ) -> Result<String> {
        let info = TaskStatusInfo::new(task_type, task_config)?;
        let id = info.id.clone();
        self.with_conn(move |conn| {
            insert_info(conn, &info)?;
            Ok(())
        })
        .await?;
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
        let mut sql = format!("SELECT {} FROM tasks WHERE 1=1", COLUMNS);
        let mut values = Vec::new();
        if let Some(task_type) = type_filter(task_type) {
            sql.push_str(" AND task_type=?");
            values.push(Value::Text(task_type.to_string()));
        }
        if !statuses.is_empty() {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        sql.push_str(" ORDER BY created_at_ms DESC, seq DESC LIMIT ? OFFSET ?");
        let limit = if size == 0 { -1 } else { to_sqlite_i64(size) };
        values.push(Value::Integer(limit));
        values.push(Value::Integer(to_sqlite_i64(from)));

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), read_info)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_task_status_info(&self, id: &str) -> Result<Option<TaskStatusInfo>> {
        let id = id.to_string();
        self.with_conn(move |conn| select_info(conn, &id)).await
    }

    async fn mark_task_to_be_cancelled(&self, id: &str) -> Result<bool> {
        let result = self
            .update_one(id, |info| {
                let marked = info.request_cancel();
                (marked, marked)
            })
            .await;
        match result {
            Ok(marked) => Ok(marked.unwrap_or(false)),
            Err(TaskerError::LockTimeout(_)) => {
                tracing::debug!(task_id = %id, "Lock timeout while marking task to be cancelled");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn change_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let message = message.map(str::to_string);
        let changed = self
            .update_one(id, move |info| {
                let changed = info.change_status(status, message.as_deref(), now());
                (changed, changed)
            })
            .await?;
        Ok(changed.unwrap_or(false))
    }

    async fn change_task_status_for_run(
        &self,
        id: &str,
        claim: &RunClaim,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let claim = claim.clone();
        let message = message.map(str::to_string);
        let changed = self
            .update_one(id, move |info| {
                let changed = info.is_running_under(&claim)
                    && info.change_status(status, message.as_deref(), now());
                (changed, changed)
            })
            .await?;
        Ok(changed.unwrap_or(false))
    }

    async fn write_task_log(&self, id: &str, message: &str) -> Result<()> {
        let message = message.to_string();
        self.update_one(id, move |info| {
            let before = info.processing_log.clone();
            info.append_processing_log(&message);
            (info.processing_log != before, ())
        })
        .await?
        .ok_or_else(|| TaskerError::TaskNotFound(id.to_string()))
    }

    async fn get_task_to_run(&self, node_id: &str) -> Result<Option<TaskStatusInfo>> {
        let node_id = node_id.to_string();
        let policy = self.config.failover.clone();
        let log_node_id = node_id.clone();
        let result = self
            .with_conn(move |conn| {
                let tx = begin_immediate(conn, "*")?;
                let candidates = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM tasks WHERE status IN ('NEW', 'FAILOVER') \
                         ORDER BY created_at_ms ASC, seq ASC",
                        COLUMNS
                    ))?;
                    let rows = stmt.query_map([], read_info)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                let mut claimed = None;
                for mut info in candidates {
                    let at = now();
                    if !info.is_runnable_now(&node_id, &policy, at) {
                        continue;
                    }
                    let started = info.start_task_execution(&node_id, policy.max_attempts, at);
                    update_info(&tx, &info)?;
                    if started {
                        tracing::info!(task_id = %info.id, node_id = %node_id, run_count = info.run_count, "Task claimed");
                        claimed = Some(info);
                        break;
                    }
                    tracing::info!(task_id = %info.id, node_id = %node_id, "Task canceled before start");
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await;

        match result {
            Err(TaskerError::LockTimeout(_)) => {
                tracing::debug!(node_id = log_node_id, "Task table locked by another node, skipping claim");
                Ok(None)
            }
            other => other,
        }
    }

    async fn heartbeat(
        &self,
        node_id: &str,
        running_task_ids: &HashSet<String>,
        failover_timeout: Duration,
    ) -> Result<()> {
        let node_id = node_id.to_string();
        let running_task_ids = running_task_ids.clone();
        let log_node_id = node_id.clone();
        let result = self
            .with_conn(move |conn| {
                let tx = begin_immediate(conn, "*")?;
                let running = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM tasks WHERE status='RUNNING'",
                        COLUMNS
                    ))?;
                    let rows = stmt.query_map([], read_info)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };

                for mut info in running {
                    let previous_node = info.execution_node_id.clone();
                    match info.heartbeat_check(&node_id, &running_task_ids, failover_timeout, now()) {
                        HeartbeatOutcome::Untouched => {}
                        HeartbeatOutcome::Refreshed => update_info(&tx, &info)?,
                        HeartbeatOutcome::FailedOver => {
                            update_info(&tx, &info)?;
                            tracing::info!(
                                task_id = %info.id,
                                node_id = %node_id,
                                previous_node = previous_node.as_deref().unwrap_or(""),
                                "Task failed over due stale heartbeat"
                            );
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await;

        match result {
            Err(TaskerError::LockTimeout(_)) => {
                tracing::debug!(node_id = log_node_id, "Task table locked by another node, skipping heartbeat");
                Ok(())
            }
            other => other,
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn begin_immediate<'c>(conn: &'c mut Connection, id: &str) -> Result<Transaction<'c>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_busy(e, id))
}

fn map_busy(err: rusqlite::Error, id: &str) -> TaskerError {
    if is_busy(&err) {
        return TaskerError::LockTimeout(id.to_string());
    }
    TaskerError::Storage(err)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            code.code == ErrorCode::DatabaseBusy || code.code == ErrorCode::DatabaseLocked
        }
        _ => false,
    }
}

fn to_sqlite_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn select_info(conn: &Connection, id: &str) -> Result<Option<TaskStatusInfo>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id=?1", COLUMNS),
            params![id],
            read_info,
        )
        .optional()?)
}

fn insert_info(conn: &Connection, info: &TaskStatusInfo) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            COLUMNS
        ),
        params![
            info.id,
            info.task_type,
            info.task_config_serialized,
            info.status.as_str(),
            info.created_at.timestamp_millis(),
            info.last_run_started_at.map(|t| t.timestamp_millis()),
            info.last_run_finished_at.map(|t| t.timestamp_millis()),
            info.run_count,
            info.execution_node_id,
            info.heartbeat,
            info.cancel_requested,
            info.processing_log,
        ],
    )?;
    Ok(())
}

/// Write back the mutable columns of a record.
fn update_info(conn: &Connection, info: &TaskStatusInfo) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status=?2, last_run_started_at_ms=?3, last_run_finished_at_ms=?4, \
         run_count=?5, execution_node_id=?6, heartbeat_ms=?7, cancel_requested=?8, processing_log=?9 \
         WHERE id=?1",
        params![
            info.id,
            info.status.as_str(),
            info.last_run_started_at.map(|t| t.timestamp_millis()),
            info.last_run_finished_at.map(|t| t.timestamp_millis()),
            info.run_count,
            info.execution_node_id,
            info.heartbeat,
            info.cancel_requested,
            info.processing_log,
        ],
    )?;
    Ok(())
}

fn read_info(row: &Row<'_>) -> rusqlite::Result<TaskStatusInfo> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(TaskStatusInfo {
        id: row.get(0)?,
        task_type: row.get(1)?,
        task_config_serialized: row.get(2)?,
        status,
        created_at: read_time(4, row.get(4)?)?,
        last_run_started_at: row
            .get::<_, Option<i64>>(5)?
            .map(|ms| read_time(5, ms))
            .transpose()?,
        last_run_finished_at: row
            .get::<_, Option<i64>>(6)?
            .map(|ms| read_time(6, ms))
            .transpose()?,
        run_count: row.get(7)?,
        execution_node_id: row.get(8)?,
        heartbeat: row.get(9)?,
        cancel_requested: row.get(10)?,
        processing_log: row.get(11)?,
    })
}

fn read_time(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}
