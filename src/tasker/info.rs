use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::FailoverPolicy;
use crate::error::Result;
use crate::tasker::status::TaskStatus;

/// Task configuration, a JSON object with task type specific content.
pub type TaskConfig = serde_json::Map<String, serde_json::Value>;

/// Maximal length of the processing log in characters. Oldest content is dropped.
pub const PROCESSING_LOG_MAX_CHARS: usize = 65_000;

/// Identifies one execution attempt of a task: the node it was claimed by and the
/// run counter value the claim produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunClaim {
    pub node_id: String,
    pub run_count: u32,
}

/// What a heartbeat sweep did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Record runs on the heartbeating node, its heartbeat was refreshed
    Refreshed,
    /// Record heartbeat was stale, moved to `FAILOVER`
    FailedOver,
    Untouched,
}

/// Persisted information about a task and the state of its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusInfo {
    pub id: String,
    pub task_type: String,
    pub task_config_serialized: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    /// How many times the task was started
    pub run_count: u32,
    /// Cluster node the task runs on, or ran on last time
    pub execution_node_id: Option<String>,
    /// Epoch milliseconds of the last heartbeat, used to fail over tasks of dead nodes
    pub heartbeat: i64,
    pub cancel_requested: bool,
    pub processing_log: Option<String>,
}

impl TaskStatusInfo {
    /// Create a new record in `NEW` status with a generated id.
    pub fn new(task_type: impl Into<String>, task_config: Option<&TaskConfig>) -> Result<Self> {
        let task_config_serialized = task_config.map(serde_json::to_string).transpose()?;
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            task_type: task_type.into(),
            task_config_serialized,
            status: TaskStatus::New,
            created_at: now(),
            last_run_started_at: None,
            last_run_finished_at: None,
            run_count: 0,
            execution_node_id: None,
            heartbeat: 0,
            cancel_requested: false,
            processing_log: None,
        })
    }

    pub fn task_config(&self) -> Result<Option<TaskConfig>> {
        Ok(self
            .task_config_serialized
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?)
    }

    pub fn claim(&self) -> Option<RunClaim> {
        self.execution_node_id.as_ref().map(|node_id| RunClaim {
            node_id: node_id.clone(),
            run_count: self.run_count,
        })
    }

    /// True if the record still runs under the given claim.
    pub fn is_running_under(&self, claim: &RunClaim) -> bool {
        self.status == TaskStatus::Running
            && self.run_count == claim.run_count
            && self.execution_node_id.as_deref() == Some(claim.node_id.as_str())
    }

    /// Append a line to the processing log. Blank messages are ignored.
    pub fn append_processing_log(&mut self, message: &str) {
        if message.trim().is_empty() {
            return;
        }
        let log = match self.processing_log.take() {
            Some(mut log) if !log.is_empty() => {
                log.push('\n');
                log.push_str(message);
                log
            }
            _ => message.to_string(),
        };
        self.processing_log = Some(truncate_oldest(log, PROCESSING_LOG_MAX_CHARS));
    }

    /// Switch the record into `RUNNING` on `node_id` if it is in a startable status.
    ///
    /// Returns false if the task must not be started. Fields may change even then:
    /// a task with cancel requested, or a failover task which reached `max_attempts`,
    /// is moved to `CANCELED`.
    pub fn start_task_execution(
        &mut self,
        node_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status.is_runnable() {
            return false;
        }
        if self.cancel_requested {
            self.status = TaskStatus::Canceled;
            return false;
        }
        if self.status == TaskStatus::Failover && self.run_count >= max_attempts {
            self.status = TaskStatus::Canceled;
            self.append_processing_log("Cancelled due too much failover attempts");
            return false;
        }
        self.status = TaskStatus::Running;
        self.last_run_started_at = Some(now);
        self.last_run_finished_at = None;
        self.run_count += 1;
        self.execution_node_id = Some(node_id.to_string());
        self.heartbeat = now.timestamp_millis();
        true
    }

    /// Check if the task may be started on `node_id` now.
    ///
    /// New tasks are always runnable. A failover task which failed for the first time on
    /// another node is runnable at once, so tasks of a crashed node move to a live one
    /// without delay. Otherwise the failover cool-down must pass since the last run finished.
    pub fn is_runnable_now(
        &self,
        node_id: &str,
        policy: &FailoverPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        match self.status {
            TaskStatus::New => true,
            TaskStatus::Failover => {
                if self.run_count <= 1 && self.execution_node_id.as_deref() != Some(node_id) {
                    return true;
                }
                match self.last_run_finished_at {
                    None => true,
                    Some(finished) => {
                        let cooldown = duration_millis(policy.cooldown_for(self.run_count));
                        now.signed_duration_since(finished).num_milliseconds() >= cooldown
                    }
                }
            }
            _ => false,
        }
    }

    /// Apply a status transition if the transition table allows it.
    pub fn change_status(
        &mut self,
        next: TaskStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let current = self.status;
        if !current.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if let Some(message) = message {
            self.append_processing_log(message);
        }
        if current == TaskStatus::Running {
            self.last_run_finished_at = Some(now);
        }
        true
    }

    /// Set the cancel request flag. Returns false if already requested or the task is finished.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested || !self.status.is_cancelable() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Heartbeat handling for one record, see [`crate::persister::TaskPersister::heartbeat`].
    pub fn heartbeat_check(
        &mut self,
        node_id: &str,
        running_task_ids: &HashSet<String>,
        failover_timeout: Duration,
        now: DateTime<Utc>,
    ) -> HeartbeatOutcome {
        if self.status != TaskStatus::Running {
            return HeartbeatOutcome::Untouched;
        }
        let now_ms = now.timestamp_millis();
        if running_task_ids.contains(&self.id)
            && self.execution_node_id.as_deref() == Some(node_id)
        {
            self.heartbeat = now_ms;
            return HeartbeatOutcome::Refreshed;
        }
        if self.heartbeat < now_ms.saturating_sub(duration_millis(failover_timeout)) {
            let message = format!(
                "Failover necessity detected by node '{}' at {} due heartbeat timestamp {}",
                node_id, now_ms, self.heartbeat
            );
            if self.change_status(TaskStatus::Failover, Some(&message), now) {
                return HeartbeatOutcome::FailedOver;
            }
        }
        HeartbeatOutcome::Untouched
    }
}

/// Current time with millisecond precision, the precision records are persisted with.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn truncate_oldest(mut text: String, max_chars: usize) -> String {
    let len = text.chars().count();
    if len > max_chars {
        if let Some((cut, _)) = text.char_indices().nth(len - max_chars) {
            text.drain(..cut);
        }
    }
    text
}
