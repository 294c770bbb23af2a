use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::Result;
use crate::persister::TaskPersister;
use crate::tasker::factory::TaskFactory;
use crate::tasker::info::{RunClaim, TaskStatusInfo};
use crate::tasker::status::TaskStatus;
use crate::tasker::task::{Task, TaskExecution, TaskExecutionContext, TaskHandle};

/// A task started by this runner.
#[derive(Debug)]
struct RunningTask {
    claim: RunClaim,
    handle: TaskHandle,
}

/// Reports job outcomes to the store, fenced by the claim the job was started with.
struct RunnerExecutionContext {
    persister: Arc<dyn TaskPersister>,
    claim: RunClaim,
}

#[async_trait]
impl TaskExecutionContext for RunnerExecutionContext {
    async fn report_status(&self, task_id: &str, status: TaskStatus, message: Option<&str>) {
        match self
            .persister
            .change_task_status_for_run(task_id, &self.claim, status, message)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::info!(
                task_id,
                status = %status,
                run_count = self.claim.run_count,
                "Task status not written, the run no longer owns the task"
            ),
            Err(e) => tracing::warn!(task_id, status = %status, error = %e, "Failed to write task status"),
        }
    }

    async fn append_log(&self, task_id: &str, message: &str) {
        if let Err(e) = self.persister.write_task_log(task_id, message).await {
            tracing::warn!(task_id, error = %e, "Failed to write task log");
        }
    }
}

/// Runs tasks on one cluster node.
///
/// The control loop polls the store for tasks to run, keeps heartbeats of local tasks
/// fresh, fails over tasks of dead nodes, and relays cancel requests to local tasks.
/// At most `max_running_tasks` tasks run at once.
pub struct TaskRunner {
    node_id: String,
    factory: Arc<dyn TaskFactory>,
    persister: Arc<dyn TaskPersister>,
    config: RunnerConfig,
    running: Mutex<HashMap<String, RunningTask>>,
    wakeup: Notify,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl TaskRunner {
    pub fn new(
        node_id: impl Into<String>,
        factory: Arc<dyn TaskFactory>,
        persister: Arc<dyn TaskPersister>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            factory,
            persister,
            config,
            running: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            last_heartbeat: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the control loop until `shutdown` is cancelled, then interrupt local tasks
    /// and give them `shutdown_grace` to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "Started tasks execution");

        // give the rest of the node time to initialize
        let started = tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.startup_delay) => true,
        };

        if started {
            loop {
                self.run_once().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(self.config.runner_wait) => {}
                }
            }
        }

        self.stop_running_tasks().await;
        tracing::info!(node_id = %self.node_id, "Stopped tasks execution");
    }

    /// One iteration of the control loop. Step errors are logged, never returned.
    pub async fn run_once(&self) {
        if let Err(e) = self.handle_cancel_requests().await {
            tracing::warn!(node_id = %self.node_id, error = %e, "Failed to handle cancel requests");
        }
        if let Err(e) = self.heartbeat_if_due().await {
            tracing::warn!(node_id = %self.node_id, error = %e, "Failed to heartbeat");
        }
        self.remove_finished().await;
        if let Err(e) = self.start_tasks().await {
            tracing::warn!(node_id = %self.node_id, error = %e, "Failed to start tasks");
        }
    }

    /// Wake the control loop so a new task starts without waiting for the next poll.
    pub fn notify_new_task_available_for_run(&self) {
        self.wakeup.notify_one();
    }

    /// Cancel the task if it runs on this node.
    pub async fn cancel_task(&self, task_id: &str) {
        let running = self.running.lock().await;
        if let Some(task) = running.get(task_id) {
            if task.handle.is_alive() {
                task.handle.set_canceled();
                task.handle.interrupt();
                tracing::info!(task_id, node_id = %self.node_id, "Task canceled");
            }
        }
    }

    /// Ids of tasks tracked by this runner.
    pub async fn running_task_ids(&self) -> HashSet<String> {
        self.running.lock().await.keys().cloned().collect()
    }

    /// Relay cancel requests to local tasks, and interrupt local tasks whose record no
    /// longer runs under their claim.
    pub async fn handle_cancel_requests(&self) -> Result<()> {
        let candidates: Vec<(String, RunClaim)> = {
            let running = self.running.lock().await;
            running
                .iter()
                .filter(|(_, t)| t.handle.is_alive() && !t.handle.is_canceled_or_interrupted())
                .map(|(id, t)| (id.clone(), t.claim.clone()))
                .collect()
        };

        for (task_id, claim) in candidates {
            let info = self.persister.get_task_status_info(&task_id).await?;
            let running = self.running.lock().await;
            let Some(task) = running.get(&task_id) else {
                continue;
            };
            match info {
                Some(info) if info.cancel_requested => {
                    task.handle.set_canceled();
                    task.handle.interrupt();
                    tracing::info!(task_id = %task_id, node_id = %self.node_id, "Cancel request relayed to task");
                }
                Some(info) if info.is_running_under(&claim) => {}
                _ => {
                    task.handle.interrupt();
                    tracing::info!(
                        task_id = %task_id,
                        node_id = %self.node_id,
                        "Task no longer owned by this node, interrupting"
                    );
                }
            }
        }
        Ok(())
    }

    /// Heartbeat local tasks and fail over stale tasks of other nodes.
    pub async fn heartbeat(&self) -> Result<()> {
        let running_task_ids = self.running_task_ids().await;
        self.persister
            .heartbeat(
                &self.node_id,
                &running_task_ids,
                self.config.failover_timeout(),
            )
            .await?;
        *self.last_heartbeat.lock().await = Some(Instant::now());
        Ok(())
    }

    async fn heartbeat_if_due(&self) -> Result<()> {
        let due = match *self.last_heartbeat.lock().await {
            Some(last) => last.elapsed() >= self.config.heartbeat_period,
            None => true,
        };
        if due {
            self.heartbeat().await?;
        }
        Ok(())
    }

    /// Forget tasks whose execution has ended.
    pub async fn remove_finished(&self) {
        let mut running = self.running.lock().await;
        running.retain(|task_id, task| {
            let alive = task.handle.is_alive();
            if !alive {
                tracing::debug!(task_id = %task_id, "Removing finished task");
            }
            alive
        });
    }

    /// Claim and start tasks while there is room for them.
    pub async fn start_tasks(&self) -> Result<()> {
        loop {
            if self.running.lock().await.len() >= self.config.max_running_tasks {
                return Ok(());
            }
            let Some(info) = self.persister.get_task_to_run(&self.node_id).await? else {
                return Ok(());
            };
            let Some(claim) = info.claim() else {
                continue;
            };

            let task = match self.instantiate(&info) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(task_id = %info.id, task_type = %info.task_type, error = %e, "Claimed task can't be started");
                    let message = format!("ERROR: Task can't be started: {}", e);
                    self.persister
                        .change_task_status_for_run(
                            &info.id,
                            &claim,
                            TaskStatus::FinishedError,
                            Some(&message),
                        )
                        .await?;
                    continue;
                }
            };

            let callback = Arc::new(RunnerExecutionContext {
                persister: self.persister.clone(),
                claim: claim.clone(),
            });
            let handle = TaskExecution::new(info.id.as_str(), task, callback).spawn();
            tracing::info!(
                task_id = %info.id,
                task_type = %info.task_type,
                node_id = %self.node_id,
                run_count = info.run_count,
                "Task started"
            );
            self.running
                .lock()
                .await
                .insert(info.id, RunningTask { claim, handle });
        }
    }

    fn instantiate(&self, info: &TaskStatusInfo) -> Result<Box<dyn Task>> {
        let task_config = info.task_config()?;
        self.factory
            .create_task(&info.task_type, task_config.as_ref())
    }

    /// Interrupt all local tasks which are still alive. Returns true if there was any.
    pub async fn interrupt_running_tasks(&self) -> bool {
        let running = self.running.lock().await;
        let mut interrupted = false;
        for task in running.values().filter(|t| t.handle.is_alive()) {
            task.handle.interrupt();
            interrupted = true;
        }
        interrupted
    }

    async fn stop_running_tasks(&self) {
        if !self.interrupt_running_tasks().await {
            return;
        }
        tracing::info!(node_id = %self.node_id, "Giving some time for executed tasks to be finished");

        let handles: Vec<TaskHandle> = self
            .running
            .lock()
            .await
            .drain()
            .map(|(_, task)| task.handle)
            .collect();
        let wait_all = async {
            for handle in handles {
                handle.join().await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, wait_all)
            .await
            .is_err()
        {
            tracing::warn!(node_id = %self.node_id, "Some tasks did not finish in time");
        }
    }
}
