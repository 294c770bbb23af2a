use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::persister::{SqliteTaskPersister, TaskPersister};
use crate::tasker::{builtin, TaskFactory, TaskManager};

/// One cluster node: the task manager with its runner, on the shared SQLite store,
/// plus the REST API.
pub struct Node {
    pub config: NodeConfig,
    pub manager: Arc<TaskManager>,
}

impl Node {
    /// Node running the demo task types.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(builtin::registry()))
    }

    pub fn with_factory(config: NodeConfig, factory: Arc<dyn TaskFactory>) -> Result<Self> {
        let persister: Arc<dyn TaskPersister> = Arc::new(SqliteTaskPersister::open(
            &config.database_path,
            config.tasker.store.clone(),
        )?);
        let manager = Arc::new(TaskManager::new(config.tasker.clone(), factory, persister));
        Ok(Self { config, manager })
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// Starts the task runner and, if configured, the REST API. On shutdown the API
    /// stops accepting requests and running tasks are interrupted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.manager.start_tasks_execution().await;

        let api = self.config.api_addr.map(|addr| {
            let state = ApiState {
                manager: self.manager.clone(),
            };
            let api_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = run_api(addr, state, api_shutdown).await {
                    tracing::error!(addr = %addr, error = %e, "REST API server failed");
                }
            })
        });

        shutdown.cancelled().await;
        tracing::info!(node_id = %self.config.tasker.node_id, "Shutting down node");

        self.manager.stop_tasks_execution().await;
        if let Some(api) = api {
            if let Err(e) = api.await {
                tracing::warn!(error = %e, "REST API task ended abnormally");
            }
        }
        Ok(())
    }
}
