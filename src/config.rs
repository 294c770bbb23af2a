use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Maximal number of attempts a task may be started before it is canceled.
pub const FAILOVER_MAX_NUM: u32 = 100;

/// Retry policy applied to tasks in `FAILOVER` status.
///
/// The cool-down grows with the number of runs a task already had:
/// - `run_count <= short_delay_max_runs`: `short_delay`
/// - `run_count <= medium_delay_max_runs`: `medium_delay`
/// - otherwise: `long_delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// Tasks in failover with this many runs are canceled instead of started again
    pub max_attempts: u32,
    pub short_delay: Duration,
    pub short_delay_max_runs: u32,
    pub medium_delay: Duration,
    pub medium_delay_max_runs: u32,
    pub long_delay: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_attempts: FAILOVER_MAX_NUM,
            short_delay: Duration::from_secs(10),
            short_delay_max_runs: 10,
            medium_delay: Duration::from_secs(60),
            medium_delay_max_runs: 40,
            long_delay: Duration::from_secs(300),
        }
    }
}

impl FailoverPolicy {
    /// Minimal time between end of the last run and next start for a task with `run_count` runs.
    pub fn cooldown_for(&self, run_count: u32) -> Duration {
        if run_count <= self.short_delay_max_runs {
            self.short_delay
        } else if run_count <= self.medium_delay_max_runs {
            self.medium_delay
        } else {
            self.long_delay
        }
    }

    /// Same delay for every attempt. Handy for tests and small deployments.
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.short_delay = delay;
        self.medium_delay = delay;
        self.long_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Configuration shared by all task persisters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long to wait for a row lock before the record is skipped
    pub lock_timeout: Duration,
    pub failover: FailoverPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            failover: FailoverPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_failover(mut self, failover: FailoverPolicy) -> Self {
        self.failover = failover;
        self
    }
}

/// Timing and capacity of the per-node task runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Maximal number of tasks running concurrently on this node
    pub max_running_tasks: usize,
    /// Sleep between two runner loop iterations (shortened by notifications)
    pub runner_wait: Duration,
    /// Period of heartbeats written for locally running tasks
    pub heartbeat_period: Duration,
    /// Failover timeout is `heartbeat_period * failover_timeout_factor`
    pub failover_timeout_factor: u32,
    /// Wait before the first loop iteration so the rest of the application can initialize
    pub startup_delay: Duration,
    /// How long running tasks get to finish after they are interrupted on stop
    pub shutdown_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_running_tasks: 2,
            runner_wait: Duration::from_secs(2),
            heartbeat_period: Duration::from_secs(10),
            failover_timeout_factor: 5,
            startup_delay: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl RunnerConfig {
    pub fn failover_timeout(&self) -> Duration {
        self.heartbeat_period * self.failover_timeout_factor
    }

    pub fn with_max_running_tasks(mut self, max_running_tasks: usize) -> Self {
        self.max_running_tasks = max_running_tasks;
        self
    }

    pub fn with_heartbeat_period(mut self, heartbeat_period: Duration) -> Self {
        self.heartbeat_period = heartbeat_period;
        self
    }

    pub fn with_runner_wait(mut self, runner_wait: Duration) -> Self {
        self.runner_wait = runner_wait;
        self
    }

    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
}

/// Configuration of the task subsystem on one cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskerConfig {
    /// Identifier of this cluster node, must be unique in the cluster
    pub node_id: String,
    pub runner: RunnerConfig,
    pub store: StoreConfig,
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            runner: RunnerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl TaskerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Configuration of the server binary.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tasker: TaskerConfig,
    /// SQLite database shared by all nodes of the cluster
    pub database_path: PathBuf,
    /// Address of the REST API, disabled when `None`
    pub api_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tasker: TaskerConfig::default(),
            database_path: PathBuf::from("tasker.db"),
            api_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_policy_default() {
        let policy = FailoverPolicy::default();
        assert_eq!(policy.max_attempts, 100);
        assert_eq!(policy.short_delay, Duration::from_secs(10));
        assert_eq!(policy.medium_delay, Duration::from_secs(60));
        assert_eq!(policy.long_delay, Duration::from_secs(300));
    }

    #[test]
    fn failover_policy_cooldown_thresholds() {
        let policy = FailoverPolicy::default();
        assert_eq!(policy.cooldown_for(0), Duration::from_secs(10));
        assert_eq!(policy.cooldown_for(10), Duration::from_secs(10));
        assert_eq!(policy.cooldown_for(11), Duration::from_secs(60));
        assert_eq!(policy.cooldown_for(40), Duration::from_secs(60));
        assert_eq!(policy.cooldown_for(41), Duration::from_secs(300));
        assert_eq!(policy.cooldown_for(100), Duration::from_secs(300));
    }

    #[test]
    fn failover_policy_fixed_delay() {
        let policy = FailoverPolicy::default().with_fixed_delay(Duration::from_millis(5));
        assert_eq!(policy.cooldown_for(1), Duration::from_millis(5));
        assert_eq!(policy.cooldown_for(20), Duration::from_millis(5));
        assert_eq!(policy.cooldown_for(90), Duration::from_millis(5));
    }

    #[test]
    fn runner_config_default() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.max_running_tasks, 2);
        assert_eq!(cfg.runner_wait, Duration::from_secs(2));
        assert_eq!(cfg.heartbeat_period, Duration::from_secs(10));
        assert_eq!(cfg.startup_delay, Duration::from_secs(10));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn runner_config_failover_timeout_is_five_heartbeats() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.failover_timeout(), Duration::from_secs(50));

        let cfg = cfg.with_heartbeat_period(Duration::from_millis(100));
        assert_eq!(cfg.failover_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn tasker_config_new() {
        let cfg = TaskerConfig::new("node-7");
        assert_eq!(cfg.node_id, "node-7");
        assert_eq!(cfg.runner, RunnerConfig::default());
        assert_eq!(cfg.store, StoreConfig::default());
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.database_path, PathBuf::from("tasker.db"));
        assert_eq!(
            cfg.api_addr.map(|a| a.to_string()).as_deref(),
            Some("127.0.0.1:8080")
        );
    }
}
