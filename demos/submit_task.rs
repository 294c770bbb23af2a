//! Two nodes sharing one in-memory store. Submits a few demo tasks through the first
//! node, cancels one of them, and prints the final state of every task.
//!
//! Run with `cargo run --example submit_task`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tasker_lite::config::{FailoverPolicy, RunnerConfig, StoreConfig, TaskerConfig};
use tasker_lite::persister::{MemoryTaskPersister, TaskPersister};
use tasker_lite::tasker::{builtin, TaskConfig, TaskManager};

#[derive(Parser, Debug)]
#[command(name = "submit-task")]
#[command(about = "Run demo tasks on a two node in-process cluster")]
struct Args {
    /// Number of sleep tasks to submit
    #[arg(long, default_value = "3")]
    tasks: usize,

    /// Duration of each sleep task
    #[arg(long, default_value = "1500")]
    duration_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = StoreConfig::default()
        .with_failover(FailoverPolicy::default().with_fixed_delay(Duration::from_millis(200)));
    let persister: Arc<dyn TaskPersister> = Arc::new(MemoryTaskPersister::new(store.clone()));
    let runner = RunnerConfig::default()
        .with_startup_delay(Duration::ZERO)
        .with_runner_wait(Duration::from_millis(100))
        .with_heartbeat_period(Duration::from_millis(200));

    let nodes: Vec<TaskManager> = ["node-1", "node-2"]
        .into_iter()
        .map(|node_id| {
            TaskManager::new(
                TaskerConfig::new(node_id)
                    .with_runner(runner.clone())
                    .with_store(store.clone()),
                Arc::new(builtin::registry()),
                persister.clone(),
            )
        })
        .collect();
    for node in &nodes {
        node.start_tasks_execution().await;
    }

    let mut config = TaskConfig::new();
    config.insert("duration_ms".to_string(), args.duration_ms.into());
    config.insert("steps".to_string(), 3.into());

    let mut ids = Vec::new();
    for _ in 0..args.tasks {
        ids.push(nodes[0].create_task(builtin::SLEEP_TASK, Some(&config)).await?);
    }
    ids.push(nodes[0].create_task(builtin::NOOP_TASK, None).await?);
    println!("Submitted {} tasks", ids.len());

    if let Some(first) = ids.first() {
        println!("Cancel {}: {}", first, nodes[0].cancel_task(first).await?);
    }

    // wait until nothing is left to do
    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let tasks = nodes[0].list_tasks(None, &[], 0, 0).await?;
        if tasks.iter().all(|t| t.status.is_terminal()) {
            break;
        }
    }

    for node in &nodes {
        node.stop_tasks_execution().await;
    }

    println!("{:<34} {:<8} {:<15} {:<5} NODE", "TASK ID", "TYPE", "STATUS", "RUNS");
    for task in nodes[0].list_tasks(None, &[], 0, 0).await? {
        println!(
            "{:<34} {:<8} {:<15} {:<5} {}",
            task.id,
            task.task_type,
            task.status,
            task.run_count,
            task.execution_node_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
