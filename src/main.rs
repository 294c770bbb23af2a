use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tasker_lite::config::{NodeConfig, RunnerConfig, StoreConfig, TaskerConfig};
use tasker_lite::node::Node;
use tasker_lite::persister::{SqliteTaskPersister, TaskPersister};
use tasker_lite::shutdown::install_shutdown_handler;
use tasker_lite::tasker::{builtin, TaskConfig, TaskManager, TaskStatus, TaskStatusInfo};

#[derive(Parser, Debug)]
#[command(name = "tasker-lite")]
#[command(version)]
#[command(about = "A distributed long-running task scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a tasker-lite cluster node
    Server(ServerArgs),

    /// Task management commands, working directly on the shared database
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier of this node in the cluster)
    #[arg(long, default_value = "node-1")]
    node_id: String,

    /// SQLite database shared by all nodes of the cluster
    #[arg(long, default_value = "tasker.db")]
    database: PathBuf,

    /// Port for the REST API
    #[arg(long, default_value = "8080")]
    api_port: u16,

    /// Do not start the REST API
    #[arg(long)]
    no_api: bool,

    /// Maximal number of tasks running concurrently on this node
    #[arg(long, default_value = "2")]
    max_running_tasks: usize,

    /// Heartbeat period of running tasks; failover happens after five missed periods
    #[arg(long, default_value = "10000")]
    heartbeat_period_ms: u64,

    /// Poll interval of the task runner
    #[arg(long, default_value = "2000")]
    runner_wait_ms: u64,

    /// Delay before the first task is started
    #[arg(long, default_value = "10000")]
    startup_delay_ms: u64,

    /// How long to wait for a locked task record
    #[arg(long, default_value = "2000")]
    lock_timeout_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// SQLite database shared by all nodes of the cluster
    #[arg(long, short = 'd', default_value = "tasker.db")]
    database: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Task Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// List supported task types
    Types,
    /// Create a new task
    Create {
        /// Task type (see `task types`)
        task_type: String,

        /// Task configuration as JSON object (e.g. '{"duration_ms": 5000}')
        #[arg(long, short = 'c')]
        config: Option<String>,
    },
    /// Get status of a specific task
    Status {
        /// The task ID
        task_id: String,
    },
    /// List tasks, newest first
    List {
        /// Only tasks of this type
        #[arg(long)]
        task_type: Option<String>,

        /// Only tasks in these statuses (comma-separated, e.g. "NEW,RUNNING")
        #[arg(long, value_delimiter = ',')]
        status: Vec<TaskStatus>,

        /// Number of tasks to skip
        #[arg(long, default_value = "0")]
        from: usize,

        /// Maximal number of tasks to show (0 = all)
        #[arg(long, default_value = "20")]
        size: usize,
    },
    /// Request cancellation of a task
    Cancel {
        /// The task ID
        task_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct TaskCreateOutput {
    task_id: String,
}

#[derive(Serialize)]
struct TaskCancelOutput {
    task_id: String,
    canceled: bool,
}

#[derive(Serialize)]
struct TaskListOutput {
    tasks: Vec<TaskStatusInfo>,
    count: usize,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_addr: Option<SocketAddr> = if args.no_api {
        None
    } else {
        Some(format!("0.0.0.0:{}", args.api_port).parse()?)
    };

    let runner = RunnerConfig::default()
        .with_max_running_tasks(args.max_running_tasks)
        .with_heartbeat_period(Duration::from_millis(args.heartbeat_period_ms))
        .with_runner_wait(Duration::from_millis(args.runner_wait_ms))
        .with_startup_delay(Duration::from_millis(args.startup_delay_ms));
    let store = StoreConfig::default().with_lock_timeout(Duration::from_millis(args.lock_timeout_ms));

    let config = NodeConfig {
        tasker: TaskerConfig::new(args.node_id)
            .with_runner(runner)
            .with_store(store),
        database_path: args.database,
        api_addr,
    };

    tracing::info!(
        node_id = %config.tasker.node_id,
        database = %config.database_path.display(),
        api_addr = ?config.api_addr,
        max_running_tasks = config.tasker.runner.max_running_tasks,
        "Starting tasker-lite node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config)?;
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn open_manager(args: &ClientArgs) -> Result<TaskManager, Box<dyn std::error::Error>> {
    let persister: Arc<dyn TaskPersister> =
        Arc::new(SqliteTaskPersister::open(&args.database, StoreConfig::default())?);
    Ok(TaskManager::new(
        TaskerConfig::new("cli"),
        Arc::new(builtin::registry()),
        persister,
    ))
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn handle_task_types(manager: &TaskManager, output_format: &OutputFormat) -> serde_json::Result<()> {
    let types = manager.list_supported_task_types();
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&types)?),
        OutputFormat::Table => {
            for task_type in types {
                println!("{}", task_type);
            }
        }
    }
    Ok(())
}

async fn handle_task_create(
    manager: &TaskManager,
    task_type: String,
    config: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let task_config: Option<TaskConfig> = config
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let task_id = manager.create_task(&task_type, task_config.as_ref()).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&TaskCreateOutput { task_id })?);
        }
        OutputFormat::Table => {
            println!("Task created successfully!");
            println!("Task ID: {}", task_id);
        }
    }
    Ok(())
}

async fn handle_task_status(
    manager: &TaskManager,
    task_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(info) = manager.get_task_status_info(&task_id).await? else {
        return Err(format!("Task not found: {}", task_id).into());
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Table => {
            println!("Task ID:          {}", info.id);
            println!("Type:             {}", info.task_type);
            println!("Status:           {}", info.status);
            println!("Created:          {}", format_time(Some(info.created_at)));
            println!("Last Run Started: {}", format_time(info.last_run_started_at));
            println!("Last Run Ended:   {}", format_time(info.last_run_finished_at));
            println!("Run Count:        {}", info.run_count);
            if let Some(node) = &info.execution_node_id {
                println!("Execution Node:   {}", node);
            }
            if info.cancel_requested {
                println!("Cancel Requested: yes");
            }
            if let Some(config) = &info.task_config_serialized {
                println!("Config:           {}", config);
            }
            if let Some(log) = &info.processing_log {
                println!("Processing Log:");
                for line in log.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_task_list(
    manager: &TaskManager,
    task_type: Option<String>,
    statuses: Vec<TaskStatus>,
    from: usize,
    size: usize,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let tasks = manager
        .list_tasks(task_type.as_deref(), &statuses, from, size)
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = TaskListOutput {
                count: tasks.len(),
                tasks,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks found.");
            } else {
                println!(
                    "{:<34} {:<16} {:<15} {:<5} {:<12} CREATED",
                    "TASK ID", "TYPE", "STATUS", "RUNS", "NODE"
                );
                println!("{}", "-".repeat(104));

                for task in &tasks {
                    println!(
                        "{:<34} {:<16} {:<15} {:<5} {:<12} {}",
                        task.id,
                        task.task_type,
                        task.status,
                        task.run_count,
                        task.execution_node_id.as_deref().unwrap_or("-"),
                        format_time(Some(task.created_at))
                    );
                }
                println!();
                println!("Showing {} tasks", tasks.len());
            }
        }
    }
    Ok(())
}

async fn handle_task_cancel(
    manager: &TaskManager,
    task_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let canceled = manager.cancel_task(&task_id).await?;

    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&TaskCancelOutput { task_id, canceled })?
            );
        }
        OutputFormat::Table => {
            if canceled {
                println!("Task canceled");
            } else {
                println!("Task not canceled");
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Task { client, command } => {
            let manager = open_manager(&client)?;

            match command {
                TaskCommands::Types => {
                    handle_task_types(&manager, &client.output)?;
                }
                TaskCommands::Create { task_type, config } => {
                    handle_task_create(&manager, task_type, config, &client.output).await?;
                }
                TaskCommands::Status { task_id } => {
                    handle_task_status(&manager, task_id, &client.output).await?;
                }
                TaskCommands::List {
                    task_type,
                    status,
                    from,
                    size,
                } => {
                    handle_task_list(&manager, task_type, status, from, size, &client.output)
                        .await?;
                }
                TaskCommands::Cancel { task_id } => {
                    handle_task_cancel(&manager, task_id, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
