mod consumer_cmd;
mod serve_cmd;
mod task_cmd;

use clap::{Parser, Subcommand};
use taskflow_db::config::OrchestratorConfig;

#[derive(Parser)]
#[command(name = "taskflow", about = "Task broker and document-indexing pipeline orchestrator")]
struct Cli {
    /// Broker base URL (overrides TASKFLOW_BROKER_URL env var)
    #[arg(long, global = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task broker HTTP server
    Broker {
        #[command(subcommand)]
        command: BrokerCommands,
    },
    /// Run the index orchestrator HTTP server
    Orchestrator {
        #[command(subcommand)]
        command: OrchestratorCommands,
    },
    /// Create, inspect, and list tasks against a running broker
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Register, list, and remove consumers against a running broker
    Consumer {
        #[command(subcommand)]
        command: ConsumerCommands,
    },
}

#[derive(Subcommand)]
enum BrokerCommands {
    /// Start serving the broker's HTTP surface
    Serve,
}

#[derive(Subcommand)]
enum OrchestratorCommands {
    /// Start serving the orchestrator's worker endpoint
    Serve,
}

#[derive(Subcommand)]
pub(crate) enum TaskCommands {
    /// Create a task
    Create {
        /// Topic name (the registered consumer topic to dispatch to)
        name: String,
        /// JSON input payload
        #[arg(long, default_value = "{}")]
        input: String,
        /// Parent task id, for orchestrator-created child tasks
        #[arg(long)]
        parent_id: Option<uuid::Uuid>,
        /// Idempotency key: repeated creation with the same key returns the original task
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show a task's full record
    Get { id: uuid::Uuid },
    /// Show a task's status view
    Status { id: uuid::Uuid },
    /// List tasks, optionally filtered
    List {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status_code: Option<u8>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConsumerCommands {
    /// Register (or refresh) a consumer
    Put {
        topic: String,
        endpoint_url: String,
        #[arg(long)]
        health_url: Option<String>,
    },
    /// Remove a consumer
    Remove { topic: String, endpoint_url: String },
    /// List registered consumers
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let broker_url = cli
        .broker_url
        .unwrap_or_else(|| OrchestratorConfig::DEFAULT_BROKER_URL.to_string());

    match cli.command {
        Commands::Broker { command: BrokerCommands::Serve } => {
            serve_cmd::run_broker_serve().await?;
        }
        Commands::Orchestrator { command: OrchestratorCommands::Serve } => {
            serve_cmd::run_orchestrator_serve().await?;
        }
        Commands::Task { command } => task_cmd::run(&broker_url, command).await?,
        Commands::Consumer { command } => consumer_cmd::run(&broker_url, command).await?,
    }

    Ok(())
}
