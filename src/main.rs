use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use crontab_lite::config::{MasterConfig, StoreConfig, WorkerConfig};
use crontab_lite::job::Job;
use crontab_lite::master::{run_api, JobManager};
use crontab_lite::node::{spawn_result_logger, WorkerNode};
use crontab_lite::shutdown::install_shutdown_handler;
use crontab_lite::store::EtcdStore;

#[derive(Parser, Debug)]
#[command(name = "crontab-lite")]
#[command(version)]
#[command(about = "A distributed cron scheduler coordinated through etcd")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker that schedules and runs jobs
    Worker(WorkerArgs),

    /// Start the job management HTTP API
    Master(MasterArgs),

    /// Job management commands (talk to etcd directly)
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Process Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// JSON config file (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated), overrides the config file
    #[arg(long, value_delimiter = ',')]
    etcd_endpoints: Option<Vec<String>>,

    /// Identifier written into job locks
    #[arg(long)]
    worker_id: Option<String>,
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// JSON config file (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// etcd endpoints (comma-separated), overrides the config file
    #[arg(long, value_delimiter = ',')]
    etcd_endpoints: Option<Vec<String>>,

    /// Port of the HTTP API
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:2379")]
    etcd_endpoints: Vec<String>,

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
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create or replace a job
    Save {
        #[arg(long)]
        name: String,

        /// Shell command, run with `sh -c`
        #[arg(long)]
        command: String,

        /// Cron expression with seconds, e.g. "*/5 * * * * *"
        #[arg(long)]
        cron: String,
    },
    /// Delete a job
    Delete { name: String },
    /// List all jobs
    List,
    /// Kill the running instance of a job on every worker
    Kill { name: String },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Process Implementations
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(endpoints) = args.etcd_endpoints {
        config.store.etcd_endpoints = endpoints;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }

    tracing::info!(
        worker_id = %config.worker_id,
        endpoints = ?config.store.etcd_endpoints,
        lock_ttl_secs = config.lock_ttl_secs,
        "Starting crontab-lite worker"
    );

    let shutdown = install_shutdown_handler()?;
    let node = WorkerNode::connect(config, shutdown).await?;
    let logger = spawn_result_logger(&node);
    node.wait().await;
    let _ = logger.await;
    Ok(())
}

async fn run_master(args: MasterArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = match &args.config {
        Some(path) => MasterConfig::load(path)?,
        None => MasterConfig::default(),
    };
    if let Some(endpoints) = args.etcd_endpoints {
        config.store.etcd_endpoints = endpoints;
    }
    if let Some(port) = args.port {
        config.api_port = port;
    }

    let store = EtcdStore::connect(&config.store).await?;
    let manager = Arc::new(JobManager::new(Arc::new(store), &config));
    let shutdown = install_shutdown_handler()?;
    run_api(config.listen_addr(), manager, shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn run_job_command(
    client: ClientArgs,
    command: JobCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = StoreConfig {
        etcd_endpoints: client.etcd_endpoints,
        ..StoreConfig::default()
    };
    let store = EtcdStore::connect(&store_config).await?;
    let manager = JobManager::new(Arc::new(store), &MasterConfig::default());
    let output = client.output;

    match command {
        JobCommands::Save {
            name,
            command,
            cron,
        } => {
            let job = Job::new(name, command, cron);
            let previous = manager.save_job(&job).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&previous)?),
                OutputFormat::Table => match previous {
                    Some(old) => println!(
                        "Job {} updated (was: {} @ {})",
                        job.name, old.command, old.cron_expr
                    ),
                    None => println!("Job {} created", job.name),
                },
            }
        }
        JobCommands::Delete { name } => {
            let previous = manager.delete_job(&name).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&previous)?),
                OutputFormat::Table => match previous {
                    Some(_) => println!("Job {} deleted", name),
                    None => println!("Job {} not found", name),
                },
            }
        }
        JobCommands::List => {
            let jobs = manager.list_jobs().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => print_job_table(&jobs),
            }
        }
        JobCommands::Kill { name } => {
            manager.kill_job(&name).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::json!({ "killed": name })),
                OutputFormat::Table => println!("Kill requested for job {}", name),
            }
        }
    }
    Ok(())
}

fn print_job_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<24} {:<20} COMMAND", "NAME", "CRON");
    println!("{}", "-".repeat(70));
    for job in jobs {
        let cmd_display = if job.command.chars().count() > 40 {
            format!("{}...", job.command.chars().take(37).collect::<String>())
        } else {
            job.command.clone()
        };
        println!("{:<24} {:<20} {}", job.name, job.cron_expr, cmd_display);
    }
    println!();
    println!("{} job(s)", jobs.len());
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Master(master_args) => run_master(master_args).await?,
        Commands::Job { client, command } => run_job_command(client, command).await?,
    }

    Ok(())
}
