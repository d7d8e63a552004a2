use clap::{ArgGroup, Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forcephot_runner::config::{EngineConfig, RemoteConfig};
use forcephot_runner::engine::Engine;
use forcephot_runner::error::EngineError;
use forcephot_runner::logging::{init_logging, LogConfig};
use forcephot_runner::maintenance::Sweeper;
use forcephot_runner::notify::LogNotifier;
use forcephot_runner::results::ResultFiles;
use forcephot_runner::scheduler::{self, ranker, Job, NewJob, RequestKind, Target};
use forcephot_runner::shutdown::install_shutdown_handler;
use forcephot_runner::store::{Deletion, JobStore, PgJobStore};

#[derive(Parser, Debug)]
#[command(name = "forcephot-runner")]
#[command(version)]
#[command(about = "Runs queued ATLAS forced photometry jobs on the remote compute host")]
#[command(propagate_version = true)]
struct Args {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Local directory holding job result files
    #[arg(long, env = "RESULTS_DIR", default_value = "results", global = true)]
    results_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the task runner until interrupted
    Run(RunArgs),

    /// Job management commands
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Queue management commands
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Apply the retention rules once and exit
    Sweep {
        /// Also delete result files that belong to no job
        #[arg(long)]
        orphans: bool,
    },
}

// =============================================================================
// Runner Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of jobs run concurrently
    #[arg(long, default_value = "8")]
    slots: usize,

    /// ssh host alias of the remote compute server
    #[arg(long, default_value = "atlas")]
    remote_host: String,

    /// Results directory on the remote host
    #[arg(long, default_value = "~/atlasserver/results")]
    remote_results_dir: String,

    /// Seconds before a running remote command is killed and retried
    #[arg(long, default_value = "1200")]
    task_max_time: u64,

    /// Port for the read-only status API (optional)
    #[arg(long)]
    status_port: Option<u16>,

    /// Directory for daily rotating log files (console only when unset)
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Delete result files that belong to no job during maintenance
    #[arg(long)]
    prune_orphans: bool,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Photometry,
    ImageZip,
    ImageStack,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Photometry => RequestKind::PhotometryData,
            KindArg::ImageZip => RequestKind::ImageZip,
            KindArg::ImageStack => RequestKind::ImageStack,
        }
    }
}

#[derive(Parser, Debug)]
#[command(group(
    ArgGroup::new("target")
        .args(["object", "ra", "parent"])
        .required(true)
        .multiple(true)
))]
struct SubmitArgs {
    /// Owner's user id
    #[arg(long)]
    user_id: i64,

    /// Owner's user name
    #[arg(long)]
    username: String,

    /// Address for the completion notification
    #[arg(long)]
    email: Option<String>,

    /// Request type
    #[arg(long, value_enum, default_value = "photometry")]
    kind: KindArg,

    /// Solar-system object name
    #[arg(long)]
    object: Option<String>,

    /// Right ascension in degrees
    #[arg(long, requires = "dec", allow_negative_numbers = true)]
    ra: Option<f64>,

    /// Declination in degrees
    #[arg(long, requires = "ra", allow_negative_numbers = true)]
    dec: Option<f64>,

    /// Epoch year of the coordinates
    #[arg(long)]
    epoch: Option<f64>,

    /// Proper motion in RA (mas/yr)
    #[arg(long, allow_negative_numbers = true)]
    pm_ra: Option<f64>,

    /// Proper motion in Dec (mas/yr)
    #[arg(long, allow_negative_numbers = true)]
    pm_dec: Option<f64>,

    /// Earliest MJD
    #[arg(long)]
    mjd_min: Option<f64>,

    /// Latest MJD
    #[arg(long)]
    mjd_max: Option<f64>,

    /// Parent photometry job for image requests
    #[arg(long)]
    parent: Option<i64>,

    /// Use reduced instead of difference images
    #[arg(long)]
    reduced: bool,

    /// Notify the owner when the batch finishes
    #[arg(long)]
    send_email: bool,

    /// Mark the job as submitted through the API
    #[arg(long)]
    api: bool,

    #[arg(long)]
    comment: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a new job
    Submit(Box<SubmitArgs>),
    /// Show one job
    Status {
        /// The job ID
        job_id: i64,
    },
    /// Delete a job: queued and running jobs are cancelled, finished ones archived
    Cancel {
        /// The job ID
        job_id: i64,
    },
    /// List queued and running jobs
    List,
}

// =============================================================================
// Queue Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Recompute queue positions
    Rank,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: i64,
    queue_position: Option<i32>,
}

#[derive(Serialize)]
struct JobCancelOutput {
    job_id: i64,
    result: &'static str,
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn connect_store(database_url: Option<&str>) -> Result<PgJobStore, EngineError> {
    let url = database_url
        .ok_or_else(|| EngineError::Config("DATABASE_URL is not set".to_string()))?;
    let store = PgJobStore::connect(url).await?;
    store.migrate().await?;
    Ok(store)
}

fn build_new_job(args: SubmitArgs, parent: Option<&Job>) -> Result<NewJob, EngineError> {
    let kind = RequestKind::from(args.kind);

    let mut job = match (kind, parent) {
        (RequestKind::ImageZip, Some(parent)) => NewJob::image_request(parent, kind)?,
        (RequestKind::ImageZip, None) => {
            return Err(EngineError::InvalidJob(
                "image zip requests need --parent".to_string(),
            ))
        }
        (RequestKind::ImageStack, _) => {
            let name = args
                .object
                .clone()
                .or_else(|| parent.and_then(|p| p.target.object_name().map(str::to_string)))
                .ok_or_else(|| {
                    EngineError::InvalidJob("image stacks need --object".to_string())
                })?;
            let mut job = NewJob::image_stack(args.user_id, args.username.clone(), name);
            job.parent_id = parent.map(|p| p.id);
            job
        }
        (RequestKind::PhotometryData, _) => {
            let target = match (args.object.clone(), args.ra, args.dec) {
                (Some(name), None, None) => Target::object(name),
                (None, Some(ra), Some(dec)) => Target::Coordinates {
                    ra,
                    dec,
                    epoch_year: args.epoch,
                    pm_ra: args.pm_ra,
                    pm_dec: args.pm_dec,
                },
                _ => {
                    return Err(EngineError::InvalidJob(
                        "give either --object or both --ra and --dec".to_string(),
                    ))
                }
            };
            NewJob::photometry(args.user_id, args.username.clone(), target)
        }
    };

    if kind != RequestKind::ImageZip {
        job = job
            .with_window(args.mjd_min, args.mjd_max)
            .reduced(args.reduced)
            .notify(args.send_email);
        if let Some(email) = args.email {
            job = job.with_email(email);
        }
        if let Some(comment) = args.comment {
            job = job.with_comment(comment);
        }
    }
    Ok(job.from_api(args.api))
}

fn print_job(job: &Job) {
    println!("Job ID:          {}", job.id);
    println!("User:            {} ({})", job.username, job.user_id);
    println!("Type:            {}", job.kind);
    println!("Target:          {}", job.target);
    println!("Status:          {}", job.status());
    if let Some(pos) = job.queue_position {
        println!("Queue Position:  {}", pos);
    }
    if let Some(parent) = job.parent_id {
        println!("Parent Job:      {}", parent);
    }
    println!("Created:         {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:         {}", started);
    }
    if let Some(finished) = job.finished_at {
        println!("Finished:        {}", finished);
    }
    if let Some(error) = &job.error_msg {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

async fn run_runner(
    args: RunArgs,
    database_url: Option<String>,
    results_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = init_logging(&LogConfig {
        dir: args.log_dir,
        ..LogConfig::default()
    })?;

    let shutdown = install_shutdown_handler()?;
    let store = connect_store(database_url.as_deref()).await?;

    let status_addr: Option<SocketAddr> = match args.status_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = EngineConfig {
        task_max_time: Duration::from_secs(args.task_max_time),
        prune_orphan_files: args.prune_orphans,
        ..EngineConfig::new(results_dir)
    }
    .with_slots(args.slots)
    .with_remote(RemoteConfig {
        host: args.remote_host,
        results_dir: args.remote_results_dir,
        ..RemoteConfig::default()
    });

    let engine = Engine::new(config, Arc::new(store), Arc::new(LogNotifier), status_addr);
    engine.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_job_submit(
    store: &PgJobStore,
    args: SubmitArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let parent = match args.parent {
        Some(id) => Some(
            store
                .get(id)
                .await?
                .ok_or(EngineError::JobNotFound(id))?,
        ),
        None => None,
    };
    let new = build_new_job(args, parent.as_ref())?;
    let job = scheduler::submit_job(store, new).await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: job.id,
                queue_position: job.queue_position,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job.id);
            if let Some(pos) = job.queue_position {
                println!("Queue position: {}", pos);
            }
        }
    }
    Ok(())
}

async fn handle_job_status(
    store: &PgJobStore,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = store
        .get(job_id)
        .await?
        .ok_or(EngineError::JobNotFound(job_id))?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job(&job),
    }
    Ok(())
}

async fn handle_job_cancel(
    store: &PgJobStore,
    files: &ResultFiles,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = match scheduler::cancel_job(store, files, job_id).await? {
        Deletion::NotFound => return Err(EngineError::JobNotFound(job_id).into()),
        Deletion::Archived => "archived",
        Deletion::Removed => "removed",
    };
    match output_format {
        OutputFormat::Json => {
            let output = JobCancelOutput { job_id, result };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => println!("Job {} {}", job_id, result),
    }
    Ok(())
}

async fn handle_job_list(
    store: &PgJobStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = store.list_unfinished().await?;
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No queued jobs.");
                return Ok(());
            }
            println!(
                "{:<8} {:<5} {:<10} {:<9} {:<16} TARGET",
                "ID", "POS", "STATUS", "TYPE", "USER"
            );
            println!("{}", "-".repeat(72));
            for job in &jobs {
                let pos = job
                    .queue_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<5} {:<10} {:<9} {:<16} {}",
                    job.id,
                    pos,
                    job.status(),
                    job.kind,
                    job.username,
                    job.target
                );
            }
            println!("\nTotal: {} jobs", jobs.len());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let command = match args.command {
        Commands::Run(run_args) => {
            return run_runner(run_args, args.database_url, args.results_dir).await;
        }
        command => command,
    };

    let _log_guard = init_logging(&LogConfig {
        default_filter: "warn".to_string(),
        ..LogConfig::default()
    })?;
    let store = connect_store(args.database_url.as_deref()).await?;
    let files = ResultFiles::new(&args.results_dir);

    match command {
        Commands::Run(_) => {}
        Commands::Job { command } => match command {
            JobCommands::Submit(submit) => {
                handle_job_submit(&store, *submit, &args.output).await?;
            }
            JobCommands::Status { job_id } => {
                handle_job_status(&store, job_id, &args.output).await?;
            }
            JobCommands::Cancel { job_id } => {
                handle_job_cancel(&store, &files, job_id, &args.output).await?;
            }
            JobCommands::List => {
                handle_job_list(&store, &args.output).await?;
            }
        },
        Commands::Queue { command } => match command {
            QueueCommands::Rank => {
                let count = ranker::rerank(&store).await?;
                println!("Ranked {} queued jobs", count);
            }
        },
        Commands::Sweep { orphans } => {
            let config = EngineConfig::new(&args.results_dir);
            let sweeper = Sweeper::new(&config, Arc::new(store)).with_orphan_pruning(orphans);
            let report = sweeper.sweep_once(chrono::Utc::now()).await?;
            match args.output {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "archived": report.archived,
                        "removed": report.removed,
                        "orphan_files": report.orphan_files,
                    })
                ),
                OutputFormat::Table => println!(
                    "Archived {}, removed {}, deleted {} orphan files",
                    report.archived, report.removed, report.orphan_files
                ),
            }
        }
    }

    Ok(())
}
