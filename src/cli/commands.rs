//! CLI command definitions and handlers.
//!
//! Commands read their settings from [`AppConfig::from_env`]; flags only
//! carry per-invocation data such as task ids and ports. Handlers return
//! `anyhow::Result` and wrap subsystem errors with operator-facing context.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::abort::AbortController;
use crate::broker::{Job, JobBroker, JobHandle, JobPayload};
use crate::config::AppConfig;
use crate::generation::HttpChunkSource;
use crate::hardware;
use crate::llm::ChatClient;
use crate::metrics;
use crate::paths::DataLayout;
use crate::serving::{DockerRuntime, ServingHealth, ServingManager};
use crate::store::{HttpRecordStore, RecordStore};
use crate::task::{DatasetId, DeviceKind, ModelId, ProjectId, TaskId, TaskPatch, TaskStatus};
use crate::worker::{WorkerContext, WorkerPool};

/// Fine-tuning platform worker node and operator tooling.
#[derive(Parser)]
#[command(name = "tuneforge")]
#[command(about = "Queue workers and lifecycle tooling for the fine-tuning platform")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted.
    Worker,

    /// Publish a job to its queue.
    Dispatch(DispatchArgs),

    /// Revoke a task: tear down its deployment, flag its job for
    /// termination and mark the record REVOKED.
    Revoke(RevokeArgs),

    /// Request a cooperative abort of a running generation job.
    Abort(AbortArgs),

    /// Manage serving containers.
    Deployment(DeploymentArgs),

    /// Show the depth of every queue.
    Queues,

    /// Show the host inventory the telemetry job would report.
    Hardware,
}

/// Dispatch entrypoint arguments.
#[derive(Parser)]
pub struct DispatchArgs {
    /// Job kind to publish.
    #[command(subcommand)]
    pub command: DispatchSubcommand,
}

/// Job kinds that can be dispatched from the CLI.
#[derive(clap::Subcommand)]
pub enum DispatchSubcommand {
    /// Queue a fine-tuning run for a task.
    Train(TrainArgs),

    /// Queue dataset generation over a project's uploaded documents.
    Dataset(DatasetArgs),

    /// Queue dataset generation over one embedded source document.
    Document(DocumentArgs),

    /// Queue a base-model download from the hub.
    Download(DownloadArgs),

    /// Queue a deployment-archive build for a finished task.
    Archive(ArchiveArgs),

    /// Queue a host-inventory push.
    Telemetry,
}

/// Arguments for `tuneforge dispatch train`.
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Task to fine-tune.
    #[arg(long)]
    pub task_id: TaskId,

    /// Training config file; defaults to the task's config under the data root.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Accelerators handed to the launcher.
    #[arg(long, default_value = "1")]
    pub num_gpus: u32,

    /// Resume from the last checkpoint instead of starting fresh.
    #[arg(long)]
    pub resume: bool,

    /// Skip synthetic validation/test dataset generation after training.
    #[arg(long)]
    pub no_synthetic: bool,
}

/// Arguments for `tuneforge dispatch dataset`.
#[derive(Parser, Debug)]
pub struct DatasetArgs {
    /// Dataset the generated pairs belong to.
    #[arg(long)]
    pub dataset_id: DatasetId,

    /// Project the dataset belongs to.
    #[arg(long)]
    pub project_id: ProjectId,

    /// Comma-separated document names to generate from.
    #[arg(long, value_delimiter = ',', required = true)]
    pub documents: Vec<String>,

    /// Pairs to request per document unit.
    #[arg(long, default_value = "5")]
    pub num_generations: u32,
}

/// Arguments for `tuneforge dispatch document`.
#[derive(Parser, Debug)]
pub struct DocumentArgs {
    /// Dataset the generated pairs belong to.
    #[arg(long)]
    pub dataset_id: DatasetId,

    /// Project the dataset belongs to.
    #[arg(long)]
    pub project_id: ProjectId,

    /// Source document whose embedded chunks feed the run.
    #[arg(long)]
    pub source: String,

    /// Pairs to request per chunk.
    #[arg(long, default_value = "5")]
    pub num_generations: u32,
}

/// Arguments for `tuneforge dispatch download`.
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Model registry record to update.
    #[arg(long)]
    pub model_id: ModelId,

    /// Hub repository, e.g. "mistralai/Mistral-7B-v0.1".
    #[arg(long)]
    pub repo: String,

    /// Hub revision.
    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Target directory; defaults to the hub cache under the data root.
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Arguments for `tuneforge dispatch archive`.
#[derive(Parser, Debug)]
pub struct ArchiveArgs {
    /// Task whose weights go into the archive.
    #[arg(long)]
    pub task_id: TaskId,

    /// Project the task belongs to.
    #[arg(long)]
    pub project_id: ProjectId,
}

/// Arguments for `tuneforge revoke`.
#[derive(Parser, Debug)]
pub struct RevokeArgs {
    /// Task whose running job should be terminated.
    #[arg(long)]
    pub task_id: TaskId,
}

/// Arguments for `tuneforge abort`.
#[derive(Parser, Debug)]
pub struct AbortArgs {
    /// Handle of the generation job to wind down.
    pub job_handle: String,
}

/// Deployment entrypoint arguments.
#[derive(Parser)]
pub struct DeploymentArgs {
    /// Deployment operation to run.
    #[command(subcommand)]
    pub command: DeploymentSubcommand,
}

/// Serving lifecycle operations.
#[derive(clap::Subcommand)]
pub enum DeploymentSubcommand {
    /// Start serving a fine-tuned model in a fresh container.
    Start(DeploymentStartArgs),

    /// Stop and remove a model's serving container.
    Stop(DeploymentModelArgs),

    /// Check a serving container, restarting it in place if it stopped.
    Check(DeploymentModelArgs),

    /// List deployment records.
    List,
}

/// Arguments for `tuneforge deployment start`.
#[derive(Parser, Debug)]
pub struct DeploymentStartArgs {
    /// Fine-tuned model (task) to serve.
    #[arg(long)]
    pub model_id: TaskId,

    /// Host port the container publishes.
    #[arg(long)]
    pub port: u16,

    /// Compute device, "xpu" or "cpu".
    #[arg(long, default_value = "xpu")]
    pub device: String,

    /// Host address the container binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub address: String,
}

/// Arguments for deployment operations keyed by model.
#[derive(Parser, Debug)]
pub struct DeploymentModelArgs {
    /// Fine-tuned model (task) the container belongs to.
    #[arg(long)]
    pub model_id: TaskId,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Lets `main` read `log_level` before any command runs.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and execute the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Execute the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid environment configuration")?;
    match cli.command {
        Commands::Worker => run_worker(config).await,
        Commands::Dispatch(args) => run_dispatch(args, &config).await,
        Commands::Revoke(args) => run_revoke(args, &config).await,
        Commands::Abort(args) => run_abort(args, &config).await,
        Commands::Deployment(args) => run_deployment(args, &config).await,
        Commands::Queues => run_queues(&config).await,
        Commands::Hardware => run_hardware(),
    }
}

async fn connect_broker(config: &AppConfig) -> anyhow::Result<JobBroker> {
    JobBroker::connect(&config.redis_url)
        .await
        .with_context(|| format!("could not connect to the job broker at {}", config.redis_url))
}

fn record_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store = HttpRecordStore::new(config.api_url.as_str())
        .with_context(|| format!("could not build a record store client for {}", config.api_url))?;
    Ok(Arc::new(store))
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    metrics::init_metrics().context("metrics registry initialization failed")?;

    let broker = connect_broker(&config).await?;
    let store = record_store(&config)?;
    let chunks = Arc::new(
        HttpChunkSource::new(config.api_url.as_str())
            .context("could not build a chunk source client")?,
    );
    let llm = Arc::new(ChatClient::from_config(&config));
    let context = WorkerContext::new(broker, store, chunks, llm, config);

    let pool = WorkerPool::start(context).await;
    info!(workers = pool.worker_count(), "worker node ready");

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for the shutdown signal")?;
    info!("shutdown signal received, draining workers");

    // a second interrupt skips the drain, like a cold worker shutdown
    tokio::select! {
        () = pool.shutdown() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("second interrupt, exiting without draining");
        }
    }
    Ok(())
}

// ============================================================================
// Dispatch
// ============================================================================

async fn run_dispatch(args: DispatchArgs, config: &AppConfig) -> anyhow::Result<()> {
    match args.command {
        DispatchSubcommand::Train(args) => run_dispatch_train(args, config).await,
        DispatchSubcommand::Dataset(args) => run_dispatch_dataset(args, config).await,
        DispatchSubcommand::Document(args) => run_dispatch_document(args, config).await,
        DispatchSubcommand::Download(args) => run_dispatch_download(args, config).await,
        DispatchSubcommand::Archive(args) => run_dispatch_archive(args, config).await,
        DispatchSubcommand::Telemetry => run_dispatch_telemetry(config).await,
    }
}

async fn run_dispatch_train(args: TrainArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let store = record_store(config)?;
    let layout = DataLayout::new(config.data_root.clone());
    let config_path = args
        .config
        .unwrap_or_else(|| layout.train_config(args.task_id));

    let job = Job::new(JobPayload::ModelFinetuning {
        task_id: args.task_id,
        config_path,
        num_gpus: args.num_gpus,
        resume_from_checkpoint: args.resume,
        synthetic_generation: !args.no_synthetic,
    });

    // reset the record before the job becomes visible to workers
    store
        .restart_task(args.task_id, job.handle.as_str())
        .await
        .with_context(|| format!("could not reset task {} for dispatch", args.task_id))?;
    broker.publish_job(&job).await?;

    println!(
        "dispatched training job {} for task {}",
        job.handle, args.task_id
    );
    Ok(())
}

async fn run_dispatch_dataset(args: DatasetArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let handle = broker
        .publish(JobPayload::DataGeneration {
            dataset_id: args.dataset_id,
            project_id: args.project_id,
            document_names: args.documents,
            num_generations: args.num_generations,
        })
        .await?;
    println!(
        "dispatched dataset generation job {handle} for dataset {}",
        args.dataset_id
    );
    Ok(())
}

async fn run_dispatch_document(args: DocumentArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let handle = broker
        .publish(JobPayload::DocumentDataGeneration {
            dataset_id: args.dataset_id,
            project_id: args.project_id,
            source_filename: args.source.clone(),
            num_generations: args.num_generations,
        })
        .await?;
    println!(
        "dispatched document generation job {handle} for {}",
        args.source
    );
    Ok(())
}

async fn run_dispatch_download(args: DownloadArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let layout = DataLayout::new(config.data_root.clone());
    let target_dir = args
        .dir
        .unwrap_or_else(|| layout.model_cache_dir().join(args.repo.replace('/', "--")));

    let handle = broker
        .publish(JobPayload::DownloadModel {
            model_id: args.model_id,
            repo_id: args.repo.clone(),
            revision: args.revision,
            target_dir,
        })
        .await?;
    println!("dispatched download job {handle} for {}", args.repo);
    Ok(())
}

async fn run_dispatch_archive(args: ArchiveArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let handle = broker
        .publish(JobPayload::PrepareDeploymentArchive {
            task_id: args.task_id,
            project_id: args.project_id,
        })
        .await?;
    println!(
        "dispatched archive job {handle} for task {}",
        args.task_id
    );
    Ok(())
}

async fn run_dispatch_telemetry(config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let handle = broker.publish(JobPayload::UpdateHardwareInfo).await?;
    println!("dispatched telemetry job {handle}");
    Ok(())
}

// ============================================================================
// Revoke / abort
// ============================================================================

async fn run_revoke(args: RevokeArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let store = record_store(config)?;

    let task = store
        .get_task(args.task_id)
        .await
        .with_context(|| format!("could not read task {}", args.task_id))?;
    let handle = task
        .job_handle
        .clone()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("task {} has no dispatched job to revoke", args.task_id)
        })?;

    // deployment teardown comes first so the container never outlives the task
    match DockerRuntime::connect() {
        Ok(runtime) => {
            let manager =
                ServingManager::new(Arc::new(runtime), Arc::clone(&store), config.clone());
            match manager.stop(args.task_id).await {
                Ok(true) => info!(task_id = args.task_id, "serving deployment removed"),
                Ok(false) => {}
                Err(error) => {
                    warn!(task_id = args.task_id, error = %error, "serving teardown failed")
                }
            }
        }
        Err(error) => {
            warn!(error = %error, "container runtime unavailable, skipping serving teardown")
        }
    }

    broker.revoke(&JobHandle::from(handle.as_str())).await?;
    store
        .update_task(args.task_id, &TaskPatch::status(TaskStatus::Revoked))
        .await
        .with_context(|| format!("could not mark task {} revoked", args.task_id))?;

    println!("revoked task {} (job {handle})", args.task_id);
    Ok(())
}

async fn run_abort(args: AbortArgs, config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let aborts = AbortController::new(broker.connection());
    let handle = JobHandle::from(args.job_handle.as_str());
    aborts
        .request_abort(&handle)
        .await
        .context("could not set the abort flag")?;
    println!("abort requested for job {handle}; it will wind down at its next checkpoint");
    Ok(())
}

// ============================================================================
// Deployment
// ============================================================================

async fn run_deployment(args: DeploymentArgs, config: &AppConfig) -> anyhow::Result<()> {
    match args.command {
        DeploymentSubcommand::Start(args) => run_deployment_start(args, config).await,
        DeploymentSubcommand::Stop(args) => run_deployment_stop(args, config).await,
        DeploymentSubcommand::Check(args) => run_deployment_check(args, config).await,
        DeploymentSubcommand::List => run_deployment_list(config).await,
    }
}

fn serving_manager(config: &AppConfig) -> anyhow::Result<ServingManager> {
    let runtime = DockerRuntime::connect().context("could not connect to the container runtime")?;
    let store = record_store(config)?;
    Ok(ServingManager::new(Arc::new(runtime), store, config.clone()))
}

async fn run_deployment_start(
    args: DeploymentStartArgs,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let device = match args.device.as_str() {
        "xpu" => DeviceKind::Xpu,
        "cpu" => DeviceKind::Cpu,
        other => anyhow::bail!("unknown device {other:?}, expected \"xpu\" or \"cpu\""),
    };

    let manager = serving_manager(config)?;
    let deployment = manager
        .start(args.model_id, device, &args.address, args.port)
        .await
        .with_context(|| format!("could not start serving model {}", args.model_id))?;

    println!(
        "serving model {} on {}:{} (container {})",
        deployment.model_id,
        deployment.host_address,
        deployment.host_port,
        config.container_name(deployment.model_id)
    );
    Ok(())
}

async fn run_deployment_stop(args: DeploymentModelArgs, config: &AppConfig) -> anyhow::Result<()> {
    let manager = serving_manager(config)?;
    let removed = manager
        .stop(args.model_id)
        .await
        .with_context(|| format!("could not stop serving model {}", args.model_id))?;
    if removed {
        println!("serving container for model {} removed", args.model_id);
    } else {
        println!("no serving container for model {}", args.model_id);
    }
    Ok(())
}

async fn run_deployment_check(args: DeploymentModelArgs, config: &AppConfig) -> anyhow::Result<()> {
    let manager = serving_manager(config)?;
    let health = manager
        .check(args.model_id)
        .await
        .with_context(|| format!("could not check serving model {}", args.model_id))?;
    match health {
        ServingHealth::Running => println!("model {} is serving", args.model_id),
        ServingHealth::Restarted => {
            println!("model {} container was stopped and has been restarted", args.model_id)
        }
    }
    Ok(())
}

async fn run_deployment_list(config: &AppConfig) -> anyhow::Result<()> {
    let store = record_store(config)?;
    let deployments = store
        .list_deployments()
        .await
        .context("could not list deployments")?;
    if deployments.is_empty() {
        println!("no deployments recorded");
        return Ok(());
    }
    for deployment in deployments {
        println!(
            "model {:<6} {}:{:<5} device {:<4} container {}",
            deployment.model_id,
            deployment.host_address,
            deployment.host_port,
            deployment.device.as_str(),
            config.container_name(deployment.model_id)
        );
    }
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_queues(config: &AppConfig) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    for stats in broker.all_stats().await? {
        println!(
            "{:<18} pending {:>5}  processing {:>5}",
            stats.queue.as_str(),
            stats.pending,
            stats.processing
        );
    }
    Ok(())
}

fn run_hardware() -> anyhow::Result<()> {
    let info = hardware::collect_hardware_info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
