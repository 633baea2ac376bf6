use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::future::try_join_all;
use mash_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use mash_core::JobDocument;
use mash_core::broker::{Broker, InMemoryBroker, RedisBroker};
use mash_core::job_creator::{
    HttpStatusSink, JobCreator, LogStatusSink, MessageBuilders, StatusSink, SubmitOutcome,
};
use mash_core::listener::{CommandWorkerFactory, StageRuntime, StageRuntimeConfig};
use mash_core::notify::{BrokerNotifier, LogNotifier, Notifier};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "mash-server")]
#[command(about = "Runs the stage runtimes and job creator of a mash image pipeline")]
struct Cli {
    /// Path to the configuration file (defaults to mash.toml or config/mash.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before the environment is read
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Use the in-process broker instead of Redis. Messages never leave this
    /// process, so this is only useful together with `pipeline`.
    #[arg(long, env = "MASH_IN_MEMORY", default_value_t = false, global = true)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the stage runtime of one service
    Listener(ListenerArgs),
    /// Run the job creator
    JobCreator,
    /// Run the job creator and every stage runtime in one process
    Pipeline(PipelineArgs),
}

impl Command {
    fn role(&self) -> &str {
        match self {
            Command::Listener(args) => &args.service,
            Command::JobCreator => "jobcreator",
            Command::Pipeline(_) => "pipeline",
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct WorkerArgs {
    /// Program run once per job by the stage runtime
    #[arg(long = "command", env = "MASH_WORKER_COMMAND")]
    program: PathBuf,

    /// Arguments passed to the program, after `--`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone)]
struct ListenerArgs {
    /// Service (stage) name, one of the configured pipeline services
    #[arg(long, env = "MASH_SERVICE")]
    service: String,

    /// Concurrent jobs for this stage (overrides config)
    #[arg(long)]
    max_workers: Option<usize>,

    #[command(flatten)]
    worker: WorkerArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct PipelineArgs {
    /// Job documents (JSON) submitted once every runtime is listening
    #[arg(long = "submit")]
    submit: Vec<PathBuf>,

    #[command(flatten)]
    worker: WorkerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let broker = connect_broker(&config, cli.in_memory, cli.command.role()).await?;
    let shutdown = shutdown_on_ctrl_c();

    match cli.command {
        Command::Listener(args) => {
            run_listener(&config, broker, cli.in_memory, args, shutdown).await
        }
        Command::JobCreator => run_job_creator(&config, broker, cli.in_memory, shutdown).await,
        Command::Pipeline(args) => {
            run_pipeline(&config, broker, cli.in_memory, args, shutdown).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mash::job=info,redis=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "configuration loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

/// Opens the broker connection. A broker that cannot be reached at startup
/// is fatal.
async fn connect_broker(
    config: &Config,
    in_memory: bool,
    role: &str,
) -> anyhow::Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = if in_memory {
        warn!("using the in-process broker; messages do not leave this process");
        Arc::new(InMemoryBroker::new())
    } else {
        let redis = RedisBroker::new(&config.broker.url, config.consumer_name(role))
            .context("failed to create broker client")?
            .with_block_timeout(config.broker.block_timeout);
        Arc::new(redis)
    };

    broker
        .connect()
        .await
        .with_context(|| format!("failed to connect to broker at {}", config.broker.url))?;
    Ok(broker)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
        trigger.cancel();
    });
    token
}

fn notifier(broker: &Arc<dyn Broker>, in_memory: bool) -> Arc<dyn Notifier> {
    if in_memory {
        Arc::new(LogNotifier)
    } else {
        Arc::new(BrokerNotifier::new(Arc::clone(broker)))
    }
}

fn status_sink(config: &Config) -> Arc<dyn StatusSink> {
    match &config.persistence.status_url {
        Some(url) => {
            info!(url = %url, "forwarding job status to the status service");
            Arc::new(HttpStatusSink::new(url.as_str()))
        }
        None => Arc::new(LogStatusSink),
    }
}

async fn build_runtime(
    config: &Config,
    broker: &Arc<dyn Broker>,
    in_memory: bool,
    service: &str,
    max_workers: Option<usize>,
    worker: &WorkerArgs,
) -> anyhow::Result<StageRuntime> {
    let runtime_config = StageRuntimeConfig {
        service: service.to_string(),
        order: config.service_order().context("invalid pipeline services")?,
        job_directory: config.stage_directory(service),
        max_workers: max_workers.unwrap_or(config.listener.max_workers),
        credentials_retry: config.listener.credentials_retry,
        recurring_interval: config.listener.recurring_interval,
    };
    let factory = Arc::new(CommandWorkerFactory::new(
        worker.program.clone(),
        worker.args.clone(),
    ));
    let notifier = config
        .notification
        .from_listener()
        .then(|| notifier(broker, in_memory));

    StageRuntime::new(runtime_config, Arc::clone(broker), factory, notifier)
        .await
        .with_context(|| format!("failed to start stage runtime `{service}`"))
}

fn build_job_creator(
    config: &Config,
    broker: &Arc<dyn Broker>,
    in_memory: bool,
) -> anyhow::Result<JobCreator> {
    let order = config.service_order().context("invalid pipeline services")?;
    let notifier = config
        .notification
        .from_job_creator()
        .then(|| notifier(broker, in_memory));
    Ok(JobCreator::new(
        order,
        Arc::clone(broker),
        MessageBuilders::default(),
        status_sink(config),
        notifier,
    ))
}

async fn run_listener(
    config: &Config,
    broker: Arc<dyn Broker>,
    in_memory: bool,
    args: ListenerArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let runtime = build_runtime(
        config,
        &broker,
        in_memory,
        &args.service,
        args.max_workers,
        &args.worker,
    )
    .await?;
    info!(
        service = %args.service,
        program = %args.worker.program.display(),
        "starting stage runtime"
    );
    runtime
        .run(shutdown)
        .await
        .with_context(|| format!("stage runtime `{}` stopped", args.service))
}

async fn run_job_creator(
    config: &Config,
    broker: Arc<dyn Broker>,
    in_memory: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let creator = build_job_creator(config, &broker, in_memory)?;
    info!(services = ?config.pipeline.services, "starting job creator");
    creator.run(shutdown).await.context("job creator stopped")
}

async fn run_pipeline(
    config: &Config,
    broker: Arc<dyn Broker>,
    in_memory: bool,
    args: PipelineArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let creator = build_job_creator(config, &broker, in_memory)?;
    creator.bind().await.context("failed to bind job creator queues")?;

    let mut runtimes = Vec::with_capacity(config.pipeline.services.len());
    for service in &config.pipeline.services {
        let runtime =
            build_runtime(config, &broker, in_memory, service, None, &args.worker).await?;
        runtime
            .bind()
            .await
            .with_context(|| format!("failed to bind queues for `{service}`"))?;
        runtimes.push(runtime);
    }

    let mut tasks = Vec::with_capacity(runtimes.len() + 1);
    for runtime in runtimes {
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { runtime.run(shutdown).await }));
    }
    tasks.push(tokio::spawn({
        let creator = creator.clone();
        let shutdown = shutdown.clone();
        async move { creator.run(shutdown).await }
    }));

    for path in &args.submit {
        let doc = read_job_document(path)?;
        match creator.submit(doc).await {
            Ok(SubmitOutcome::Accepted(stages)) => {
                info!(path = %path.display(), stages = ?stages, "job submitted")
            }
            Ok(SubmitOutcome::Duplicate) => {
                warn!(path = %path.display(), "job already in flight")
            }
            Err(err) => error!(path = %path.display(), error = %err, "job rejected"),
        }
    }

    for result in try_join_all(tasks).await.context("pipeline task panicked")? {
        result.context("pipeline component stopped")?;
    }
    Ok(())
}

fn read_job_document(path: &Path) -> anyhow::Result<JobDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job document {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse job document {}", path.display()))
}
