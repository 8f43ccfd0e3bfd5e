use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turbobackend_worker::agent::integrations::IntegrationStore;
use turbobackend_worker::bus::{Publisher, RedisBus};
use turbobackend_worker::config::WorkerConfig;
use turbobackend_worker::db;
use turbobackend_worker::db::Store;
use turbobackend_worker::deploy::FlyApi;
use turbobackend_worker::github::GithubApi;
use turbobackend_worker::ledger::Ledger;
use turbobackend_worker::llm::AnthropicClient;
use turbobackend_worker::pipeline::creation::CreationPipeline;
use turbobackend_worker::pipeline::modification::ModificationPipeline;
use turbobackend_worker::pipeline::secret_sync::SecretSyncProcessor;
use turbobackend_worker::pipeline::WorkerContext;
use turbobackend_worker::queue::{QueueConfig, RedisQueue};
use turbobackend_worker::sandbox::docker::DockerProvider;
use turbobackend_worker::worker::{ProcessorRegistry, WorkerRuntime};

#[derive(Parser)]
#[command(name = "turbobackend-worker")]
#[command(version, about = "Backend-generation job worker")]
struct Cli {
    /// Override WORKER_CONCURRENCY.
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume and process jobs (default).
    Run,
    /// Apply the control-database schema and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }

    let pool = db::connect_pool(&config.database_url).await?;
    let store = Store::new(config.db_schema.clone());
    store.migrate(&pool).await?;

    if matches!(cli.command, Some(Commands::Migrate)) {
        info!("Migrations applied");
        return Ok(());
    }

    let bus = Arc::new(RedisBus::connect(&config.redis_url).await?);
    let publisher = Publisher::new(bus);
    let queue = Arc::new(RedisQueue::connect(&config.redis_url, QueueConfig::default()).await?);

    let ledger = Ledger::new(store.clone(), config.environment.clone());
    let agent_llm = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
        config.agent_model.clone(),
    ));
    let detector_llm = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
        config.detector_model.clone(),
    ));
    let sandboxes = Arc::new(DockerProvider::connect(config.sandbox_image.clone())?);
    let github = Arc::new(GithubApi::new(
        config.github_token.clone(),
        config.github_owner.clone(),
    ));
    let fly = Arc::new(FlyApi::new(
        config.fly_api_token.clone(),
        config.fly_org.clone(),
    ));
    let integrations = Arc::new(IntegrationStore::new(config.integrations_dir.clone()));

    let concurrency = config.concurrency;
    let wipe_on_shutdown = !config.is_production();
    let context = Arc::new(WorkerContext {
        config,
        pool: pool.clone(),
        store,
        ledger,
        publisher,
        agent_llm,
        detector_llm,
        sandboxes,
        github,
        fly,
        integrations,
    });

    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(CreationPipeline::new(context.clone())));
    registry.register(Arc::new(ModificationPipeline::new(context.clone())));
    registry.register(Arc::new(SecretSyncProcessor::new(context.clone())));

    let runtime = WorkerRuntime::new(queue, registry, concurrency, wipe_on_shutdown);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    runtime.run(shutdown_rx).await?;

    // Close order: worker has stopped, queue and publisher connections drop
    // with their owners, the control pool closes last.
    pool.close().await;
    info!("Worker exited cleanly");
    Ok(())
}
