use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tevents_adapters::{load_fixture_feed, HttpPageFetcher, PageFetcher};
use tevents_storage::{EventStore, HttpFetcher, MemoryEventStore, PgEventStore};
use tevents_sync::{
    PassReport, StoreBackend, SyncConfig, SyncPipeline, SyncScheduler, DAILY_SYNC_CRON,
};
use tevents_web::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tevents-cli")]
#[command(about = "Trento events ingestion and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prune past events and run one sync pass.
    Sync(FeedArgs),
    /// Clear the store, then run one sync pass.
    Reset(FeedArgs),
    /// Apply pending database migrations.
    Migrate,
    /// Reset on startup, sync daily, and serve the read API.
    Serve {
        #[command(flatten)]
        feed: FeedArgs,
        #[arg(long, env = "TEVENTS_WEB_PORT")]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct FeedArgs {
    /// Overrides TRENTO_API_URL.
    #[arg(long)]
    feed_url: Option<String>,
    /// Serve pages from a fixture manifest instead of the network.
    #[arg(long, value_name = "MANIFEST")]
    fixtures: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or_else(|| Commands::Sync(FeedArgs::default())) {
        Commands::Sync(feed) => {
            let pipeline = build_pipeline(&config, &feed, open_store(&config, false).await?)?;
            finish(pipeline.run_pass().await)?;
        }
        Commands::Reset(feed) => {
            let pipeline = build_pipeline(&config, &feed, open_store(&config, false).await?)?;
            finish(pipeline.reset_and_sync().await)?;
        }
        Commands::Migrate => {
            if config.store_backend == StoreBackend::Memory {
                bail!("migrate needs the postgres store backend");
            }
            let store = PgEventStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
        }
        Commands::Serve { feed, port } => {
            serve(&config, &feed, port.unwrap_or(config.web_port)).await?;
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig, migrate: bool) -> Result<Arc<dyn EventStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("using in-memory event store; contents are lost on exit");
            Ok(Arc::new(MemoryEventStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PgEventStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            if migrate {
                store.migrate().await.context("applying migrations")?;
            }
            Ok(Arc::new(store))
        }
    }
}

fn build_pipeline(
    config: &SyncConfig,
    feed: &FeedArgs,
    store: Arc<dyn EventStore>,
) -> Result<SyncPipeline> {
    if let Some(manifest_path) = &feed.fixtures {
        let (manifest, fetcher) = load_fixture_feed(manifest_path)?;
        info!(source = %manifest.source_id, "serving feed from fixtures");
        return Ok(SyncPipeline::new(manifest.start_url, Arc::new(fetcher), store));
    }

    let http = HttpFetcher::new(config.http_client_config()).context("building HTTP client")?;
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpPageFetcher::new(http));
    let feed_url = feed.feed_url.clone().unwrap_or_else(|| config.feed_url.clone());
    Ok(SyncPipeline::new(feed_url, fetcher, store))
}

fn finish(report: PassReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        bail!("sync pass {} failed", report.run_id);
    }
    Ok(())
}

async fn serve(config: &SyncConfig, feed: &FeedArgs, port: u16) -> Result<()> {
    let store = open_store(config, true).await?;

    let pipeline = Arc::new(build_pipeline(config, feed, Arc::clone(&store))?);
    let scheduler = SyncScheduler::new(pipeline);

    let startup = scheduler.clone();
    tokio::spawn(async move {
        if let Some(report) = startup.trigger_reset().await {
            info!(run_id = %report.run_id, ok = report.is_success(), "startup reset finished");
        }
    });

    let mut cron = if config.scheduler_enabled {
        Some(scheduler.start(DAILY_SYNC_CRON).await?)
    } else {
        info!("daily sync disabled");
        None
    };

    let served = tevents_web::serve(port, AppState::new(store), shutdown_signal()).await;

    if let Some(sched) = cron.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
