use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use portalis_core::country::normalize_iso2;
use portalis_core::{JobKind, JobSpec};
use portalis_storage::FallbackStore;
use portalis_worker::{
    build_gateway, connect_queue, replay_fallback, run_once, run_worker, JobQueue, PgQueue,
    WorkerConfig,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "portalis")]
#[command(about = "Portalis ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and worker until interrupted.
    Run,
    /// Run one job inline, bypassing the queue.
    Once {
        kind: Kind,
        #[arg(long, default_value = "default")]
        preset: String,
        /// Comma-separated ISO2 codes or FCDO slugs; defaults to MONITOR_COUNTRIES.
        #[arg(long, value_delimiter = ',')]
        countries: Vec<String>,
    },
    /// Create the job queue tables.
    Migrate,
    /// Ping the queue and the analytical store.
    Health,
    /// Replay fallback blobs into the analytical store.
    ImportFallback,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Indicators,
    Advisories,
    Airquality,
}

impl Kind {
    fn job_kind(self) -> JobKind {
        match self {
            Self::Indicators => JobKind::Indicators,
            Self::Advisories => JobKind::Advisories,
            Self::Airquality => JobKind::AirQuality,
        }
    }

    fn default_preset(self) -> &'static str {
        match self {
            Self::Indicators => "economic",
            Self::Advisories => "all",
            Self::Airquality => "essential",
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portalis=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let config = WorkerConfig::from_env();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_worker(config).await?,
        Commands::Once {
            kind,
            preset,
            countries,
        } => {
            let countries = if countries.is_empty() {
                config.countries.clone()
            } else if matches!(kind, Kind::Advisories) {
                countries.iter().map(|c| c.trim().to_lowercase()).collect()
            } else {
                countries.iter().filter_map(|c| normalize_iso2(c)).collect()
            };
            let name = if preset == "default" {
                kind.default_preset()
            } else {
                preset.as_str()
            };
            let Some(spec) = JobSpec::preset(kind.job_kind(), name, &countries) else {
                bail!("unknown preset `{name}` for {}", kind.job_kind());
            };
            let outcome = run_once(&config, &spec).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Migrate => {
            let Some(url) = config.queue_database_url.as_deref() else {
                bail!("QUEUE_DATABASE_URL or DATABASE_URL must be set to migrate");
            };
            let queue = PgQueue::connect(url, config.queue_policy())
                .await
                .context("connecting to the job queue database")?;
            queue.ensure_schema().await.context("creating queue tables")?;
            println!("queue schema ready");
        }
        Commands::Health => {
            let queue = connect_queue(&config).await?;
            let gateway = build_gateway(&config)?;
            let queue_ok = queue.ping().await.is_ok();
            let store_ok = gateway.ping().await;
            println!("queue: {}", if queue_ok { "ok" } else { "down" });
            println!("store: {}", if store_ok { "ok" } else { "down" });
            if !(queue_ok && store_ok) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::ImportFallback => {
            let fallback = FallbackStore::new(&config.fallback_dir);
            let gateway = build_gateway(&config)?;
            let summary = replay_fallback(&fallback, &gateway).await?;
            info!(
                blobs_imported = summary.blobs_imported,
                records_imported = summary.records_imported,
                blobs_failed = summary.blobs_failed,
                "fallback import finished"
            );
            println!(
                "import complete: blobs={} records={} failed={}",
                summary.blobs_imported, summary.records_imported, summary.blobs_failed
            );
            if summary.blobs_failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
