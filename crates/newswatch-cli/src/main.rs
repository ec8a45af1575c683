use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use newswatch_ingest::{
    load_keywords, load_source_registry, run_ingest, IngestSettings, RunSummary, SourceStatus,
};
use newswatch_storage::NewsStore;
use tracing::info;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "newswatch")]
#[command(about = "Keyword-filtered news ingestion into a local JSON store")]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct PathArgs {
    /// Article store (defaults to NEWSWATCH_STORE or ./news.json).
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    #[arg(long, global = true)]
    keywords: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and merge qualifying articles.
    Run {
        #[arg(long)]
        reports_dir: Option<PathBuf>,
        #[arg(long)]
        max_records: Option<usize>,
        #[arg(long)]
        window_hours: Option<i64>,
    },
    /// Validate configuration and the store without fetching.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let mut settings = IngestSettings::from_env();
    if let Some(store) = cli.paths.store {
        settings.store_path = store;
    }
    if let Some(sources) = cli.paths.sources {
        settings.sources_path = sources;
    }
    if let Some(keywords) = cli.paths.keywords {
        settings.keywords_path = keywords;
    }

    let command = cli.command.unwrap_or(Commands::Run {
        reports_dir: None,
        max_records: None,
        window_hours: None,
    });
    match command {
        Commands::Run {
            reports_dir,
            max_records,
            window_hours,
        } => {
            if reports_dir.is_some() {
                settings.reports_dir = reports_dir;
            }
            if max_records.is_some() {
                settings.max_records = max_records;
            }
            if let Some(hours) = window_hours {
                settings.window_hours = hours;
            }
            let summary = run_ingest(&settings).await?;
            print_summary(&summary);
        }
        Commands::Check => check(&settings).await?,
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for source in &summary.sources {
        let status = match &source.status {
            SourceStatus::Completed => "ok".to_string(),
            SourceStatus::Failed { error } => format!("failed ({error})"),
        };
        println!(
            "{:<16} accepted={} duplicates={} irrelevant={} stale={} pages={} {}",
            source.source_id,
            source.accepted,
            source.duplicates,
            source.irrelevant,
            source.stale,
            source.pages,
            status
        );
    }
    println!(
        "run complete: run_id={} accepted={} duplicates={} store_size={} persisted={}",
        summary.run_id,
        summary.total_accepted,
        summary.total_duplicates,
        summary.store_size,
        summary.persisted
    );
}

async fn check(settings: &IngestSettings) -> Result<()> {
    let registry = load_source_registry(&settings.sources_path).await?;
    let keywords = load_keywords(&settings.keywords_path).await?;
    let records = NewsStore::new(&settings.store_path)
        .load()
        .await
        .with_context(|| format!("checking store {}", settings.store_path.display()))?;

    let enabled = registry.sources.iter().filter(|s| s.enabled).count();
    info!(
        sources = registry.sources.len(),
        enabled,
        keywords = keywords.include.len(),
        records = records.len(),
        "configuration ok"
    );
    println!(
        "ok: {} sources ({} enabled), {} keywords, {} excluded terms, {} stored articles",
        registry.sources.len(),
        enabled,
        keywords.include.len(),
        keywords.exclude.len(),
        records.len()
    );
    Ok(())
}
