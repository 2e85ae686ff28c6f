use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use gazette_crawl::{
    default_run_id, run_crawl_from_config, run_migrations, source_adapter, CrawlConfig, CrawlRequest,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gazette-cli")]
#[command(about = "Official gazette crawler (calendar and date-range search sources)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl one source: a calendar from its start date up to today, or a
    /// search source over a date window.
    Crawl(CrawlArgs),
    /// Apply the embedded SQL migrations.
    Migrate,
}

#[derive(Debug, Args)]
struct CrawlArgs {
    /// Source slug, e.g. `dogc` or `boe`.
    slug: String,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    daily_base_url: Option<String>,
    /// First issue date to collect (YYYY-MM-DD).
    #[arg(long)]
    start_at: Option<NaiveDate>,
    /// Per-action browser timeout.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    #[arg(long)]
    max_steps: Option<u32>,
    #[arg(long, conflicts_with = "headed")]
    headless: bool,
    #[arg(long)]
    headed: bool,
    /// After the calendar pass, open each journal without notices and store them.
    #[arg(long)]
    with_notices: bool,
    /// Search sources: crawl a single issue date.
    #[arg(long, conflicts_with_all = ["from_date", "to_date"])]
    day: Option<NaiveDate>,
    /// Search sources: first issue date of the window.
    #[arg(long, requires = "to_date")]
    from_date: Option<NaiveDate>,
    /// Search sources: last issue date of the window.
    #[arg(long, requires = "from_date")]
    to_date: Option<NaiveDate>,
}

impl CrawlArgs {
    fn into_request(self, run_id: String) -> CrawlRequest {
        let headless = match (self.headless, self.headed) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        CrawlRequest {
            slug: self.slug,
            run_id: Some(run_id),
            base_url: self.base_url,
            daily_base_url: self.daily_base_url,
            start_at: self.start_at,
            timeout_secs: self.timeout,
            max_steps: self.max_steps,
            headless,
            with_notices: self.with_notices.then_some(true),
            day: self.day,
            from_date: self.from_date,
            to_date: self.to_date,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "gazette-cli failed");
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = CrawlConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            init_tracing(None)?;
            run_migrations(&config).await?;
            println!("migrations applied");
            Ok(0)
        }
        Commands::Crawl(args) => {
            let run_id = args.run_id.clone().unwrap_or_else(default_run_id);
            let run_dir = create_run_dir(&config, &args.slug, &run_id)?;
            init_tracing(Some(&run_dir.join("crawler.log")))?;

            let result = run_crawl_from_config(&config, &args.into_request(run_id)).await?;
            println!(
                "crawl {}: run_id={} slug={} steps={} final_state={} journals created={} updated={} unchanged={} notices={}",
                if result.completed { "complete" } else { "failed" },
                result.run_id,
                result.slug,
                result.steps_executed,
                result.final_state,
                result.journals_created,
                result.journals_updated,
                result.journals_unchanged,
                result.notices_upserted
            );
            if let Some(err) = &result.error {
                eprintln!("error ({:?}): {err}", err.kind());
            }
            println!("artifacts: {}", run_dir.display());
            Ok(result.exit_code())
        }
    }
}

/// Creates the artifact directory of one run. Unknown slugs are rejected
/// first, so a slug never becomes a path before it is known to be valid.
fn create_run_dir(config: &CrawlConfig, slug: &str, run_id: &str) -> Result<PathBuf> {
    source_adapter(slug)?;
    let run_dir = config.artifact_store().run_dir(slug, run_id);
    fs::create_dir_all(&run_dir).with_context(|| format!("creating run directory {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Stdout logging, plus a plain-text copy in `log_file` when given.
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,gazette_crawl=debug".into()))
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();
    Ok(())
}
