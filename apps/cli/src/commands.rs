//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use enricher_core::TaskQueue;
use enricher_shared::{AppConfig, init_config, load_config, load_config_from, render_config};
use enricher_storage::Storage;

use crate::engine::Engine;
use crate::server::{self, AppState};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// enricher: company enrichment from a website.
#[derive(Parser)]
#[command(
    name = "enricher",
    version,
    about = "Enrich company records from their websites: discover, extract, synthesize.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.enricher/enricher.toml).
    #[arg(long, global = true, env = "ENRICHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Serve the HTTP intake and process enqueued entities.
    Serve {
        /// Listen address (overrides [server].bind).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Import sources from a JSON Lines file.
    Import {
        /// One request object per line: website, name, industry, ...
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Dispatch pending sources and process them to completion.
    Run {
        /// Only sources of this industry.
        #[arg(long)]
        industry: Option<String>,

        /// Maximum number of sources to dispatch.
        #[arg(long, default_value = "1000")]
        limit: usize,

        /// Unacknowledged units allowed at once (overrides [queue].max_outstanding).
        #[arg(long)]
        max_outstanding: Option<usize>,
    },

    /// Print per-status and per-industry statistics.
    Stats {
        /// Also list this many recent dead letters.
        #[arg(long, default_value = "0")]
        dead_letters: usize,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "enricher=info",
        1 => "enricher=debug",
        _ => "enricher=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Serve { bind } => cmd_serve(config_path, bind).await,
        Command::Import { file } => cmd_import(config_path, &file).await,
        Command::Run {
            industry,
            limit,
            max_outstanding,
        } => cmd_run(config_path, industry.as_deref(), limit, max_outstanding).await,
        Command::Stats { dead_letters } => cmd_stats(config_path, dead_letters).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn cmd_serve(config_path: Option<&Path>, bind: Option<String>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let engine = Engine::start(&config).await?;

    let app = server::router(AppState {
        storage: engine.storage.clone(),
        queue: engine.queue.clone(),
        dispatcher: engine.dispatcher.clone(),
        max_outstanding: engine.queue_config.max_outstanding,
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| eyre!("cannot bind {bind}: {e}"))?;
    info!(bind = %bind, "listening");
    println!("enricher listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    engine.stop().await;
    Ok(())
}

async fn cmd_import(config_path: Option<&Path>, file: &Path) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = Storage::open(Path::new(&config.storage.path)).await?;
    let report = storage.import_sources_jsonl(file).await?;

    println!();
    println!("  Imported: {}", report.imported);
    println!("  Skipped:  {}", report.skipped);
    println!();
    Ok(())
}

async fn cmd_run(
    config_path: Option<&Path>,
    industry: Option<&str>,
    limit: usize,
    max_outstanding: Option<usize>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let engine = Engine::start(&config).await?;
    let max_outstanding = max_outstanding.unwrap_or(engine.queue_config.max_outstanding);

    let sources = engine.storage.pending_sources(industry, limit).await?;
    if sources.is_empty() {
        println!("No pending sources.");
        engine.stop().await;
        return Ok(());
    }

    info!(
        industry = industry.unwrap_or("*"),
        count = sources.len(),
        max_outstanding,
        "running batch"
    );

    let bar = ProgressBar::new(sources.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .map_err(|e| eyre!("invalid progress template: {e}"))?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let ticker = {
        let bar = bar.clone();
        let mut settled = engine.queue.settlements();
        tokio::spawn(async move {
            while settled.changed().await.is_ok() {
                let count = *settled.borrow_and_update();
                bar.set_position(count);
            }
        })
    };

    let report = engine.dispatcher.dispatch(sources, max_outstanding).await?;
    bar.set_message(format!("{} dispatched, waiting", report.published));

    let storage = engine.storage.clone();
    engine.drain().await;
    ticker.abort();
    bar.finish_and_clear();

    let counts = storage.count_by_status().await?;
    println!();
    println!("  Dispatched: {}", report.published);
    println!("  Duplicates: {}", report.duplicates);
    println!("  Invalid:    {}", report.invalid);
    for (status, count) in counts {
        println!("  {:<13} {count}", format!("{status}:"));
    }
    println!();
    Ok(())
}

async fn cmd_stats(config_path: Option<&Path>, dead_letters: usize) -> Result<()> {
    let config = resolve_config(config_path)?;
    let path = PathBuf::from(&config.storage.path);
    if !path.exists() {
        return Err(eyre!(
            "no database at '{}'. Run `enricher import` first.",
            path.display()
        ));
    }
    let storage = Storage::open_readonly(&path).await?;

    let counts = storage.count_by_status().await?;
    let total: u64 = counts.values().sum();
    println!();
    println!("  Records: {total}");
    for (status, count) in &counts {
        println!("  {:<13} {count}", format!("{status}:"));
    }

    let industries = storage.industry_stats().await?;
    if !industries.is_empty() {
        println!();
        println!(
            "  {:<20} {:>7} {:>9} {:>8} {:>10} {:>12}",
            "industry", "total", "completed", "rate%", "avg_hyp", "no_employees"
        );
        for row in industries {
            println!(
                "  {:<20} {:>7} {:>9} {:>8.2} {:>10.2} {:>12}",
                row.industry,
                row.total,
                row.completed,
                row.completion_rate,
                row.avg_hypotheses,
                row.missing_employees
            );
        }
    }

    if dead_letters > 0 {
        let letters = storage.list_dead_letters(dead_letters).await?;
        println!();
        println!("  Dead letters: {}", letters.len());
        for letter in letters {
            println!(
                "  {} {} ({} attempts) {}",
                letter.created_at,
                letter.entity_id.as_deref().unwrap_or("-"),
                letter.attempts,
                letter.reason
            );
        }
    }
    println!();
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, render_config(&AppConfig::default())?)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    println!("{}", render_config(&config)?);
    Ok(())
}
