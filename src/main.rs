use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use gather::config::Config;
use gather::engine::Engine;
use gather::feed;
use gather::storage::Database;

/// Get the config directory path (~/.config/gather/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("gather"))
}

#[derive(Parser, Debug)]
#[command(
    name = "gather",
    about = "Local-first feed aggregation engine with adaptive per-feed polling"
)]
struct Args {
    /// Database path (default: ~/.config/gather/feeds.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Config file path (default: ~/.config/gather/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Import subscriptions before doing anything else: an OPML file, or
    /// a plain list with one feed URL per line (# comments allowed)
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Export subscriptions to an OPML file and exit
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Run a single sweep and exit instead of starting the scheduler
    #[arg(long)]
    once: bool,

    /// With --once: sweep every feed, not only those currently due
    #[arg(long)]
    full: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    let db_path = args.db.unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .context("Failed to open database")?;

    let engine = Engine::new(db.clone(), config).context("Failed to create engine")?;

    // Handle --import flag
    if let Some(import_file) = &args.import {
        let content = std::fs::read_to_string(import_file)
            .with_context(|| format!("Failed to read {}", import_file.display()))?;
        let pairs: Vec<(String, Option<String>)> = if content.contains("<opml")
            || content.contains("<outline")
        {
            feed::parse_opml(&content)
                .context("Failed to parse OPML file")?
                .into_iter()
                .map(|o| (o.url, o.title))
                .collect()
        } else {
            // Plain list: one URL per line, # for comments
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| (line.to_string(), None))
                .collect()
        };
        let stats = engine
            .import_feeds(&pairs)
            .await
            .context("Failed to import feeds")?;
        println!(
            "Imported {} feeds ({} already subscribed)",
            stats.imported, stats.skipped
        );
    }

    // Handle --export flag
    if let Some(export_file) = &args.export {
        let feeds = db.list_feeds(None, 1000).await?;
        let xml = feed::export_opml(&feeds).context("Failed to build OPML")?;
        std::fs::write(export_file, xml)
            .with_context(|| format!("Failed to write {}", export_file.display()))?;
        println!("Exported {} feeds to {}", feeds.len(), export_file.display());
        return Ok(());
    }

    let feed_count = db.feed_count().await?;
    if feed_count == 0 {
        eprintln!("No feeds subscribed yet.");
        eprintln!();
        eprintln!("To get started, import your OPML file:");
        eprintln!("  gather --import /path/to/your/feeds.opml");
        if args.import.is_none() {
            std::process::exit(1);
        }
    }

    // Handle --once flag: a single synchronous sweep, no scheduler
    if args.once {
        let stats = engine.sweep_now(args.full).await?;
        println!(
            "Sweep complete: {} checked, {} updated, {} errors (of {} feeds)",
            stats.checked, stats.updated, stats.errors, stats.total
        );
        return Ok(());
    }

    let stats = db
        .stats(gather::util::cutoff_ts(engine.config().retention_days))
        .await?;
    println!(
        "Watching {} feeds ({} unread, {} bookmarked; tick every {}s). Ctrl-C to stop.",
        stats.feeds,
        stats.unread,
        stats.bookmarked,
        engine.config().tick_seconds
    );
    let scheduler = engine.spawn_scheduler();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    scheduler.abort();
    println!("Goodbye!");
    Ok(())
}
