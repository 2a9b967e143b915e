//! Waddle message archive daemon.
//!
//! Runs the archive maintenance schedule and offers operator commands against
//! the configured archive database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jid::{BareJid, Jid};
use tracing::info;

use waddle_mam::handler::NoRooms;
use waddle_mam::{load_config_from, load_default_config, ArchiveConfig, MonitoringService, QueryRequest};

mod telemetry;

/// Waddle message archive (XEP-0313)
#[derive(Parser)]
#[command(name = "waddle-mam-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults plus WADDLE_MAM_* overrides when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run archivers and maintenance until Ctrl-C (default)
    Serve,
    /// Rebuild the full-text index from the archive
    RebuildIndex,
    /// Query an archive and print the page as JSON
    Query {
        /// Archive owner: a user's bare JID, or the room with --room
        #[arg(short, long)]
        owner: String,

        /// Treat the owner as a room, read on behalf of this user
        #[arg(short, long)]
        room: Option<String>,

        /// Only messages exchanged with this JID
        #[arg(short, long)]
        with: Option<String>,

        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        start: Option<String>,

        /// Inclusive upper bound (RFC 3339)
        #[arg(long)]
        end: Option<String>,

        /// Full-text search terms
        #[arg(short, long)]
        text: Option<String>,

        /// Page size
        #[arg(short, long)]
        max: Option<i64>,

        #[arg(long)]
        after: Option<String>,

        #[arg(long)]
        before: Option<String>,

        /// Page from the end of the archive
        #[arg(long)]
        backwards: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ArchiveConfig> {
    match path {
        Some(path) => load_config_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => load_default_config().context("Failed to load default configuration"),
    }
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp '{}'", v))
        })
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    telemetry::init(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Waddle message archive starting");
    config.log_config();

    let service = MonitoringService::open(config, Arc::new(NoRooms))
        .await
        .context("Failed to open the message archive")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&service).await,
        Commands::RebuildIndex => rebuild_index(&service).await,
        Commands::Query {
            owner,
            room,
            with,
            start,
            end,
            text,
            max,
            after,
            before,
            backwards,
        } => {
            let owner: BareJid = owner.parse().context("Invalid owner JID")?;
            let mut request = match room {
                Some(reader) => QueryRequest::room(
                    owner,
                    reader.parse().context("Invalid room reader JID")?,
                ),
                None => QueryRequest::personal(owner),
            };
            request.with = with
                .map(|w| w.parse::<Jid>())
                .transpose()
                .context("Invalid 'with' JID")?;
            request.start = parse_time(start.as_deref())?;
            request.end = parse_time(end.as_deref())?;
            request.text = text;
            request.max = max;
            request.after = after;
            request.before = before;
            request.backwards = backwards;

            let page = service.engine().find_messages(&request).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
    }
}

async fn serve(service: &MonitoringService) -> Result<()> {
    service.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    service.shutdown().await;
    Ok(())
}

async fn rebuild_index(service: &MonitoringService) -> Result<()> {
    let Some(index) = service.index() else {
        bail!("Full-text indexing is disabled in the configuration");
    };

    let mut progress = index.progress();
    let rebuild = index.rebuild();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if let Some(percent) = *progress.borrow_and_update() {
                println!("Rebuilding index: {}%", percent);
            }
        }
    });

    let indexed = rebuild.await.context("Index rebuild task failed")??;
    reporter.abort();
    println!("Indexed {} messages", indexed);
    Ok(())
}
