//! BIM Graph Sync - session runner and ChangeLog tooling

use anyhow::{Context, Result};
use bim_graph_sync::diagnostics::install_panic_hook;
use bim_graph_sync::events::SyncEvent;
use bim_graph_sync::neo4j::Neo4jClient;
use bim_graph_sync::sync::SyncService;
use bim_graph_sync::{Config, SyncContext};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bim-sync")]
#[command(about = "Multi-session building model sync over Neo4j")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Session id (overrides SYNC_SESSION_ID and the config file)
    #[arg(short, long, global = true)]
    session: Option<String>,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the session and log pull requests until Ctrl-C
    Listen,

    /// List active sessions
    Sessions,

    /// List unacknowledged ChangeLog entries for the session
    Pending,

    /// Acknowledge ChangeLog entries for the session
    Ack {
        /// Only entries with seq <= this value
        #[arg(long)]
        up_to: Option<i64>,
    },

    /// Delete acknowledged ChangeLog entries
    Purge {
        /// Minimum age of the entries to delete
        #[arg(long, default_value = "24")]
        older_than_hours: u64,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,bim_graph_sync=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();

    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;
    if let Some(session) = cli.session {
        config.session_id = Some(session);
    }

    install_panic_hook(
        config.diagnostics_dir.clone(),
        config.session_id.clone().unwrap_or_else(|| "-".into()),
    );

    match cli.command {
        Commands::Listen => run_listen(config).await,
        Commands::Sessions => run_sessions(config, cli.json).await,
        Commands::Pending => run_pending(config, cli.json).await,
        Commands::Ack { up_to } => run_ack(config, up_to).await,
        Commands::Purge { older_than_hours } => run_purge(config, older_than_hours).await,
    }
}

fn require_session(config: &Config) -> Result<String> {
    config
        .session_id
        .clone()
        .context("no session id (use --session, SYNC_SESSION_ID or sync.session_id)")
}

async fn run_listen(config: Config) -> Result<()> {
    let (ctx, receiver) = SyncContext::connect(&config).await?;
    tracing::info!(session_id = %ctx.session_id, "Connected to Neo4j");

    let service = SyncService::start(ctx, receiver).await?;
    let mut events = service.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::PullRequested { session_id, change_count, detected_at }) => {
                    tracing::info!(
                        session_id = %session_id,
                        change_count,
                        detected_at = %detected_at,
                        "Pull requested"
                    );
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} pull requests", n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let counts = service.shutdown().await;
    tracing::info!(
        executed = counts.executed,
        failed = counts.failed,
        "Session closed"
    );
    Ok(())
}

async fn run_sessions(config: Config, json: bool) -> Result<()> {
    let client = Neo4jClient::new(&config.neo4j).await?;
    let since = Utc::now()
        - chrono::Duration::from_std(config.sync.session_ttl).unwrap_or(chrono::Duration::zero());
    let sessions = client.list_active_sessions(since).await?;

    if json {
        for s in &sessions {
            println!("{}", serde_json::to_string(s)?);
        }
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No active sessions");
    }
    for s in sessions {
        println!(
            "{}\tstarted {}\tlast seen {}",
            s.session_id,
            s.started_at.to_rfc3339(),
            s.last_seen.to_rfc3339()
        );
    }
    Ok(())
}

async fn run_pending(config: Config, json: bool) -> Result<()> {
    let session_id = require_session(&config)?;
    let client = Neo4jClient::new(&config.neo4j).await?;
    let entries = client.list_unacknowledged(&session_id).await?;

    if json {
        for e in &entries {
            println!("{}", serde_json::to_string(e)?);
        }
        return Ok(());
    }

    for e in &entries {
        println!(
            "{}\t{}\t{}\tfrom {}\t{}",
            e.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            e.operation,
            e.target_element_id,
            e.source_session_id,
            e.timestamp.to_rfc3339()
        );
    }
    println!("{} pending for {}", entries.len(), session_id);
    Ok(())
}

async fn run_ack(config: Config, up_to: Option<i64>) -> Result<()> {
    let session_id = require_session(&config)?;
    let client = Neo4jClient::new(&config.neo4j).await?;
    let n = client.acknowledge_change_logs(&session_id, up_to).await?;
    println!("Acknowledged {} entries for {}", n, session_id);
    Ok(())
}

async fn run_purge(config: Config, older_than_hours: u64) -> Result<()> {
    let client = Neo4jClient::new(&config.neo4j).await?;
    let age = Duration::from_secs(older_than_hours.saturating_mul(3600));
    let older_than = Utc::now()
        - chrono::Duration::from_std(age).context("purge age out of range")?;
    let n = client.purge_acknowledged(older_than).await?;
    println!("Purged {} acknowledged entries", n);
    Ok(())
}
