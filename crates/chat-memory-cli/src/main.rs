mod telemetry;

use anyhow::Context;
use chat_memory::{config, run_maintenance, MemoryManager, Settings, UserId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chat-memory")]
#[command(about = "Lifecycle and admin commands for per-user conversation memory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (defaults to config/memory.toml if present)
    #[arg(short, long, env = "CHAT_MEMORY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run maintenance (periodic flush and cleanup) until Ctrl+C
    Run,
    /// Print memory statistics as JSON
    Stats,
    /// Delete snapshots not written for longer than the retention period
    Cleanup {
        /// Retention in days, overrides memory.retention_days
        #[arg(long)]
        days: Option<u64>,
    },
    /// Print a user's memory as JSON
    Show { user_id: UserId },
    /// Append one user/assistant exchange and persist it
    Record {
        user_id: UserId,
        #[arg(long)]
        user: String,
        #[arg(long)]
        assistant: String,
    },
    /// Forget a user entirely
    Clear { user_id: UserId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = telemetry::init_logging()?;

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    let manager = Arc::new(MemoryManager::from_settings(&settings)?);

    match cli.command {
        Commands::Run => handle_run(manager).await,
        Commands::Stats => print_json(&manager.stats().await),
        Commands::Cleanup { days } => {
            let retention = days
                .map(config::days)
                .unwrap_or_else(|| manager.config().retention());
            let deleted = manager.cleanup_older_than(retention).await;
            println!("Deleted {} snapshots", deleted);
            Ok(())
        }
        Commands::Show { user_id } => print_json(&manager.get_or_create(user_id).await),
        Commands::Record {
            user_id,
            user,
            assistant,
        } => {
            manager.record_interaction(user_id, &user, &assistant).await;
            manager.flush_all().await;
            print_json(&manager.get_or_create(user_id).await)
        }
        Commands::Clear { user_id } => {
            manager.clear(user_id).await;
            println!("Cleared memory of user {}", user_id);
            Ok(())
        }
    }
}

async fn handle_run(manager: Arc<MemoryManager>) -> anyhow::Result<()> {
    info!(
        "🚀 chat-memory maintenance running (snapshots in {})",
        manager.config().snapshot_dir.display()
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let saved = run_maintenance(manager, shutdown).await;
    info!("✅ Shutdown complete, {} users persisted", saved);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
