use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use coursegen_pipeline::{
    init_telemetry, shutdown_telemetry, CommandHandler, LockService, LockStore, OutboxStore,
    PipelineConfig, TransitionStore,
};

#[derive(Parser)]
#[command(name = "coursegen-pipeline")]
#[command(about = "Operator tools for the course generation pipeline core")]
#[command(long_about = "Inspect and repair pipeline state: generation locks, outbox entries \
                       that ran out of dispatch attempts, and per-course workflow state.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show outbox depth, exhausted entries and live locks
    Status,
    /// Generation lock inspection and repair
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Outbox inspection and repair
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
    /// Show a course's workflow state and audit trail
    State {
        /// Course id
        entity_id: String,
    },
    /// Write the effective configuration to a TOML file
    WriteConfig {
        #[arg(long, default_value = "coursegen-pipeline.toml")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List all live locks
    List,
    /// Remove a course's lock regardless of holder
    ForceRelease { entity_id: String },
}

#[derive(Subcommand)]
enum OutboxAction {
    /// Number of entries waiting for dispatch
    Depth,
    /// Entries that ran out of dispatch attempts
    Exhausted,
    /// Reset the attempts of an entry so it is dispatched again
    Requeue { id: Uuid },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    PipelineConfig::load_env_file()?;
    let config = PipelineConfig::load()?;
    init_telemetry(&config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(run(cli.command, config));
    shutdown_telemetry();
    result
}

#[cfg(feature = "database")]
async fn run(command: Commands, config: PipelineConfig) -> Result<()> {
    let database = config.database.clone().unwrap_or_default();
    let store = Arc::new(coursegen_pipeline::storage::SqliteStore::connect(&database).await?);
    let result = execute(command, &config, store.clone()).await;
    store.shutdown().await;
    result
}

#[cfg(not(feature = "database"))]
async fn run(command: Commands, config: PipelineConfig) -> Result<()> {
    tracing::warn!("Database feature not enabled, operating on an empty in-memory store");
    let store = Arc::new(coursegen_pipeline::MemoryStore::new());
    execute(command, &config, store).await
}

async fn execute<S>(command: Commands, config: &PipelineConfig, store: Arc<S>) -> Result<()>
where
    S: TransitionStore + OutboxStore + LockStore + 'static,
{
    let locks = LockService::new(store.clone(), &config.locks);
    let max_attempts = config.dispatcher.max_attempts;

    match command {
        Commands::Status => {
            let depth = store.pending_count(max_attempts).await?;
            let exhausted = store.exhausted_entries(max_attempts).await?;
            let live = locks.get_all_locks().await?;

            println!("📊 PIPELINE STATUS");
            println!("==================");
            println!(" 📬 Outbox entries awaiting dispatch: {depth}");
            if exhausted.is_empty() {
                println!(" 🟢 Exhausted outbox entries: 0");
            } else {
                println!(
                    " 🔴 Exhausted outbox entries: {} (run 'outbox exhausted')",
                    exhausted.len()
                );
            }
            println!(" 🔒 Live generation locks: {}", live.len());
        }
        Commands::Locks { action } => match action {
            LockAction::List => {
                let live = locks.get_all_locks().await?;
                if live.is_empty() {
                    println!("🔓 No live generation locks");
                }
                for lock in live {
                    println!(
                        " 🔒 {}: held by {} since {} (expires {})",
                        lock.entity_id,
                        lock.locked_by,
                        lock.locked_at.to_rfc3339(),
                        lock.expires_at.to_rfc3339()
                    );
                }
            }
            LockAction::ForceRelease { entity_id } => {
                if locks.force_release(&entity_id).await? {
                    println!("✅ Released lock on {entity_id}");
                } else {
                    println!("ℹ️  {entity_id} was not locked");
                }
            }
        },
        Commands::Outbox { action } => match action {
            OutboxAction::Depth => {
                println!("{}", store.pending_count(max_attempts).await?);
            }
            OutboxAction::Exhausted => {
                let exhausted = store.exhausted_entries(max_attempts).await?;
                if exhausted.is_empty() {
                    println!("🟢 No exhausted outbox entries");
                }
                for entry in exhausted {
                    println!(
                        " 🔴 {} course={} queue={} attempts={} last_error={}",
                        entry.id,
                        entry.entity_id,
                        entry.queue_name,
                        entry.attempts,
                        entry.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
            OutboxAction::Requeue { id } => {
                if store.requeue(id).await? {
                    println!("✅ Requeued outbox entry {id}");
                } else {
                    bail!("Outbox entry {id} not found or already processed");
                }
            }
        },
        Commands::State { entity_id } => {
            let handler = CommandHandler::new(store.clone());
            match handler.current_state(&entity_id).await? {
                Some(state) => {
                    println!("📋 {}: {}", state.entity_id, state.state);
                    println!("   updated: {}", state.updated_at.to_rfc3339());
                    println!(
                        "   context: {}",
                        serde_json::to_string(&state.context_data)?
                    );
                }
                None => println!("📋 {entity_id}: no workflow state recorded"),
            }
            for event in handler.audit_trail(&entity_id).await? {
                println!(
                    "   • {} {} -> {} by {} (key {})",
                    event.created_at.to_rfc3339(),
                    event.event_data.previous_state.as_deref().unwrap_or("∅"),
                    event.event_data.initial_state,
                    event.event_data.initiated_by,
                    event.event_data.idempotency_key
                );
            }
        }
        Commands::WriteConfig { path } => {
            config.save_to_file(&path)?;
            println!("✅ Wrote configuration to {}", path.display());
        }
    }

    Ok(())
}
