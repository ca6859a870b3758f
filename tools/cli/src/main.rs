//! notesync CLI - Command line interface for the offline-first sync engine.
//!
//! This tool inspects and edits the local operation queue, runs syncs
//! against the configured backend, and resolves conflicts.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use notesync_common::{EntityType, Error, OperationKind, MAX_RETRIES};
use notesync_remote::{HttpApi, MemoryApi, RemoteApi};
use notesync_store::{LocalStore, MemoryStore, SqliteStore};
use notesync_sync::{
    ConflictStrategy, ConnectivityMonitor, QueueDecision, Resolution, SyncEngine, SyncOutcome,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "notesync - Offline-first note synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: <data dir>/notesync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Behave as if the network were down.
    #[arg(long, global = true)]
    offline: bool,

    /// Sync a copy of the local database against an empty in-memory
    /// backend and print the requests that would be made.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status.
    Status {
        /// Print the raw status snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Push queued changes and pull server state.
    Sync,

    /// Inspect or edit the pending operation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// List entities flagged as conflicts.
    Conflicts,

    /// Resolve a conflicted note or workspace.
    Resolve {
        /// Entity id.
        id: String,

        /// Entity type: "note" or "workspace".
        #[arg(short = 't', long, default_value = "note")]
        entity_type: EntityType,

        /// Strategy: "local", "server", or "merge".
        #[arg(short, long)]
        strategy: ConflictStrategy,
    },

    /// Sync at startup and on reconnect, printing status until Ctrl-C.
    Watch,

    /// Generate shell completion scripts.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued operations, oldest first.
    List,

    /// Record a local change.
    Add {
        /// Operation: "create", "update", or "delete".
        operation: OperationKind,

        /// Entity type: "note", "workspace", or "attachment".
        entity_type: EntityType,

        /// Entity id.
        id: String,

        /// Entity body as JSON (default: {"id": <id>}).
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Give failed operations another set of retries.
    RetryFailed,

    /// Drop failed operations.
    DiscardFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "notesync", &mut std::io::stdout());
        return Ok(());
    }

    let config = CliConfig::load(cli.config.as_deref())?.with_env();
    let session = Session::open(&config, cli.offline, cli.dry_run).await?;

    match cli.command {
        Commands::Status { json } => cmd_status(&session, json).await,

        Commands::Sync => cmd_sync(&session).await,

        Commands::Queue { command } => match command {
            QueueCommands::List => cmd_queue_list(&session).await,
            QueueCommands::Add {
                operation,
                entity_type,
                id,
                data,
            } => cmd_queue_add(&session, operation, entity_type, &id, data.as_deref()).await,
            QueueCommands::RetryFailed => cmd_retry_failed(&session).await,
            QueueCommands::DiscardFailed => cmd_discard_failed(&session).await,
        },

        Commands::Conflicts => cmd_conflicts(&session).await,

        Commands::Resolve {
            id,
            entity_type,
            strategy,
        } => cmd_resolve(&session, entity_type, &id, strategy).await,

        Commands::Watch => cmd_watch(&session).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Local store and engine for one CLI invocation.
struct Session {
    store: Arc<dyn LocalStore>,
    engine: Arc<SyncEngine>,
    /// Backend standing in for the server under `--dry-run`.
    dry_run: Option<MemoryApi>,
}

impl Session {
    async fn open(config: &CliConfig, offline: bool, dry_run: bool) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let database = SqliteStore::open(config.database_path())
            .context("Failed to open local database")?;
        info!("Using local database {}", config.database_path().display());

        let (store, remote, fake): (Arc<dyn LocalStore>, Arc<dyn RemoteApi>, Option<MemoryApi>) =
            if dry_run {
                let api = MemoryApi::new();
                let copy = snapshot(&database).await?;
                (Arc::new(copy), Arc::new(api.clone()), Some(api))
            } else {
                let api = HttpApi::new(config.remote_config())
                    .context("Invalid backend configuration")?;
                (Arc::new(database), Arc::new(api), None)
            };

        let engine = SyncEngine::builder(store.clone(), remote)
            .config(config.sync.clone())
            .connectivity(Arc::new(ConnectivityMonitor::new(!offline)))
            .build();

        Ok(Self {
            store,
            engine,
            dry_run: fake,
        })
    }
}

/// Copy the queue, cached entities and last sync time into a memory store.
async fn snapshot(source: &dyn LocalStore) -> Result<MemoryStore> {
    let copy = MemoryStore::new();

    for op in source.sync_queue().await? {
        let queued = copy
            .add_to_sync_queue(op.operation, op.entity_type, &op.entity_id, op.data)
            .await?;
        let error = op.last_error.unwrap_or_default();
        for _ in 0..op.retry_count {
            copy.increment_retry_count(&queued.id, &error).await?;
        }
    }

    for entity_type in EntityType::ALL.into_iter().filter(EntityType::is_cached) {
        for entity in source.list_entities(entity_type).await? {
            copy.save_entity(entity_type, entity).await?;
        }
    }

    if let Some(time) = source.last_sync_time().await? {
        copy.set_last_sync_time(time).await?;
    }
    Ok(copy)
}

/// Default body for a queued change given on the command line.
fn parse_data(operation: OperationKind, id: &str, data: Option<&str>) -> Result<Value> {
    match data {
        Some(raw) => serde_json::from_str(raw).context("--data is not valid JSON"),
        None if operation == OperationKind::Delete => Ok(Value::Null),
        None => Ok(serde_json::json!({ "id": id })),
    }
}

/// Show sync status.
async fn cmd_status(session: &Session, json: bool) -> Result<()> {
    let status = session
        .engine
        .sync_status()
        .await
        .context("Failed to read sync status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let last_sync = status
        .last_sync_time
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());

    println!("Sync Status: {}", status.indicator());
    println!("  Online: {}", if status.is_online { "yes" } else { "no" });
    println!(
        "  Backend: {}",
        if status.backend_configured {
            "configured"
        } else {
            "not configured"
        }
    );
    println!("  Pending operations: {}", status.pending_operations);
    println!("  Failed operations: {}", status.failed_operations);
    println!("  Last sync: {}", last_sync);

    Ok(())
}

/// Run one sync.
async fn cmd_sync(session: &Session) -> Result<()> {
    let outcome = match session.engine.force_sync().await {
        Ok(outcome) => outcome,
        Err(Error::Offline) => anyhow::bail!("Cannot sync while offline"),
        Err(e) => return Err(e).context("Sync failed"),
    };

    match outcome {
        SyncOutcome::Completed(report) => {
            println!("Sync completed in {:?}", report.duration);
            println!("  Pushed: {}", report.pushed);
            println!("  Failed: {}", report.failed);
            println!("  Pulled: {}", report.pulled);
            if report.conflicts > 0 {
                println!("  Conflicts: {} (see `notesync conflicts`)", report.conflicts);
            }
        }
        SyncOutcome::Skipped(reason) => println!("Sync skipped: {}", reason),
    }

    if let Some(api) = &session.dry_run {
        println!("\nRequests (dry run):");
        for request in api.requests()? {
            println!("  {}", request);
        }
    }

    Ok(())
}

/// List queued operations.
async fn cmd_queue_list(session: &Session) -> Result<()> {
    let queue = session
        .store
        .sync_queue()
        .await
        .context("Failed to read sync queue")?;

    if queue.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("Queued operations:");
    for op in queue {
        let state = if op.is_failed() { "FAILED" } else { "pending" };
        println!(
            "  [{}] {} {} {} (retries {}/{}) id={}",
            state, op.operation, op.entity_type, op.entity_id, op.retry_count, MAX_RETRIES, op.id
        );
        if let Some(error) = op.last_error {
            println!("      last error: {}", error);
        }
    }

    Ok(())
}

/// Record a local change.
async fn cmd_queue_add(
    session: &Session,
    operation: OperationKind,
    entity_type: EntityType,
    id: &str,
    data: Option<&str>,
) -> Result<()> {
    let data = parse_data(operation, id, data)?;

    let decision = session
        .engine
        .apply_local_change(operation, entity_type, id, data)
        .await
        .context("Failed to queue change")?;

    match decision {
        QueueDecision::Queued {
            operation,
            superseded,
        } => {
            println!(
                "Queued {} {} {} ({})",
                operation.operation, operation.entity_type, operation.entity_id, operation.id
            );
            if superseded > 0 {
                println!("  Replaced {} earlier operation(s)", superseded);
            }
        }
        QueueDecision::Dropped { superseded } => {
            println!(
                "{} {} was never synced; removed {} queued operation(s)",
                entity_type, id, superseded
            );
        }
    }

    Ok(())
}

/// Revive failed operations.
async fn cmd_retry_failed(session: &Session) -> Result<()> {
    let revived = session
        .engine
        .retry_failed()
        .await
        .context("Failed to requeue failed operations")?;

    println!("Requeued {} failed operation(s)", revived.requeued);
    if revived.discarded > 0 {
        println!("  Dropped {} superseded by newer changes", revived.discarded);
    }
    Ok(())
}

/// Drop failed operations.
async fn cmd_discard_failed(session: &Session) -> Result<()> {
    let removed = session
        .engine
        .discard_failed()
        .await
        .context("Failed to discard failed operations")?;

    println!("Discarded {} failed operation(s)", removed);
    Ok(())
}

/// List conflicts.
async fn cmd_conflicts(session: &Session) -> Result<()> {
    let conflicts = session
        .engine
        .conflicts()
        .await
        .context("Failed to list conflicts")?;

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    println!("Conflicts:");
    for (entity_type, entity) in conflicts {
        let updated = entity
            .updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  {} {} (local copy updated {})", entity_type, entity.id, updated);
    }
    Ok(())
}

/// Resolve one conflict.
async fn cmd_resolve(
    session: &Session,
    entity_type: EntityType,
    id: &str,
    strategy: ConflictStrategy,
) -> Result<()> {
    info!("Resolving {} {} with {} strategy", entity_type, id, strategy);

    let resolution = session
        .engine
        .resolve_conflict(entity_type, id, strategy)
        .await
        .with_context(|| format!("Failed to resolve {} {}", entity_type, id))?;

    match resolution {
        Resolution::KeptLocal { .. } => {
            println!("Kept local copy of {} {}; it will be pushed on next sync", entity_type, id)
        }
        Resolution::UsedServer { dropped, .. } => {
            println!("Replaced {} {} with the server copy", entity_type, id);
            if dropped > 0 {
                println!("  Dropped {} queued local edit(s)", dropped);
            }
        }
    }
    Ok(())
}

/// Run the background task until interrupted.
async fn cmd_watch(session: &Session) -> Result<()> {
    let _subscription = session.engine.add_sync_listener(|status| {
        println!(
            "[{}] pending {} failed {}",
            status.indicator(),
            status.pending_operations,
            status.failed_operations
        );
    });

    let task = session.engine.start();
    info!("Watching for changes, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    task.shutdown();
    println!("Stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parses_queue_add() {
        let cli = Cli::try_parse_from([
            "notesync",
            "--dry-run",
            "queue",
            "add",
            "update",
            "workspace",
            "w1",
            "--data",
            r#"{"name":"Work"}"#,
        ])
        .unwrap();

        assert!(cli.dry_run);
        match cli.command {
            Commands::Queue {
                command:
                    QueueCommands::Add {
                        operation,
                        entity_type,
                        id,
                        data,
                    },
            } => {
                assert_eq!(operation, OperationKind::Update);
                assert_eq!(entity_type, EntityType::Workspace);
                assert_eq!(id, "w1");
                assert_eq!(data.as_deref(), Some(r#"{"name":"Work"}"#));
            }
            _ => panic!("expected queue add"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_strategy() {
        assert!(Cli::try_parse_from(["notesync", "resolve", "n1", "--strategy", "theirs"]).is_err());
        assert!(Cli::try_parse_from(["notesync", "resolve", "n1", "-s", "server"]).is_ok());
    }

    #[test]
    fn test_parse_data_defaults() {
        assert_eq!(
            parse_data(OperationKind::Create, "n1", None).unwrap(),
            json!({ "id": "n1" })
        );
        assert_eq!(parse_data(OperationKind::Delete, "n1", None).unwrap(), Value::Null);
        assert!(parse_data(OperationKind::Update, "n1", Some("{")).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_copies_queue_and_retries() {
        let source = MemoryStore::new();
        let op = source
            .add_to_sync_queue(OperationKind::Update, EntityType::Note, "n1", json!({ "v": 1 }))
            .await
            .unwrap();
        source.increment_retry_count(&op.id, "HTTP 500").await.unwrap();
        source
            .save_note(notesync_common::CachedEntity::pending("n1", json!({ "id": "n1" })))
            .await
            .unwrap();

        let copy = snapshot(&source).await.unwrap();

        let queue = copy.sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].retry_count, 1);
        assert_eq!(queue[0].last_error.as_deref(), Some("HTTP 500"));
        assert!(copy.get_note("n1").await.unwrap().is_some());

        // The copy is independent of the source.
        copy.remove_sync_operation(&queue[0].id).await.unwrap();
        assert_eq!(source.sync_queue().await.unwrap().len(), 1);
    }
}
