//! PosSync CLI
//!
//! Thin wrapper around possync-core for inspecting the local store and
//! driving sync cycles from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! # Queue length, last pulls, dropped actions
//! possync status
//!
//! # Run one push + pull cycle against the API
//! possync --api-url https://pos.example.com/api --token $TOKEN sync
//!
//! # Keep syncing on the background timer until Ctrl+C
//! possync serve
//!
//! # Record a sale while offline
//! possync invoice record '{"customer": "c-1", "total": 120}'
//!
//! # Inspect the queue
//! possync queue list
//! possync queue enqueue update-stock product '{"id": "p-1", "stock": 4}'
//! possync queue remove 3
//!
//! # Inspect cached collections
//! possync store list products
//! possync store get invoices 64f0c2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use possync_core::{
    ActionKind, Collection, CycleReport, EntityKind, EventBus, HttpRemote, NetworkMonitor,
    PosSyncConfig, StaticToken, SyncEngine, SyncEvent, SyncOutcome,
};
use serde_json::Value;
use tracing::info;

/// PosSync - offline-first sync for point-of-sale clients
#[derive(Parser)]
#[command(name = "possync")]
#[command(version = "0.1.0")]
#[command(about = "PosSync - offline-first sync for point-of-sale clients")]
#[command(
    long_about = "Records sales locally, queues them while offline, and replays them against the retail API once connectivity returns."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.possync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Retail API root, overrides the config file
    #[arg(long, global = true, env = "POSSYNC_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the retail API
    #[arg(long, global = true, env = "POSSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// JSON config file with `engine` and `remote` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue length, collection sizes and last pulls
    Status,

    /// Run one sync cycle now
    Sync,

    /// Keep syncing on the background timer until Ctrl+C
    Serve,

    /// Record offline sales and payments
    Invoice {
        #[command(subcommand)]
        action: InvoiceAction,
    },

    /// Pending action queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Local store collections
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum InvoiceAction {
    /// Store an invoice locally and queue its creation
    Record {
        /// Invoice as a JSON object
        json: String,
    },
    /// Queue a payment against an invoice
    Pay {
        /// Invoice id (synthetic or canonical)
        invoice_id: String,
        /// Payment as a JSON object
        json: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending actions in replay order
    List,
    /// Append a raw action
    Enqueue {
        /// create, update, delete, update-stock or pay
        action: ActionKind,
        /// invoice, payment or product
        entity: EntityKind,
        /// Payload as JSON
        json: String,
    },
    /// Remove an action without replaying it
    Remove {
        /// Sequence id
        seq: u64,
    },
    /// Show actions dropped without being applied
    Dropped,
}

#[derive(Subcommand)]
enum StoreAction {
    /// Print every record of a collection
    List {
        /// products, customers, invoices, pending-actions, settings, sync-metadata
        collection: Collection,
    },
    /// Print one record
    Get {
        collection: Collection,
        id: String,
    },
    /// Delete every record of a collection
    Clear { collection: Collection },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".possync")
        .join("data")
}

fn load_config(cli: &Cli) -> Result<PosSyncConfig> {
    let mut config = match &cli.config {
        Some(path) => PosSyncConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => PosSyncConfig::default(),
    };
    if let Some(url) = &cli.api_url {
        config.remote.base_url = url.clone();
    }
    Ok(config)
}

/// Build an engine; `online` seeds the connectivity signal
fn open_engine(cli: &Cli, online: bool) -> Result<SyncEngine> {
    let config = load_config(cli)?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    let remote = HttpRemote::new(config.remote.clone(), Arc::new(StaticToken(cli.token.clone())))?;
    let network = NetworkMonitor::new(online, EventBus::new());

    info!(base_url = %config.remote.base_url, "Using retail API");
    Ok(SyncEngine::open(
        &data_dir,
        Arc::new(remote),
        network,
        config.engine,
    )?)
}

fn parse_json(input: &str) -> Result<Value> {
    serde_json::from_str(input).with_context(|| format!("invalid JSON: {}", input))
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_report(report: &CycleReport) {
    let push = &report.push;
    println!("Push:");
    println!("  Synced:   {}", push.synced);
    println!("  Retried:  {}", push.retried);
    println!("  Dropped:  {}", push.failed);
    println!("  Deferred: {}", push.deferred);

    let pull = &report.pull;
    let count = |n: Option<usize>| n.map_or_else(|| "failed".to_string(), |n| n.to_string());
    println!("Pull:");
    println!("  Products:  {}", count(pull.products));
    println!("  Customers: {}", count(pull.customers));
    println!("  Invoices:  {}", count(pull.invoices));
    if pull.preserved_local > 0 {
        println!("  Kept local unsynced invoices: {}", pull.preserved_local);
    }
    if !pull.errors.is_empty() {
        println!("Pull errors:");
        for error in &pull.errors {
            println!("  {}", error);
        }
    }
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Online => println!("[online]"),
        SyncEvent::Offline => println!("[offline]"),
        SyncEvent::SyncStart => println!("[sync] started"),
        SyncEvent::SyncSuccess { report } => println!(
            "[sync] finished: {} synced, {} retried, {} dropped",
            report.push.synced, report.push.retried, report.push.failed
        ),
        SyncEvent::SyncError { message } => println!("[sync] failed: {}", message),
        SyncEvent::ActionSynced {
            sequence_id,
            action_kind,
            entity_kind,
        } => println!("[action] #{} {} {} synced", sequence_id, action_kind, entity_kind),
        SyncEvent::ActionFailed {
            sequence_id,
            action_kind,
            entity_kind,
            reason,
            ..
        } => println!(
            "[action] #{} {} {} dropped: {}",
            sequence_id, action_kind, entity_kind, reason
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let online = matches!(cli.command, Commands::Sync | Commands::Serve);
    let engine = open_engine(&cli, online)?;

    match cli.command {
        Commands::Status => {
            let storage = engine.storage();
            let queue = engine.queue();

            println!("PosSync v0.1.0");
            println!();
            println!("Pending actions: {}", queue.len()?);
            for entity in [EntityKind::Invoice, EntityKind::Payment, EntityKind::Product] {
                let count = queue.count_by_entity(entity)?;
                if count > 0 {
                    println!("  {}: {}", entity, count);
                }
            }
            println!("Dropped actions: {}", queue.dropped_actions()?.len());
            println!();
            println!("Collections:");
            for collection in [Collection::Products, Collection::Customers, Collection::Invoices] {
                println!("  {}: {}", collection, storage.count(collection)?);
            }
            println!();

            let metadata = storage.list_sync_metadata()?;
            if metadata.is_empty() {
                println!("Last pull: never");
            } else {
                println!("Last pull:");
                for meta in metadata {
                    println!(
                        "  {}: {} ({} records)",
                        meta.entity_name,
                        format_time(meta.last_synced_at),
                        meta.record_count
                    );
                }
            }
        }

        Commands::Sync => {
            println!("Pending actions: {}", engine.queue().len()?);
            match engine.force_sync().await {
                SyncOutcome::Completed(report) => print_report(&report),
                SyncOutcome::Failed(message) => anyhow::bail!("Sync failed: {}", message),
                SyncOutcome::Skipped(reason) => println!("Sync skipped: {:?}", reason),
            }
            println!("Pending actions: {}", engine.status().pending_count);
        }

        Commands::Serve => {
            println!("Starting PosSync...");
            println!();
            println!(
                "Sync interval: {}s",
                engine.config().sync_interval.as_secs()
            );

            let _listener = engine.add_listener(print_event);
            engine.init()?;

            println!("Engine is running. Press Ctrl+C to stop.");
            println!();

            let status_interval = Duration::from_secs(60);
            let mut last_status = std::time::Instant::now();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if last_status.elapsed() >= status_interval {
                            last_status = std::time::Instant::now();
                            let status = engine.status();
                            println!(
                                "[status] {} pending, last sync {}",
                                status.pending_count,
                                status.last_sync_time.map_or_else(|| "never".to_string(), format_time)
                            );
                        }
                    }
                }
            }

            engine.stop();
            println!("Goodbye.");
        }

        Commands::Invoice { action } => match action {
            InvoiceAction::Record { json } => {
                let id = engine.record_offline_invoice(parse_json(&json)?)?;
                println!("Recorded invoice");
                println!("  ID: {}", id);
            }
            InvoiceAction::Pay { invoice_id, json } => {
                let seq = engine.record_offline_payment(&invoice_id, parse_json(&json)?)?;
                println!("Queued payment #{} for {}", seq, invoice_id);
            }
        },

        Commands::Queue { action } => match action {
            QueueAction::List => {
                let actions = engine.queue().list_all()?;
                if actions.is_empty() {
                    println!("No pending actions.");
                } else {
                    for action in actions {
                        let depends = action
                            .depends_on
                            .map(|d| format!(" after #{}", d))
                            .unwrap_or_default();
                        println!(
                            "#{} {} {} (retries: {}){} {}",
                            action.sequence_id,
                            action.action_kind,
                            action.entity_kind,
                            action.retry_count,
                            depends,
                            action.payload
                        );
                    }
                }
            }
            QueueAction::Enqueue {
                action,
                entity,
                json,
            } => {
                let seq = engine.enqueue(action, entity, parse_json(&json)?)?;
                println!("Enqueued #{}", seq);
            }
            QueueAction::Remove { seq } => {
                if engine.queue().remove(seq)? {
                    println!("Removed #{}", seq);
                } else {
                    anyhow::bail!("No pending action #{}", seq);
                }
            }
            QueueAction::Dropped => {
                let dropped = engine.queue().dropped_actions()?;
                if dropped.is_empty() {
                    println!("No dropped actions.");
                }
                for entry in dropped {
                    let at = DateTime::<Utc>::from_timestamp_millis(entry.dropped_at)
                        .map_or_else(|| entry.dropped_at.to_string(), format_time);
                    println!(
                        "#{} {} {} at {}: {}",
                        entry.action.sequence_id,
                        entry.action.action_kind,
                        entry.action.entity_kind,
                        at,
                        entry.reason
                    );
                }
            }
        },

        Commands::Store { action } => match action {
            StoreAction::List { collection } => {
                let records = engine.storage().get_all(collection)?;
                if records.is_empty() {
                    println!("No records in {}.", collection);
                }
                for record in records {
                    println!("{}", record);
                }
            }
            StoreAction::Get { collection, id } => match engine.storage().get_by_id(collection, &id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("No record '{}' in {}", id, collection),
            },
            StoreAction::Clear { collection } => {
                let removed = engine.storage().clear(collection)?;
                println!("Cleared {} record(s) from {}", removed, collection);
            }
        },
    }

    Ok(())
}
