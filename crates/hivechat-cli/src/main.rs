//! hivechat CLI
//!
//! Thin wrapper around hivechat-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Sync bob's cache against a recorded ledger
//! hivechat --account bob sync --ledger replay.json
//!
//! # Keep polling the replay file's ledger until Ctrl-C
//! hivechat --account bob sync --ledger replay.json --follow
//!
//! # List conversations, show one, delete one
//! hivechat --account bob chat list
//! hivechat --account bob chat show alice
//! hivechat --account bob chat purge alice
//!
//! # Spam filter exceptions and the filtered audit list
//! hivechat --account bob exceptions add alice
//! hivechat --account bob filtered
//!
//! # Group discovery and incomplete chunk sets
//! hivechat --account bob groups rank --mode trending
//! hivechat --account bob chunks
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hivechat_core::logging::JsonlLayer;
use hivechat_core::{
    LoopbackKeyHolder, MemoryLedger, Message, RankMode, SyncConfig, SyncEngine, SyncReport,
};
use tracing_subscriber::prelude::*;

/// hivechat - Hive ledger message sync
#[derive(Parser)]
#[command(name = "hivechat")]
#[command(version = "0.1.0")]
#[command(about = "hivechat - Hive ledger message sync")]
#[command(
    long_about = "Builds a local, queryable cache of direct messages and group memberships from an account's Hive ledger history."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Account whose cache to use
    #[arg(short, long, global = true, env = "HIVECHAT_ACCOUNT")]
    account: Option<String>,

    /// Data directory (default: ~/.hivechat/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sync configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the cache against a ledger replay file
    Sync {
        /// Ledger replay file (JSON)
        #[arg(short, long)]
        ledger: PathBuf,

        /// Keep polling until interrupted
        #[arg(short, long)]
        follow: bool,

        /// Additional accounts the local key holder can decrypt for
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
    },

    /// Conversations
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /// Senders exempt from the minimum payment
    Exceptions {
        #[command(subcommand)]
        action: ExceptionAction,
    },

    /// Operations rejected by the spam filter
    Filtered,

    /// Group directory
    Groups {
        #[command(subcommand)]
        action: GroupsAction,
    },

    /// Chunk sets still waiting for pieces
    Chunks,
}

#[derive(Subcommand)]
enum ChatAction {
    /// List conversations, most recent first
    List,
    /// Show the messages of a conversation
    Show {
        /// Other participant, or group id with --group
        peer: String,
        #[arg(short, long)]
        group: bool,
    },
    /// Delete a direct conversation from the cache
    Purge { peer: String },
}

#[derive(Subcommand)]
enum ExceptionAction {
    /// Exempt a sender and release their filtered messages
    Add { username: String },
    /// Remove an exemption
    Remove { username: String },
    /// List exemptions
    List,
}

#[derive(Subcommand)]
enum GroupsAction {
    /// Known groups in discovery order
    Rank {
        /// newest, trending or hot
        #[arg(short, long, default_value = "newest")]
        mode: String,
    },
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>, account: &str) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let jsonl = match log_dir {
        Some(dir) => Some(
            JsonlLayer::new(dir, account)
                .with_context(|| format!("Cannot open log directory {}", dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Get the default data directory (~/.hivechat/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hivechat")
        .join("data")
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Invalid config file {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_message(msg: &Message) {
    let body = match (&msg.content, &msg.decrypt_error) {
        (Some(content), _) => content.clone(),
        (None, Some(error)) => format!("<undecrypted: {}>", error),
        (None, None) => "<undecrypted>".to_string(),
    };
    let amount = msg.amount.map(|a| format!(" ({})", a)).unwrap_or_default();
    let marker = if msg.confirmed { "" } else { " [pending]" };
    println!(
        "[{}] {}{}{}: {}",
        format_time(msg.timestamp),
        msg.from,
        amount,
        marker,
        body
    );
}

fn print_report(report: &SyncReport) {
    println!("Sync complete");
    println!("  Batches: {}", report.batches);
    println!("  Operations: {}", report.operations_seen);
    println!("  Messages written: {}", report.messages_written);
    println!("  Filtered: {}", report.filtered);
    if report.decrypt_failures > 0 {
        println!("  Decrypt failures: {}", report.decrypt_failures);
    }
    if report.chunks_pending > 0 {
        println!("  Chunks pending: {}", report.chunks_pending);
    }
    for conflict in &report.conflicts {
        println!(
            "  Conflict: {} in {} was {} locally, creator says {}",
            conflict.username, conflict.group_id, conflict.local_status, conflict.confirmed_status
        );
    }
    if report.gap_exceeded {
        println!("  Warning: backlog exceeded max_backfill; older operations skipped");
    }
    match report.cursor {
        Some(cursor) => println!("  Cursor: {}", cursor),
        None => println!("  Cursor: (empty history)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let account = cli
        .account
        .clone()
        .context("No account given (use --account or HIVECHAT_ACCOUNT)")?
        .to_ascii_lowercase();

    setup_logging(cli.verbose, cli.log_dir.as_deref(), &account)?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = load_config(cli.config.as_deref())?;

    // Commands that do not talk to a ledger run against an empty one.
    let (ledger, extra_keys) = match &cli.command {
        Commands::Sync { ledger, keys, .. } => (
            MemoryLedger::load(ledger)
                .with_context(|| format!("Cannot load ledger replay {}", ledger.display()))?,
            keys.clone(),
        ),
        _ => (MemoryLedger::new(), Vec::new()),
    };
    let key_holder = LoopbackKeyHolder::new(std::iter::once(account.clone()).chain(extra_keys));

    tracing::info!(account = %account, data_dir = %data_dir.display(), "Opening account");
    let engine = Arc::new(SyncEngine::open(
        &account,
        Arc::new(ledger),
        Arc::new(key_holder),
        &data_dir,
        config,
    )?);

    match cli.command {
        Commands::Sync { follow, .. } => {
            let report = engine.sync_once().await?;
            print_report(&report);

            if follow {
                println!("Following (Ctrl-C to stop)...");
                let live = engine.start_live();
                tokio::signal::ctrl_c().await?;
                live.stop().await?;
                println!("Stopped at cursor {:?}", engine.cursor()?);
            }
        }

        Commands::Chat { action } => match action {
            ChatAction::List => {
                let summaries = engine.conversations()?;
                if summaries.is_empty() {
                    println!("No conversations.");
                }
                for summary in summaries {
                    let kind = if summary.is_group { "group" } else { "direct" };
                    println!(
                        "{} ({}) - {} messages, {} undecrypted, last {}",
                        summary.peer,
                        kind,
                        summary.message_count,
                        summary.undecrypted_count,
                        format_time(summary.last_activity)
                    );
                    if let Some(preview) = summary.preview(60) {
                        println!("  {}", preview);
                    }
                }
            }
            ChatAction::Show { peer, group } => {
                let messages = if group {
                    engine.group_conversation(&peer)?
                } else {
                    engine.conversation(&peer)?
                };
                if messages.is_empty() {
                    println!("No messages with {}.", peer);
                }
                for msg in &messages {
                    print_message(msg);
                }
            }
            ChatAction::Purge { peer } => {
                let removed = engine.purge_conversation(&peer)?;
                println!("Purged {} messages with {}", removed, peer);
            }
        },

        Commands::Exceptions { action } => match action {
            ExceptionAction::Add { username } => {
                let released = engine.add_exception(&username).await?;
                println!("Added exception for {}", username);
                if released > 0 {
                    println!("Released {} filtered messages", released);
                }
            }
            ExceptionAction::Remove { username } => {
                if engine.remove_exception(&username)? {
                    println!("Removed exception for {}", username);
                } else {
                    println!("{} was not an exception", username);
                }
            }
            ExceptionAction::List => {
                let exceptions = engine.exceptions()?;
                if exceptions.is_empty() {
                    println!("No exceptions.");
                }
                for entry in exceptions {
                    println!("{} (since {})", entry.username, format_time(entry.added_at));
                }
            }
        },

        Commands::Filtered => {
            let filtered = engine.filtered()?;
            if filtered.is_empty() {
                println!("No filtered operations.");
            }
            for record in filtered {
                let amount = record
                    .operation
                    .as_transfer()
                    .map(|t| t.amount.to_string())
                    .unwrap_or_default();
                println!(
                    "#{} {} sent {} (minimum {}) at {}",
                    record.operation.op_index,
                    record.operation.from,
                    amount,
                    record.minimum,
                    format_time(record.operation.timestamp)
                );
            }
        }

        Commands::Groups { action } => match action {
            GroupsAction::Rank { mode } => {
                let mode: RankMode = mode.parse()?;
                let groups = engine.rank_groups(mode)?;
                if groups.is_empty() {
                    println!("No groups known.");
                }
                for (i, group) in groups.iter().enumerate() {
                    let fee = group
                        .payment
                        .as_ref()
                        .map(|p| format!(", fee {}", p.amount))
                        .unwrap_or_default();
                    println!(
                        "{}. {} [{}] by {} - {} members{}",
                        i + 1,
                        group.name,
                        group.group_id,
                        group.creator,
                        group.member_count,
                        fee
                    );
                }
            }
        },

        Commands::Chunks => {
            let sets = engine.incomplete_chunk_sets()?;
            if sets.is_empty() {
                println!("No incomplete chunk sets.");
            }
            for set in sets {
                println!(
                    "{} from {} - {}/{} received, missing {:?}",
                    set.session_id,
                    set.from,
                    set.received.len(),
                    set.count,
                    set.missing()
                );
            }
        }
    }

    Ok(())
}
