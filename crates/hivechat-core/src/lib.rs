//! hivechat core library
//!
//! Ledger-sourced message sync: turns an account's append-only Hive history
//! into a queryable local cache of conversations and group memberships.
//!
//! ## Overview
//!
//! Direct messages are transfers whose memo carries the (usually encrypted)
//! text; group traffic rides on `custom_json` operations. The engine pulls
//! the account's history page by page, classifies each operation, admits it
//! through a minimum-payment spam filter, reassembles memos that were split
//! across several transfers, decrypts through an external key holder and
//! writes the result to an embedded redb cache.
//!
//! ```text
//! LedgerClient ──► OperationStream ──► classify ──► SpamFilter
//!                        ▲                 │             │
//!                   SyncCursor             │       ChunkReassembler
//!                        ▲                 │             │
//!                        │           GroupDirectory   MemoCodec ◄── KeyHolder
//!                        │                 │             │
//!                        └──── commit ◄── MessageCache ◄─┘
//! ```
//!
//! ## Core Principles
//!
//! - **The ledger is the source of truth**: the cache is derived and can be rebuilt
//! - **At-least-once, idempotent**: a batch is replayed until its commit lands
//! - **Keys stay outside**: decryption is delegated to a [`KeyHolder`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hivechat_core::{LoopbackKeyHolder, MemoryLedger, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ledger = Arc::new(MemoryLedger::load("replay.json")?);
//!     let keys = Arc::new(LoopbackKeyHolder::new(["bob"]));
//!     let engine = SyncEngine::open("bob", ledger, keys, "~/.hivechat/data", SyncConfig::default())?;
//!
//!     engine.sync_once().await?;
//!     for summary in engine.conversations()? {
//!         println!("{}: {:?}", summary.peer, summary.preview(40));
//!     }
//!     Ok(())
//! }
//! ```

pub mod chunks;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod events;
pub mod groups;
pub mod ledger;
pub mod logging;
pub mod spam;
pub mod storage;
pub mod stream;
pub mod types;

// Re-exports
pub use chunks::{ChunkOutcome, ChunkReassembler, ChunkSetStatus};
pub use classifier::{classify, Direction, OperationClass};
pub use codec::{KeyHolder, LoopbackKeyHolder, MemoCodec};
pub use config::SyncConfig;
pub use cursor::{compute_backfill_plan, BackfillPlan, SyncCursor};
pub use engine::{
    LiveHandle, OutgoingMessage, OutgoingTransfer, Reevaluation, SyncEngine, SyncReport,
};
pub use error::{DecryptFailure, SyncError, SyncResult};
pub use events::{SyncEvent, SyncStatus};
pub use groups::{
    rank_groups, ConflictingControlOperation, ControlOutcome, GroupControl, GroupDirectory,
    OutgoingCustomJson, RankMode,
};
pub use ledger::{LedgerClient, LedgerOperation, LedgerSnapshot, MemoryLedger, OperationFilter};
pub use spam::{Admission, MinimumStatus, SpamFilter};
pub use storage::{LocalState, MessageCache};
pub use stream::{FetchedPage, OperationStream, StreamSubscription};
pub use types::*;
