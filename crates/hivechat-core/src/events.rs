//! Sync event types and status tracking
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncStatus: engine state for one account                       │
//! │  ├── Idle: no sync running                                      │
//! │  ├── Syncing: a backfill batch is being processed               │
//! │  ├── Live: live tail active, waiting for the next poll          │
//! │  └── Error: the last cycle failed                               │
//! │                                                                 │
//! │  SyncEvent: notifications about sync activity                   │
//! │  ├── BatchCommitted: a batch reached the cache                  │
//! │  ├── GapExceeded: older operations were skipped                 │
//! │  ├── StatusChanged: SyncStatus transition                       │
//! │  └── SyncError: a cycle failed (the cursor did not move)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

/// Status of synchronization for an account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Live,
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Live => write!(f, "Live"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Events emitted by a [`SyncEngine`](crate::SyncEngine)
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A batch was committed and the cursor advanced
    BatchCommitted {
        username: String,
        /// Cursor position after the commit
        through_op_index: u64,
        messages_written: usize,
        /// Conversations touched by the batch
        conversations: Vec<String>,
    },
    /// The backlog exceeded `max_backfill`; operations before `skipped_through` were not fetched
    GapExceeded {
        username: String,
        cursor: Option<u64>,
        head: u64,
        skipped_through: u64,
    },
    StatusChanged {
        username: String,
        status: SyncStatus,
    },
    SyncError {
        username: String,
        message: String,
        retryable: bool,
    },
}

impl SyncEvent {
    pub fn username(&self) -> &str {
        match self {
            SyncEvent::BatchCommitted { username, .. } => username,
            SyncEvent::GapExceeded { username, .. } => username,
            SyncEvent::StatusChanged { username, .. } => username,
            SyncEvent::SyncError { username, .. } => username,
        }
    }
}
