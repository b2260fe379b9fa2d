//! Sync watermark and backfill planning
//!
//! The cursor is the `op_index` of the last operation whose batch reached the
//! cache. It only ever moves forward, and it moves only after a commit.

use tracing::debug;

use crate::error::SyncResult;
use crate::storage::LocalState;

/// Per-user last-processed-operation watermark.
#[derive(Clone)]
pub struct SyncCursor {
    state: LocalState,
}

impl SyncCursor {
    pub fn new(state: LocalState) -> Self {
        Self { state }
    }

    pub fn get_cursor(&self, username: &str) -> SyncResult<Option<u64>> {
        self.state.cursor(username)
    }

    /// Move the cursor to `op_index`. Lower values are ignored; returns
    /// whether the stored value changed.
    pub fn advance(&self, username: &str, op_index: u64) -> SyncResult<bool> {
        match self.state.cursor(username)? {
            Some(current) if op_index <= current => {
                if op_index < current {
                    debug!(username, current, op_index, "Ignoring cursor regression");
                }
                Ok(false)
            }
            _ => {
                self.state.set_cursor(username, op_index)?;
                Ok(true)
            }
        }
    }

    /// Forget the cursor so the next sync starts from the head window.
    pub fn reset(&self, username: &str) -> SyncResult<()> {
        self.state.clear_cursor(username)
    }
}

/// Operations one sync pass should fetch: `start..=through`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPlan {
    pub start: u64,
    pub through: u64,
    /// Operations between the cursor and `start` were skipped
    pub gap_exceeded: bool,
}

impl BackfillPlan {
    /// Number of ledger positions covered (never zero).
    pub fn span(&self) -> u64 {
        (self.through - self.start).saturating_add(1)
    }
}

/// Decide which operations to fetch. `None` when there is nothing new.
///
/// - no cursor: the most recent `max_backfill` operations, no gap reported
/// - more than `max_backfill` new operations: only the most recent
///   `max_backfill`, with `gap_exceeded`
/// - otherwise everything after the cursor
pub fn compute_backfill_plan(
    cursor: Option<u64>,
    head: Option<u64>,
    max_backfill: u64,
) -> Option<BackfillPlan> {
    let head = head?;
    let max_backfill = max_backfill.max(1);
    let window_start = head.saturating_sub(max_backfill - 1);

    match cursor {
        None => Some(BackfillPlan {
            start: window_start,
            through: head,
            gap_exceeded: false,
        }),
        Some(cursor) if cursor >= head => None,
        Some(cursor) if head - cursor > max_backfill => Some(BackfillPlan {
            start: window_start,
            through: head,
            gap_exceeded: true,
        }),
        Some(cursor) => Some(BackfillPlan {
            start: cursor + 1,
            through: head,
            gap_exceeded: false,
        }),
    }
}
