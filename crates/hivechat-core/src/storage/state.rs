//! Local scalar state: sync cursors and exception lists
//!
//! Kept in its own database file (`state.redb`) so that purging or rebuilding
//! the message cache never loses the user's allow-list.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CacheBackend, CacheTxn, MemoryBackend, RedbBackend, Table};
use crate::error::SyncResult;

/// A sender whose messages bypass the minimum-payment check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub username: String,
    /// Unix timestamp in milliseconds
    pub added_at: i64,
}

fn exception_key(owner: &str, username: &str) -> String {
    format!(
        "{}\0{}",
        owner.to_ascii_lowercase(),
        username.to_ascii_lowercase()
    )
}

/// Per-user scalar state surviving restarts.
#[derive(Clone)]
pub struct LocalState {
    backend: Arc<dyn CacheBackend>,
}

impl LocalState {
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        Ok(Self::with_backend(Arc::new(RedbBackend::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    fn begin(&self) -> CacheTxn<'_> {
        CacheTxn::new(self.backend.as_ref())
    }

    pub fn cursor(&self, username: &str) -> SyncResult<Option<u64>> {
        self.begin()
            .get_json(Table::Cursors, &username.to_ascii_lowercase())
    }

    pub fn set_cursor(&self, username: &str, op_index: u64) -> SyncResult<()> {
        let mut txn = self.begin();
        txn.put_json(Table::Cursors, username.to_ascii_lowercase(), &op_index)?;
        txn.commit()?;
        Ok(())
    }

    pub fn clear_cursor(&self, username: &str) -> SyncResult<()> {
        let mut txn = self.begin();
        txn.delete_raw(Table::Cursors, username.to_ascii_lowercase());
        txn.commit()?;
        Ok(())
    }

    pub fn exceptions(&self, owner: &str) -> SyncResult<Vec<ExceptionEntry>> {
        let prefix = format!("{}\0", owner.to_ascii_lowercase());
        Ok(self
            .begin()
            .scan_json::<ExceptionEntry>(Table::Exceptions, &prefix)?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    pub fn is_exception(&self, owner: &str, username: &str) -> SyncResult<bool> {
        Ok(self
            .begin()
            .get_raw(Table::Exceptions, &exception_key(owner, username))?
            .is_some())
    }

    /// Returns `false` when the sender was already listed.
    pub fn add_exception(&self, owner: &str, username: &str, at: i64) -> SyncResult<bool> {
        if self.is_exception(owner, username)? {
            return Ok(false);
        }
        let entry = ExceptionEntry {
            username: username.to_ascii_lowercase(),
            added_at: at,
        };
        let mut txn = self.begin();
        txn.put_json(Table::Exceptions, exception_key(owner, username), &entry)?;
        txn.commit()?;
        Ok(true)
    }

    /// Returns `false` when the sender was not listed.
    pub fn remove_exception(&self, owner: &str, username: &str) -> SyncResult<bool> {
        if !self.is_exception(owner, username)? {
            return Ok(false);
        }
        let mut txn = self.begin();
        txn.delete_raw(Table::Exceptions, exception_key(owner, username));
        txn.commit()?;
        Ok(true)
    }
}
