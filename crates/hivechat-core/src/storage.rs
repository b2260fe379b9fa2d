//! Persistent storage using redb.
//!
//! Storage is split in two layers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  MessageCache / LocalState   typed records + secondary indexes│
//! │        │                                                      │
//! │        ▼  CacheTxn (staged writes, reads see them)            │
//! │  CacheBackend                named tables, atomic WriteBatch  │
//! │  ├── RedbBackend             one redb file per store          │
//! │  └── MemoryBackend           tests and dry runs               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A sync batch stages every write in one [`CacheTxn`] and commits it as a
//! single [`WriteBatch`]; either every record of the batch lands or none does.
//! Values are JSON-encoded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncResult;

mod groups;
mod memory;
mod messages;
mod redb_backend;
mod state;

pub use memory::MemoryBackend;
pub use messages::{CompletedSession, ConversationQuery};
pub use redb_backend::RedbBackend;
pub use state::{ExceptionEntry, LocalState};

/// Named tables shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// tx_id -> Message
    Messages,
    /// `{conversation}\0{timestamp}\0{op_index}\0{tx_id}` -> tx_id
    ConversationIndex,
    /// `{timestamp}\0{tx_id}` -> tx_id
    TimestampIndex,
    /// `{session_id}\0{chunk_index}\0{tx_id}` -> tx_id
    SessionIndex,
    /// `{payload_hash}\0{tx_id}` -> tx_id, unconfirmed local sends only
    PendingHashes,
    /// session_id -> CompletedSession
    CompletedSessions,
    /// `{op_index}\0{tx_id}` -> FilteredRecord
    Filtered,
    /// group_id -> GroupAnnouncement
    Groups,
    /// `{group_id}\0{username}` -> JoinRequest
    JoinRequests,
    /// `{group_id}\0{username}\0{tx_id}` -> PaymentRecord
    Payments,
    /// username -> last synced op_index
    Cursors,
    /// `{owner}\0{username}` -> ExceptionEntry
    Exceptions,
}

impl Table {
    pub const ALL: [Table; 12] = [
        Table::Messages,
        Table::ConversationIndex,
        Table::TimestampIndex,
        Table::SessionIndex,
        Table::PendingHashes,
        Table::CompletedSessions,
        Table::Filtered,
        Table::Groups,
        Table::JoinRequests,
        Table::Payments,
        Table::Cursors,
        Table::Exceptions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::ConversationIndex => "idx_conversation",
            Table::TimestampIndex => "idx_timestamp",
            Table::SessionIndex => "idx_session",
            Table::PendingHashes => "idx_pending_hash",
            Table::CompletedSessions => "completed_sessions",
            Table::Filtered => "filtered",
            Table::Groups => "groups",
            Table::JoinRequests => "join_requests",
            Table::Payments => "payments",
            Table::Cursors => "cursors",
            Table::Exceptions => "exceptions",
        }
    }
}

/// One staged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
}

/// Mutations applied atomically by [`CacheBackend::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: Table, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            table,
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, table: Table, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete {
            table,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value persistence over named tables.
pub trait CacheBackend: Send + Sync {
    fn get(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, table: Table, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>>;

    /// All entries with `start <= key < end`, in key order.
    fn scan_range(&self, table: Table, start: &str, end: &str)
        -> SyncResult<Vec<(String, Vec<u8>)>>;

    /// Apply every operation of the batch or none of them.
    fn commit(&self, batch: WriteBatch) -> SyncResult<()>;
}

/// Staged view over a backend.
///
/// Writes are buffered until [`commit`](CacheTxn::commit); reads consult the
/// buffer first, so later steps of a batch see what earlier steps wrote.
/// Dropping an uncommitted txn discards it.
pub struct CacheTxn<'a> {
    backend: &'a dyn CacheBackend,
    staged: BTreeMap<(Table, String), Option<Vec<u8>>>,
}

impl<'a> CacheTxn<'a> {
    pub fn new(backend: &'a dyn CacheBackend) -> Self {
        Self {
            backend,
            staged: BTreeMap::new(),
        }
    }

    /// Number of staged mutations.
    pub fn pending_writes(&self) -> usize {
        self.staged.len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Write every staged mutation in one backend commit.
    pub fn commit(self) -> SyncResult<usize> {
        let count = self.staged.len();
        if count == 0 {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for ((table, key), value) in self.staged {
            match value {
                Some(value) => batch.put(table, key, value),
                None => batch.delete(table, key),
            }
        }
        self.backend.commit(batch)?;
        Ok(count)
    }

    pub(crate) fn get_raw(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        match self.staged.get(&(table, key.to_string())) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.get(table, key),
        }
    }

    pub(crate) fn put_raw(&mut self, table: Table, key: impl Into<String>, value: Vec<u8>) {
        self.staged.insert((table, key.into()), Some(value));
    }

    pub(crate) fn delete_raw(&mut self, table: Table, key: impl Into<String>) {
        self.staged.insert((table, key.into()), None);
    }

    pub(crate) fn scan_prefix_raw(
        &self,
        table: Table,
        prefix: &str,
    ) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let stored = self.backend.scan_prefix(table, prefix)?;
        Ok(self.overlay(table, stored, |k| k.starts_with(prefix)))
    }

    pub(crate) fn scan_range_raw(
        &self,
        table: Table,
        start: &str,
        end: &str,
    ) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let stored = self.backend.scan_range(table, start, end)?;
        Ok(self.overlay(table, stored, |k| k >= start && k < end))
    }

    fn overlay(
        &self,
        table: Table,
        stored: Vec<(String, Vec<u8>)>,
        in_scope: impl Fn(&str) -> bool,
    ) -> Vec<(String, Vec<u8>)> {
        let mut merged: BTreeMap<String, Vec<u8>> = stored.into_iter().collect();
        for ((t, key), value) in self.staged.range((table, String::new())..) {
            if *t != table {
                break;
            }
            if !in_scope(key) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    pub(crate) fn get_json<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &str,
    ) -> SyncResult<Option<T>> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_json<T: Serialize>(
        &mut self,
        table: Table,
        key: impl Into<String>,
        value: &T,
    ) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(table, key, bytes);
        Ok(())
    }

    pub(crate) fn scan_json<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> SyncResult<Vec<(String, T)>> {
        self.scan_prefix_raw(table, prefix)?
            .into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_slice(&v)?)))
            .collect()
    }
}

/// Message cache for one viewing account.
///
/// Every derived record (messages, chunk sets, filtered operations, groups,
/// join requests, payments) lives here. Writes go through
/// [`begin`](MessageCache::begin); the query helpers read committed state.
#[derive(Clone)]
pub struct MessageCache {
    backend: Arc<dyn CacheBackend>,
}

impl MessageCache {
    /// Open (or create) a redb-backed cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        Ok(Self::with_backend(Arc::new(RedbBackend::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn begin(&self) -> CacheTxn<'_> {
        CacheTxn::new(self.backend.as_ref())
    }
}

/// Zero-padded decimal so lexicographic order matches numeric order.
pub(crate) fn sortable_u64(n: u64) -> String {
    format!("{:020}", n)
}

pub(crate) fn sortable_ts(ts: i64) -> String {
    sortable_u64(ts.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_reads_see_staged_writes() {
        let cache = MessageCache::in_memory();
        let mut txn = cache.begin();
        txn.put_raw(Table::Groups, "g1", b"one".to_vec());
        assert_eq!(txn.get_raw(Table::Groups, "g1").unwrap(), Some(b"one".to_vec()));

        txn.delete_raw(Table::Groups, "g1");
        assert_eq!(txn.get_raw(Table::Groups, "g1").unwrap(), None);
    }

    #[test]
    fn test_dropped_txn_writes_nothing() {
        let cache = MessageCache::in_memory();
        {
            let mut txn = cache.begin();
            txn.put_raw(Table::Groups, "g1", b"one".to_vec());
        }
        assert_eq!(cache.begin().get_raw(Table::Groups, "g1").unwrap(), None);
    }

    #[test]
    fn test_scan_merges_staged_and_committed() {
        let cache = MessageCache::in_memory();
        let mut txn = cache.begin();
        txn.put_raw(Table::JoinRequests, "g1\0alice", b"a".to_vec());
        txn.put_raw(Table::JoinRequests, "g1\0bob", b"b".to_vec());
        txn.put_raw(Table::JoinRequests, "g2\0carol", b"c".to_vec());
        assert_eq!(txn.commit().unwrap(), 3);

        let mut txn = cache.begin();
        txn.delete_raw(Table::JoinRequests, "g1\0alice");
        txn.put_raw(Table::JoinRequests, "g1\0dave", b"d".to_vec());
        txn.put_raw(Table::Groups, "g1\0zed", b"other table".to_vec());

        let keys: Vec<String> = txn
            .scan_prefix_raw(Table::JoinRequests, "g1\0")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["g1\0bob".to_string(), "g1\0dave".to_string()]);
    }

    #[test]
    fn test_sortable_keys_order_numerically() {
        assert!(sortable_u64(9) < sortable_u64(10));
        assert!(sortable_ts(-5) < sortable_ts(1));
    }
}
