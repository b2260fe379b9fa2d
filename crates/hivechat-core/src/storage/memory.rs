//! In-memory [`CacheBackend`] for tests and dry runs

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{BatchOp, CacheBackend, Table, WriteBatch};
use crate::error::SyncResult;

/// Backend holding every table in ordered maps. Commits apply under one lock.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table.
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|t| t.get(key).cloned()))
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read();
        let Some(entries) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_range(
        &self,
        table: Table,
        start: &str,
        end: &str,
    ) -> SyncResult<Vec<(String, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let Some(entries) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        let mut tables = self.tables.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                BatchOp::Delete { table, key } => {
                    if let Some(entries) = tables.get_mut(&table) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
