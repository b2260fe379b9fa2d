//! redb-backed [`CacheBackend`]
//!
//! Every [`Table`] maps to a `TableDefinition<&str, &[u8]>` of the same name.
//! All tables are created when the database is opened, so reads never hit a
//! missing table.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use super::{BatchOp, CacheBackend, Table, WriteBatch};
use crate::error::SyncResult;

fn definition(table: Table) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(table.name())
}

/// Durable backend over one redb file
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<RwLock<Database>>,
}

impl RedbBackend {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                let _ = write_txn.open_table(definition(table))?;
            }
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

impl CacheBackend for RedbBackend {
    fn get(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(definition(table))?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(definition(table))?;

        let mut entries = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_string(), value.value().to_vec()));
        }
        Ok(entries)
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
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(definition(table))?;

        let mut entries = Vec::new();
        for entry in table.range(start..end)? {
            let (key, value) = entry?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { table, key, value } => {
                    let mut table = write_txn.open_table(definition(table))?;
                    table.insert(key.as_str(), value.as_slice())?;
                }
                BatchOp::Delete { table, key } => {
                    let mut table = write_txn.open_table(definition(table))?;
                    table.remove(key.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
