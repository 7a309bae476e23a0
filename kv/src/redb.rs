//! Redb-based persistent key-value store implementation.
//!
//! Each call runs in its own redb transaction, so a process killed between
//! calls leaves every key either at its old or its new value.

use std::fmt::Display;
use std::ops::Bound;
use std::path::Path;

use redb::{Database, DatabaseError, ReadableTable, TableDefinition};

use crate::{KVError, KVResult, KVStore};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn storage<E: Display>(e: E) -> KVError {
    KVError::Storage(e.to_string())
}

/// A persistent key-value store backed by redb.
///
/// redb locks its file for the lifetime of the [`Database`]; a second
/// process opening the same path gets [`KVError::Unavailable`] until the
/// first one drops its handle.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KVResult<Self> {
        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => KVError::Unavailable(e.to_string()),
            other => storage(other),
        })?;

        // Create the table if it doesn't exist
        let tx = db.begin_write().map_err(storage)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }

    fn range(
        &self,
        prefix: &str,
        lower: Bound<&str>,
        limit: usize,
    ) -> KVResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        let mut results = Vec::new();
        for item in table
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(storage)?
        {
            if results.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(storage)?;
            let key_str = key.value();
            if !key_str.starts_with(prefix) {
                break;
            }
            results.push((key_str.to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;
        Ok(table
            .get(key)
            .map_err(storage)?
            .map(|value| value.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> KVResult<()> {
        self.batch_set(&[(key, value)])
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        self.range(prefix, Bound::Included(prefix), usize::MAX)
    }

    fn scan_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KVResult<Vec<(String, Vec<u8>)>> {
        let lower = match after {
            Some(a) if a >= prefix => Bound::Excluded(a),
            _ => Bound::Included(prefix),
        };
        self.range(prefix, lower, limit)
    }

    fn batch_set(&self, entries: &[(&str, &[u8])]) -> KVResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            for (key, value) in entries {
                table.insert(*key, *value).map_err(storage)?;
            }
        }
        tx.commit().map_err(storage)?;
        Ok(())
    }

    fn compare_and_swap_with(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        extra: &[(&str, &[u8])],
    ) -> KVResult<bool> {
        let tx = self.db.begin_write().map_err(storage)?;
        let swapped = {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            let current = table
                .get(key)
                .map_err(storage)?
                .map(|value| value.value().to_vec());
            if current.as_deref() == expected {
                table.insert(key, new).map_err(storage)?;
                for (k, v) in extra {
                    table.insert(*k, *v).map_err(storage)?;
                }
                true
            } else {
                false
            }
        };
        if swapped {
            tx.commit().map_err(storage)?;
        } else {
            tx.abort().map_err(storage)?;
        }
        Ok(swapped)
    }
}
