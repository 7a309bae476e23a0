//! Key-value store interface and implementations.
//!
//! Every herdid run keeps its durable state (decision rows, the partition
//! journal, identities) in a [`KVStore`]. The store is append/transition
//! only: there is no delete, and row transitions go through
//! [`KVStore::compare_and_swap`] so concurrent writers never clobber each
//! other.
//!
//! [`MemoryStore`] is for tests and ephemeral runs, [`RedbStore`] persists
//! to a single redb file.

pub mod memory;
pub mod redb;

use std::fmt;
use thiserror::Error;

/// Errors that can occur in KV store operations.
#[derive(Error, Debug)]
pub enum KVError {
    /// The backing file is held by another process.
    #[error("kv: store unavailable: {0}")]
    Unavailable(String),

    #[error("kv: storage error: {0}")]
    Storage(String),
}

/// Result type for KV operations.
pub type KVResult<T> = Result<T, KVError>;

/// Key-value store trait with string keys and byte values.
///
/// Scans return entries in ascending key order.
pub trait KVStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>>;

    /// Set a key-value pair unconditionally.
    fn set(&self, key: &str, value: &[u8]) -> KVResult<()>;

    /// Return all entries whose key starts with `prefix`.
    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>>;

    /// Return at most `limit` entries under `prefix` with keys strictly
    /// greater than `after` (or from the start when `after` is `None`).
    fn scan_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> KVResult<Vec<(String, Vec<u8>)>>;

    /// Set multiple key-value pairs in one atomic write.
    fn batch_set(&self, entries: &[(&str, &[u8])]) -> KVResult<()>;

    /// Atomically replace the value at `key` with `new` if the current value
    /// equals `expected` (`None` meaning "absent"). Returns whether the swap
    /// happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> KVResult<bool> {
        self.compare_and_swap_with(key, expected, new, &[])
    }

    /// Like [`KVStore::compare_and_swap`], and also sets every entry of
    /// `extra` in the same atomic write. Nothing is written when the swap
    /// fails.
    fn compare_and_swap_with(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        extra: &[(&str, &[u8])],
    ) -> KVResult<bool>;
}

impl fmt::Debug for dyn KVStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KVStore {{ ... }}")
    }
}

/// A boxed KV store for use in trait objects.
pub type BoxedKVStore = Box<dyn KVStore>;

// Re-export the implementations
pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;
