//! KV key layout of the decision store.
//!
//! ```text
//! {prefix}:pair:{pair_id}             → JSON ClusterPair
//! {prefix}:log:{pair_id}:{seq}        → JSON AuditEntry
//! {prefix}:archive:{pair_id}:{n}      → JSON ClusterPair (stale row replaced by a requeue)
//! ```
//!
//! Sequence numbers are zero-padded so lexicographic order is numeric order.

/// Key of a pair row. Format: "{prefix}:pair:{pair_id}"
pub fn pair_key(prefix: &str, pair_id: &str) -> String {
    format!("{prefix}:pair:{pair_id}")
}

/// Prefix for scanning all pair rows. Format: "{prefix}:pair:"
pub fn pair_prefix(prefix: &str) -> String {
    format!("{prefix}:pair:")
}

/// Key of one audit entry. Format: "{prefix}:log:{pair_id}:{seq:08}"
pub fn log_key(prefix: &str, pair_id: &str, seq: u64) -> String {
    format!("{prefix}:log:{pair_id}:{seq:08}")
}

/// Prefix for a pair's audit entries. Format: "{prefix}:log:{pair_id}:"
pub fn log_pair_prefix(prefix: &str, pair_id: &str) -> String {
    format!("{prefix}:log:{pair_id}:")
}

/// Prefix for every audit entry. Format: "{prefix}:log:"
pub fn log_prefix(prefix: &str) -> String {
    format!("{prefix}:log:")
}

/// Key of an archived row. Format: "{prefix}:archive:{pair_id}:{n:04}"
pub fn archive_key(prefix: &str, pair_id: &str, n: usize) -> String {
    format!("{prefix}:archive:{pair_id}:{n:04}")
}

/// Prefix for a pair's archived rows. Format: "{prefix}:archive:{pair_id}:"
pub fn archive_prefix(prefix: &str, pair_id: &str) -> String {
    format!("{prefix}:archive:{pair_id}:")
}

/// Pair id from a row key produced by [`pair_key`].
pub(crate) fn pair_id_of<'k>(prefix: &str, key: &'k str) -> Option<&'k str> {
    key.strip_prefix(prefix)?.strip_prefix(":pair:")
}
