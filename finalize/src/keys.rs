//! KV key layout of a run, next to the decision rows.
//!
//! ```text
//! {run}:journal:{seq:020}         → msgpack PartitionOp
//! {run}:identity:{identity_id}    → JSON Identity
//! ```

/// KV key of a journal entry. Format: "{run}:journal:{seq:020}"
pub fn journal_key(run: &str, seq: usize) -> String {
    format!("{run}:journal:{seq:020}")
}

/// Prefix for the whole journal. Format: "{run}:journal:"
pub fn journal_prefix(run: &str) -> String {
    format!("{run}:journal:")
}

/// KV key of an identity record. Format: "{run}:identity:{identity_id}"
pub fn identity_key(run: &str, identity_id: &str) -> String {
    format!("{run}:identity:{identity_id}")
}

/// Prefix for all identity records. Format: "{run}:identity:"
pub fn identity_prefix(run: &str) -> String {
    format!("{run}:identity:")
}

/// Sequence number of a journal key.
pub(crate) fn journal_seq(run: &str, key: &str) -> Option<usize> {
    key.strip_prefix(&journal_prefix(run))?.parse().ok()
}
