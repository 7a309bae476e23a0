use thiserror::Error;

use herdid_kv::KVError;

use crate::types::{Outcome, PairStatus};

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("decision: pair {0} not found")]
    NotFound(String),

    /// The pair already carries a decision with a different outcome.
    #[error("decision: pair {pair_id} already resolved as {existing}")]
    AlreadyResolved { pair_id: String, existing: Outcome },

    /// The row was not in the status the transition requires, or another
    /// writer moved it first.
    #[error("decision: pair {pair_id} is {actual}, expected {expected}")]
    StaleTransition {
        pair_id: String,
        expected: PairStatus,
        actual: PairStatus,
    },

    /// A live row with the same id holds different content.
    #[error("decision: pair {0} already queued with different content")]
    ConflictingEnqueue(String),

    #[error("decision: pair {pair_id} is claimed by {by}")]
    ClaimedByOther { pair_id: String, by: String },

    #[error("decision: pair {pair_id} is not claimed by {reviewer}")]
    NotClaimed { pair_id: String, reviewer: String },

    #[error("decision: unknown outcome {0:?} (expected merge, split or defer)")]
    InvalidOutcome(String),

    /// The backing store is held by another process. The operation did not
    /// happen; retrying later is safe.
    #[error("decision: store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("decision: storage error: {0}")]
    Storage(String),

    #[error("decision: serialization error: {0}")]
    Serialization(String),
}

impl From<KVError> for DecisionError {
    fn from(err: KVError) -> Self {
        match err {
            KVError::Unavailable(msg) => DecisionError::StoreUnavailable(msg),
            KVError::Storage(msg) => DecisionError::Storage(msg),
        }
    }
}

impl From<serde_json::Error> for DecisionError {
    fn from(err: serde_json::Error) -> Self {
        DecisionError::Serialization(err.to_string())
    }
}
