use thiserror::Error;

use herdid_decision::DecisionError;
use herdid_kv::KVError;
use herdid_lca::LcaError;

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("finalize: lca error: {0}")]
    Lca(#[from] LcaError),

    #[error("finalize: decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("finalize: kv error: {0}")]
    KV(#[from] KVError),

    #[error("finalize: journal entry {seq} unreadable: {reason}")]
    CorruptJournal { seq: usize, reason: String },

    #[error("finalize: resolved pair {0} carries no decision")]
    MissingDecision(String),

    #[error("finalize: invalid config: {0}")]
    InvalidConfig(String),

    #[error("finalize: serialization error: {0}")]
    Serialization(String),

    #[error("finalize: io error: {0}")]
    Io(#[from] std::io::Error),
}
