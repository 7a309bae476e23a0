//! Conflict queue and decision store.
//!
//! Ambiguous cluster pairs found by the clustering engine are queued here
//! as [`ClusterPair`] rows. Reviewers list them, optionally claim one, and
//! resolve it with a [`Decision`]; the finalizer applies resolved rows and
//! marks them applied. Rows live in a [`herdid_kv::KVStore`] under a run
//! prefix:
//!
//! ```text
//! pending ──resolve──▶ resolved ──mark_applied──▶ applied
//!    │                    │
//!    └────mark_stale──────┴──────────▶ stale
//! ```
//!
//! The backend waits for reviews with a [`Poller`]: a fixed-interval poll
//! that stops when the queue is empty or its cancellation token fires.

mod error;
pub mod keys;
mod poll;
mod store;
mod types;

pub use error::DecisionError;
pub use poll::{DEFAULT_POLL_INTERVAL, PollState, Poller};
pub use store::{DEFAULT_PAGE_SIZE, DecisionStore, PendingIter};
pub use types::{
    Alternative, AuditEntry, Claim, ClusterPair, Decision, EnqueueOutcome, Outcome, PairStatus, Stats,
    pair_id,
};
