//! Local clustering with alternatives (LCA).
//!
//! The engine grows clusters over a [`ClusterGraph`] one neighborhood at a
//! time. For every neighborhood it enumerates a few competing partition
//! hypotheses, scores them by aggregate affinity, and only commits the best
//! one when it beats the runner-up by a configured margin. Anything closer
//! becomes a [`Conflict`] for a human to decide, and the clusters involved
//! are frozen until then.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Engine::new(&config, &model, &annotations);
//! let mut state = engine.build(&split.identifiable)?;
//! let report = engine.run(&mut state, &BTreeSet::new())?;
//! for conflict in &report.conflicts {
//!     // hand over to the decision store
//! }
//! ```
//!
//! All partition mutation goes through [`ClusterState::merge`] and
//! [`ClusterState::separate`], which append to a replayable journal of
//! [`PartitionOp`]s.

mod builder;
mod config;
mod engine;
mod error;
mod hypothesis;
mod partition;

pub use config::LcaConfig;
pub use engine::{ClusterState, Conflict, Engine, MergeRecord, RunReport};
pub use error::LcaError;
pub use hypothesis::{Hypothesis, Verdict, decide};
pub use partition::{Cluster, MergeOrigin, Partition, PartitionOp};

pub use herdid_graph::{ClusterGraph, NodeId};

/// Clusters are graph nodes; the id is shared.
pub use herdid_graph::NodeId as ClusterId;
