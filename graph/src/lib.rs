//! Weighted undirected graph over cluster nodes.
//!
//! Nodes are clusters (initially one per annotation); edges hold the current
//! affinity between two clusters. Merging two clusters is an edge
//! contraction: both endpoints disappear and their edges are rewired onto
//! the merged node, marked stale until the caller rescores them.

pub mod error;
pub mod graph;

pub use error::GraphError;
pub use graph::{ClusterGraph, Contraction, Edge, NodeId};
