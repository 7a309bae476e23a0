use thiserror::Error;

use crate::NodeId;

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("graph: node {0} not found")]
    NodeNotFound(NodeId),

    #[error("graph: node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("graph: self loop on node {0}")]
    SelfLoop(NodeId),

    #[error("graph: invalid affinity on edge ({a}, {b}): score {score}, confidence {confidence}")]
    InvalidScore {
        a: NodeId,
        b: NodeId,
        score: f32,
        confidence: f32,
    },
}
