use thiserror::Error;

use herdid_affinity::AffinityError;
use herdid_graph::GraphError;

use crate::ClusterId;

/// Errors returned by the clustering engine and the partition arena.
#[derive(Debug, Error)]
pub enum LcaError {
    /// The affinity model produced a value outside [0, 1]. Fatal: the edge is
    /// rejected rather than clamped.
    #[error("lca: invalid affinity score {score} (confidence {confidence}) between {a} and {b}")]
    InvalidAffinityScore {
        a: String,
        b: String,
        score: f32,
        confidence: f32,
    },

    #[error("lca: affinity model failed for ({a}, {b}): {source}")]
    Affinity {
        a: String,
        b: String,
        #[source]
        source: AffinityError,
    },

    #[error("lca: graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("lca: unknown annotation {0:?}")]
    UnknownAnnotation(String),

    #[error("lca: annotation {0:?} listed twice")]
    DuplicateAnnotation(String),

    #[error("lca: unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("lca: cluster {0} was superseded")]
    Superseded(ClusterId),

    #[error("lca: journal replay expected new cluster {expected}, op names {got}")]
    ReplayMismatch { expected: ClusterId, got: ClusterId },

    #[error("lca: partition invariant violated: {0}")]
    PartitionViolation(String),

    #[error("lca: invalid config: {0}")]
    InvalidConfig(String),

    #[error("lca: component worker panicked")]
    WorkerPanicked,
}

impl LcaError {
    /// Attaches the scored pair to an affinity failure.
    pub(crate) fn from_affinity(a: impl ToString, b: impl ToString, err: AffinityError) -> Self {
        match err {
            AffinityError::InvalidScore { score, confidence } => LcaError::InvalidAffinityScore {
                a: a.to_string(),
                b: b.to_string(),
                score,
                confidence,
            },
            source => LcaError::Affinity {
                a: a.to_string(),
                b: b.to_string(),
                source,
            },
        }
    }
}
