use thiserror::Error;

/// Errors returned by affinity adapters.
#[derive(Debug, Error)]
pub enum AffinityError {
    /// Score or confidence outside [0, 1]. Never clamped: an out-of-range
    /// value means the upstream model is broken.
    #[error("affinity: invalid score {score} (confidence {confidence}), expected values in [0, 1]")]
    InvalidScore { score: f32, confidence: f32 },

    #[error("affinity: no embedding for {0:?}")]
    MissingEmbedding(String),

    #[error("affinity: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("affinity: pair ({a:?}, {b:?}) listed twice with different scores")]
    InconsistentPair { a: String, b: String },

    #[error("affinity: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("affinity: parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
