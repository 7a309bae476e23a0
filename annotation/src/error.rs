use thiserror::Error;

/// Errors raised while building or loading an annotation set.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("annotation: duplicate id {0:?}")]
    DuplicateId(String),

    #[error("annotation: empty id")]
    EmptyId,

    #[error("annotation: {id:?} has quality score {score} outside [0, 1]")]
    InvalidQuality { id: String, score: f32 },

    #[error("annotation: unknown viewpoint {0:?}")]
    UnknownViewpoint(String),

    #[error("annotation: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("annotation: parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
