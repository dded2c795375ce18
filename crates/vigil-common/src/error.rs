use thiserror::Error;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("metric already registered with a different descriptor: {0}")]
    DuplicateMetric(String),
    #[error("label cardinality mismatch for {metric}: expected {expected} values, got {actual}")]
    LabelCardinality {
        metric: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid operation on {metric}: {reason}")]
    InvalidOperation { metric: String, reason: String },
    #[error("series limit reached: limit={limit}, metric={metric}")]
    CardinalityLimit { metric: String, limit: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
