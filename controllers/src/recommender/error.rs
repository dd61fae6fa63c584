use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecommenderError {
    /// A sample or an OOM refers to a pod or container the model doesn't know.
    #[error("KeyError: {0}")]
    KeyError(String),
    #[error("sample discarded (invalid or out of order)")]
    SampleDiscarded,
    #[error("OOM event will be discarded - it is too old ({0})")]
    OomDiscarded(String),
    #[error("unsupported checkpoint version {found} (expected {expected})")]
    CheckpointVersionMismatch { found: String, expected: String },
    #[error("checkpoint has bucket {bucket} that is out of range ({num_buckets} buckets)")]
    CheckpointBucketOverflow { bucket: usize, num_buckets: usize },
    #[error("checkpoint has negative total weight")]
    CheckpointNegativeWeight,
    #[error("Cycle detected in ownership chain")]
    CycleInOwnership,
    #[error("{kind} {namespace}/{name} does not exist")]
    ControllerNotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("unknown metric source type {0:?}")]
    InvalidMetricSourceType(String),
    #[error("couldn't convert selector into a corresponding internal selector object: {0}")]
    InvalidSelector(String),
    #[error("MPA {namespace}/{name} is missing recommendation for more than {minutes}m")]
    MissingRecommendation {
        namespace: String,
        name: String,
        minutes: i64,
    },
}

impl RecommenderError {
    pub fn is_key_error(&self) -> bool {
        matches!(self, RecommenderError::KeyError(_))
    }
}
