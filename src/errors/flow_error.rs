//! Flow-related error types.

use thiserror::Error;

/// Errors that can occur while building or running a graph flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Graph {graph} has {count} nodes but the batch is padded to {max_nodes}")]
    NodeCountOutOfRange {
        graph: usize,
        count: f32,
        max_nodes: usize,
    },

    #[error("Graph {graph} has invalid node count {count}: must be a non-negative integer")]
    InvalidNodeCount { graph: usize, count: f32 },

    #[error("Graph {graph} has no nodes; its per-node objective is undefined")]
    EmptyGraph { graph: usize },

    #[error("Mixing matrix is singular and cannot be inverted")]
    SingularMatrix,

    #[error("Tensor data error: {0}")]
    Data(String),

    #[error("Empty batch: {0}")]
    EmptyBatch(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Training error: {message}")]
    TrainingError { message: String },
}

impl FlowError {
    /// Shorthand for an [`FlowError::InvalidConfig`] error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl From<burn::tensor::DataError> for FlowError {
    fn from(err: burn::tensor::DataError) -> Self {
        Self::Data(format!("{err:?}"))
    }
}
