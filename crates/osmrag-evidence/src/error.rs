//! Error types for the evidence store and retrieval engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The persisted index or its metadata could not be loaded.
    #[error("evidence store unavailable at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },

    #[error("failed to decode evidence index: {0}")]
    Decode(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The query embedder does not produce vectors in the index's space.
    #[error(
        "embedder mismatch: index was built with {index_backend}/{index_model}, \
         query embedder is {query_backend}/{query_model}"
    )]
    EmbedderMismatch {
        index_backend: String,
        index_model: String,
        query_backend: String,
        query_model: String,
    },

    #[error("embedding failed ({backend}): {message}")]
    Embedding { backend: String, message: String },

    #[error("index build failed: {0}")]
    Build(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn embedding(backend: &str, message: impl Into<String>) -> Self {
        Self::Embedding {
            backend: backend.to_string(),
            message: message.into(),
        }
    }
}
