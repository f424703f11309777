use thiserror::Error;

/// Errors reported by a tree store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store rejected {path}: {reason}")]
    Rejected { path: String, reason: String },

    #[error("Node not found: {path}")]
    NotFound { path: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}
