//! Error types reported by inference backends.

use thiserror::Error;

/// Failures surfaced by an [`InferenceBackend`](crate::InferenceBackend).
///
/// Load failures are typed so the cache can purge the placeholder instance
/// and report the cause to whoever asked for the model.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The model could not be loaded into memory
    #[error("Model load failed: {0}")]
    LoadFailed(String),

    /// Inference against a loaded model failed
    #[error("Model inference failed: {0}")]
    InferenceFailed(String),

    /// Releasing a model's resources failed
    #[error("Model unload failed: {0}")]
    UnloadFailed(String),

    /// Not enough device or host memory to satisfy the request
    #[error("Memory constrained: {0}")]
    MemoryConstrained(String),

    /// Device error (GPU unavailable, etc.)
    #[error("Device error: {0}")]
    Device(String),

    /// The handle passed in was not produced by this backend
    #[error("Invalid model handle: {0}")]
    InvalidHandle(String),

    /// Other errors
    #[error("Backend error: {0}")]
    Other(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;
