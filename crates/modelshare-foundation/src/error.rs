//! Errors produced by the sharing service.
//!
//! Capacity exhaustion is deliberately absent: a soft rejection is reported
//! as `Ok(None)` from `acquire`, not as an error.

use modelshare_kernel::BackendError;
use modelshare_kernel::config::ConfigError;

/// Errors produced by [`ModelSharingService`](crate::ModelSharingService) operations
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ShareError {
    /// `stop()` has been called; no new work is admitted
    #[error("model sharing service is shutting down")]
    ShuttingDown,

    /// The instance id is unknown (never existed, evicted, or purged)
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// `commit_instance` was called for an instance that is not loading
    #[error("instance {0} is not in loading state")]
    NotLoading(String),

    /// The instance exists but has not finished loading
    #[error("instance {0} is still loading")]
    StillLoading(String),

    /// The caller tried to use an instance it does not hold
    #[error("caller {caller_id} does not hold instance {instance_id}")]
    NotHolder {
        instance_id: String,
        caller_id: String,
    },

    /// The backend failed to load the model; the placeholder has been purged
    #[error("failed to load model {model_name}: {source}")]
    LoadFailed {
        model_name: String,
        source: BackendError,
    },

    /// Any other backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Invalid or unreadable configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias used throughout this crate
pub type ShareResult<T> = std::result::Result<T, ShareError>;
