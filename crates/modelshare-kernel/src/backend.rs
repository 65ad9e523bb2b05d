//! Inference backend contract.
//!
//! The cache never touches model weights itself. It asks an
//! [`InferenceBackend`] to load a model, keeps the returned [`ModelHandle`]
//! inside exactly one instance record, forwards read-only `infer` calls, and
//! hands the handle back to `unload` when the instance is removed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Device;
use crate::error::BackendResult;

/// Opaque handle to a model loaded by a backend.
///
/// Cloning is cheap and only shares read access for inference; the owning
/// instance is the one that eventually passes the handle to
/// [`InferenceBackend::unload`].
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ModelHandle {
    /// Wrap a backend-specific model object.
    pub fn new<T: Any + Send + Sync>(model: T) -> Self {
        Self {
            inner: Arc::new(model),
        }
    }

    /// Borrow the backend-specific model object, if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Number of live clones of this handle (owner included).
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("share_count", &self.share_count())
            .finish()
    }
}

/// Parameters passed to [`InferenceBackend::load`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Where the model should be placed
    pub device: Device,
    /// Quantization level (e.g., "q4_0", "q8_0", "f16")
    #[serde(default)]
    pub quantization: Option<String>,
    /// Backend-specific options
    #[serde(default)]
    pub extra_config: HashMap<String, Value>,
}

impl LoadConfig {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            ..Default::default()
        }
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_config.insert(key.into(), value);
        self
    }
}

/// What a successful [`InferenceBackend::load`] returns.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub handle: ModelHandle,
    /// Measured footprint of the loaded model in MB
    pub memory_mb: f64,
}

impl LoadedModel {
    pub fn new(handle: ModelHandle, memory_mb: f64) -> Self {
        Self { handle, memory_mb }
    }
}

/// Backend that owns the actual model runtime.
///
/// Implementations must tolerate concurrent `infer` calls against the same
/// handle; handles are never mutated by the cache.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Load `model_name` and report its memory footprint.
    ///
    /// # Errors
    /// - `LoadFailed`: weights missing, corrupt, or rejected
    /// - `MemoryConstrained` / `Device`: placement could not be satisfied
    async fn load(&self, model_name: &str, config: &LoadConfig) -> BackendResult<LoadedModel>;

    /// Run inference against a loaded model.
    async fn infer(&self, handle: &ModelHandle, inputs: Value) -> BackendResult<Value>;

    /// Release the resources behind `handle`.
    async fn unload(&self, handle: ModelHandle) -> BackendResult<()>;

    /// Best-effort release of allocator caches (e.g. device caching allocators).
    async fn reclaim_memory(&self) -> BackendResult<()> {
        Ok(())
    }
}
