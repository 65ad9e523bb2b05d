//! Scriptable in-memory inference backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use modelshare_kernel::{
    BackendError, BackendResult, InferenceBackend, LoadConfig, LoadedModel, ModelHandle,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

#[derive(Debug)]
struct MockModel {
    model_name: String,
    serial: u64,
}

/// A mock backend that implements [`InferenceBackend`].
///
/// Footprints are configurable per model, loads can be made to fail per
/// model or globally, and every loaded handle is tracked until it is
/// unloaded so tests can detect leaks.
pub struct MockBackend {
    default_memory_mb: f64,
    footprints: Mutex<HashMap<String, f64>>,
    failing_models: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
    load_delay: Mutex<Duration>,
    live: Mutex<HashSet<u64>>,
    next_serial: AtomicU64,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    infers: AtomicUsize,
    reclaims: AtomicUsize,
}

impl MockBackend {
    pub fn new(default_memory_mb: f64) -> Self {
        Self {
            default_memory_mb,
            footprints: Mutex::new(HashMap::new()),
            failing_models: Mutex::new(HashSet::new()),
            fail_all: Mutex::new(false),
            load_delay: Mutex::new(Duration::ZERO),
            live: Mutex::new(HashSet::new()),
            next_serial: AtomicU64::new(1),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            infers: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
        }
    }

    /// Footprint reported when `model_name` is loaded.
    pub fn with_footprint(self, model_name: &str, memory_mb: f64) -> Self {
        self.footprints.lock().insert(model_name.to_string(), memory_mb);
        self
    }

    pub fn fail_model(&self, model_name: &str) {
        self.failing_models.lock().insert(model_name.to_string());
    }

    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = delay;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn infer_count(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }

    /// Handles loaded and not yet unloaded.
    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    fn memory_for(&self, model_name: &str) -> f64 {
        self.footprints
            .lock()
            .get(model_name)
            .copied()
            .unwrap_or(self.default_memory_mb)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(500.0)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self, model_name: &str, _config: &LoadConfig) -> BackendResult<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_all.lock() || self.failing_models.lock().contains(model_name) {
            return Err(BackendError::LoadFailed(format!(
                "mock refused to load {model_name}"
            )));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(serial);
        Ok(LoadedModel::new(
            ModelHandle::new(MockModel {
                model_name: model_name.to_string(),
                serial,
            }),
            self.memory_for(model_name),
        ))
    }

    async fn infer(&self, handle: &ModelHandle, inputs: Value) -> BackendResult<Value> {
        self.infers.fetch_add(1, Ordering::SeqCst);
        let model = handle
            .downcast_ref::<MockModel>()
            .ok_or_else(|| BackendError::InvalidHandle("not a mock model".to_string()))?;
        Ok(json!({ "model": model.model_name, "serial": model.serial, "inputs": inputs }))
    }

    async fn unload(&self, handle: ModelHandle) -> BackendResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        if let Some(model) = handle.downcast_ref::<MockModel>() {
            self.live.lock().remove(&model.serial);
        }
        Ok(())
    }

    async fn reclaim_memory(&self) -> BackendResult<()> {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_live_handles() {
        let backend = MockBackend::new(100.0).with_footprint("big", 4096.0);
        let small = backend.load("small", &LoadConfig::default()).await.unwrap();
        let big = backend.load("big", &LoadConfig::default()).await.unwrap();
        assert_eq!(small.memory_mb, 100.0);
        assert_eq!(big.memory_mb, 4096.0);
        assert_eq!(backend.live_handles(), 2);

        backend.unload(small.handle).await.unwrap();
        assert_eq!(backend.live_handles(), 1);
        assert_eq!(backend.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let backend = MockBackend::default();
        backend.fail_model("broken");
        assert!(backend.load("broken", &LoadConfig::default()).await.is_err());
        assert!(backend.load("fine", &LoadConfig::default()).await.is_ok());

        backend.set_fail_all(true);
        assert!(backend.load("fine", &LoadConfig::default()).await.is_err());
        assert_eq!(backend.load_count(), 3);
        assert_eq!(backend.live_handles(), 1);
    }
}
