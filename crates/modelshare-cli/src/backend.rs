//! In-process backend used by `modelshare simulate`.
//!
//! Loads sleep for a fixed delay, fail with a configurable probability and
//! report a footprint derived from the model name, so repeated runs with
//! the same seed produce the same statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use modelshare_kernel::{
    BackendError, BackendResult, InferenceBackend, LoadConfig, LoadedModel, ModelHandle,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tracing::debug;

/// Payload stored behind each simulated handle
#[derive(Debug)]
struct SimulatedModel {
    name: String,
    serial: u64,
}

pub struct SimulatedBackend {
    load_delay: Duration,
    fail_rate: f64,
    rng: Mutex<StdRng>,
    next_serial: AtomicU64,
    unloads: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(load_delay: Duration, fail_rate: f64, seed: u64) -> Self {
        Self {
            load_delay,
            fail_rate: fail_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            next_serial: AtomicU64::new(1),
            unloads: AtomicU64::new(0),
        }
    }

    /// Footprint between 512 MB and 2.25 GB, fixed per model name.
    pub fn footprint_mb(model_name: &str) -> f64 {
        let hash = model_name
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let bucket = hash % 8;
        512.0 + bucket as f64 * 256.0
    }

    pub fn unload_count(&self) -> u64 {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn load(&self, model_name: &str, config: &LoadConfig) -> BackendResult<LoadedModel> {
        tokio::time::sleep(self.load_delay).await;
        let failed = self.rng.lock().gen_bool(self.fail_rate);
        if failed {
            return Err(BackendError::LoadFailed(format!(
                "simulated failure loading {model_name}"
            )));
        }
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        debug!(model = model_name, device = %config.device, serial, "simulated load");
        Ok(LoadedModel::new(
            ModelHandle::new(SimulatedModel {
                name: model_name.to_string(),
                serial,
            }),
            Self::footprint_mb(model_name),
        ))
    }

    async fn infer(&self, handle: &ModelHandle, inputs: Value) -> BackendResult<Value> {
        let model = handle
            .downcast_ref::<SimulatedModel>()
            .ok_or_else(|| BackendError::InvalidHandle("not a simulated model".to_string()))?;
        Ok(json!({
            "model": model.name,
            "serial": model.serial,
            "input": inputs,
        }))
    }

    async fn unload(&self, _handle: ModelHandle) -> BackendResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
