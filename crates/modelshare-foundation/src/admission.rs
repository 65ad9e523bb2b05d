//! Admission control: reuse an instance, reserve a new one, or reject.
//!
//! Everything here runs under the service's registry lock and never awaits.

use modelshare_kernel::{Device, ShareMode};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::eviction::EvictionEngine;
use crate::instance::ModelInstance;
use crate::registry::{Registry, RemovedInstance};

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The caller was attached to a committed instance
    Reused {
        instance_id: String,
        /// The caller already held this instance
        fast_path: bool,
    },
    /// A loading placeholder was created for the caller
    Reserved { instance_id: String },
    /// No capacity, even after one eviction pass
    Rejected,
}

impl AdmissionDecision {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Reused { instance_id, .. } | Self::Reserved { instance_id } => Some(instance_id),
            Self::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmissionRequest<'a> {
    pub model_name: &'a str,
    pub caller_id: &'a str,
    pub share_mode: ShareMode,
    pub force_new: bool,
}

pub(crate) struct AdmissionController<'a> {
    pub config: &'a CacheConfig,
    pub engine: &'a EvictionEngine,
    pub device: Device,
}

impl AdmissionController<'_> {
    /// Room for one more placeholder.
    pub(crate) fn has_capacity(&self, registry: &Registry) -> bool {
        registry.len() < self.config.max_instances
            && registry.total_memory_mb() < self.config.max_memory_mb()
    }

    /// At a hard limit or above the scale-up utilization.
    pub(crate) fn under_load(&self, registry: &Registry) -> bool {
        let max_mb = self.config.max_memory_mb();
        !self.has_capacity(registry)
            || registry.total_memory_mb() / max_mb >= self.config.scale_up_threshold
    }

    /// Dynamic instances share only while the pool is under load. Without
    /// auto-scaling they behave like shared ones.
    fn dynamic_shareable(&self, registry: &Registry) -> bool {
        !self.config.auto_scale_instances || self.under_load(registry)
    }

    pub(crate) fn admit(
        &self,
        registry: &mut Registry,
        request: AdmissionRequest<'_>,
        now_ms: u64,
    ) -> (AdmissionDecision, Vec<RemovedInstance>) {
        let track = self.config.enable_usage_tracking;
        let AdmissionRequest {
            model_name,
            caller_id,
            share_mode,
            force_new,
        } = request;

        if !force_new {
            if let Some(instance_id) = registry.find_held_by(caller_id, model_name) {
                if registry.attach(&instance_id, caller_id, now_ms, track) {
                    registry.counters_mut().hits += 1;
                    debug!(instance_id = %instance_id, caller_id, "caller re-acquired held instance");
                    return (
                        AdmissionDecision::Reused {
                            instance_id,
                            fast_path: true,
                        },
                        Vec::new(),
                    );
                }
            }
        }

        let allow_dynamic = self.dynamic_shareable(registry);
        if let Some(instance_id) = registry.find_shareable(model_name, allow_dynamic) {
            if registry.attach(&instance_id, caller_id, now_ms, track) {
                registry.counters_mut().hits += 1;
                debug!(instance_id = %instance_id, caller_id, "attached caller to shared instance");
                return (
                    AdmissionDecision::Reused {
                        instance_id,
                        fast_path: false,
                    },
                    Vec::new(),
                );
            }
        }

        let mut evicted = Vec::new();
        if !self.has_capacity(registry) {
            debug!(
                model = model_name,
                instances = registry.len(),
                memory_mb = registry.total_memory_mb(),
                "at capacity, running eviction"
            );
            evicted = self.engine.run(registry, now_ms);
            if !self.has_capacity(registry) {
                registry.counters_mut().rejections += 1;
                info!(model = model_name, caller_id, "admission rejected: no capacity");
                return (AdmissionDecision::Rejected, evicted);
            }
        }

        let instance_id = new_instance_id(model_name, now_ms);
        registry.insert(ModelInstance::placeholder(
            instance_id.clone(),
            model_name,
            share_mode,
            self.device,
            self.config.max_holders_per_instance,
            caller_id,
            now_ms,
        ));
        registry.counters_mut().misses += 1;
        info!(
            instance_id = %instance_id,
            model = model_name,
            caller_id,
            mode = %share_mode,
            "reserved new instance"
        );
        (AdmissionDecision::Reserved { instance_id }, evicted)
    }
}

fn new_instance_id(model_name: &str, now_ms: u64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", model_name, now_ms, &suffix[..8])
}
