//! The model sharing service.
//!
//! One [`ModelSharingService`] owns the registry, the eviction engine and the
//! background monitor loops. It is cheaply cloneable; every clone shares the
//! same state.
//!
//! Locking discipline: the registry sits behind a single
//! `parking_lot::Mutex`. The guard is always dropped before any backend call
//! or other `.await`, so handles removed under the lock are unloaded after it
//! is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use modelshare_kernel::{
    Clock, Device, InferenceBackend, LoadConfig, ModelHandle, ShareMode, SystemClock,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionRequest};
use crate::config::CacheConfig;
use crate::error::{ShareError, ShareResult};
use crate::eviction::EvictionEngine;
use crate::instance::InstanceInfo;
use crate::lease::InstanceLease;
use crate::monitor;
use crate::registry::{Registry, RemovedInstance};
use crate::stats::{HostMemory, SharingStats};

pub(crate) struct ServiceInner {
    config: CacheConfig,
    backend: Arc<dyn InferenceBackend>,
    clock: Arc<dyn Clock>,
    load_config: LoadConfig,
    device: Device,
    engine: EvictionEngine,
    registry: Mutex<Registry>,
    is_running: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared model instance cache with admission control and eviction.
#[derive(Clone)]
pub struct ModelSharingService {
    inner: Arc<ServiceInner>,
}

/// Builder for [`ModelSharingService`].
pub struct ModelSharingServiceBuilder {
    config: CacheConfig,
    backend: Arc<dyn InferenceBackend>,
    clock: Arc<dyn Clock>,
    load_config: Option<LoadConfig>,
}

impl ModelSharingServiceBuilder {
    /// Use a custom clock for every timestamp.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Default parameters for backend `load` calls.
    pub fn load_config(mut self, load_config: LoadConfig) -> Self {
        self.load_config = Some(load_config);
        self
    }

    pub fn build(self) -> ShareResult<ModelSharingService> {
        self.config.validate()?;
        let device = self.config.resolve_device();
        let load_config = self.load_config.unwrap_or_else(|| LoadConfig::new(device));
        let engine = EvictionEngine::new(&self.config);

        info!(
            backend = self.backend.name(),
            device = %device,
            policy = %self.config.cache_policy,
            max_instances = self.config.max_instances,
            max_memory_gb = self.config.max_memory_gb,
            "model sharing service created"
        );

        Ok(ModelSharingService {
            inner: Arc::new(ServiceInner {
                config: self.config,
                backend: self.backend,
                clock: self.clock,
                load_config,
                device,
                engine,
                registry: Mutex::new(Registry::new()),
                is_running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl ModelSharingService {
    pub fn builder(config: CacheConfig, backend: Arc<dyn InferenceBackend>) -> ModelSharingServiceBuilder {
        ModelSharingServiceBuilder {
            config,
            backend,
            clock: Arc::new(SystemClock),
            load_config: None,
        }
    }

    pub fn new(config: CacheConfig, backend: Arc<dyn InferenceBackend>) -> ShareResult<Self> {
        Self::builder(config, backend).build()
    }

    pub(crate) fn from_inner(inner: Arc<ServiceInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ServiceInner> {
        Arc::downgrade(&self.inner)
    }

    fn now_ms(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    fn ensure_accepting(&self) -> ShareResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ShareError::ShuttingDown);
        }
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Placement used for new instances.
    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Spawn the cleanup and memory pressure loops. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            warn!("model sharing service has been stopped and cannot restart");
            return;
        }
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            warn!("model sharing service is already running");
            return;
        }

        let handles = monitor::spawn_loops(self, self.inner.cancel.child_token());
        self.inner.background.lock().extend(handles);

        info!(
            cleanup_interval_minutes = self.inner.config.cleanup_interval_minutes,
            memory_monitoring = self.inner.config.enable_memory_monitoring,
            "model sharing service started"
        );
    }

    /// Stop the loops and remove every instance, held or not.
    ///
    /// Safe to call without `start()` and more than once.
    pub async fn stop(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("model sharing service already stopped");
            return;
        }
        info!("model sharing service shutting down...");

        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "monitor task ended abnormally");
            }
        }

        let drained = {
            let mut registry = self.inner.registry.lock();
            registry.drain()
        };
        let count = drained.len();
        self.unload_removed(drained).await;

        self.inner.is_running.store(false, Ordering::SeqCst);
        info!(instances = count, "model sharing service shutdown complete");
    }

    async fn admit(
        &self,
        model_name: &str,
        caller_id: &str,
        share_mode: ShareMode,
        force_new: bool,
    ) -> ShareResult<AdmissionDecision> {
        self.ensure_accepting()?;
        let now = self.now_ms();
        let (decision, evicted) = {
            let mut registry = self.inner.registry.lock();
            let controller = AdmissionController {
                config: &self.inner.config,
                engine: &self.inner.engine,
                device: self.inner.device,
            };
            controller.admit(
                &mut registry,
                AdmissionRequest {
                    model_name,
                    caller_id,
                    share_mode,
                    force_new,
                },
                now,
            )
        };
        self.unload_removed(evicted).await;
        Ok(decision)
    }

    /// Get an instance of `model_name` for `caller_id`.
    ///
    /// Returns the id of a reused instance (the caller is already a holder)
    /// or of a new loading placeholder that the caller must load and
    /// [`commit_instance`](Self::commit_instance). `Ok(None)` means no
    /// capacity was available even after one eviction pass.
    ///
    /// `force_new` skips only the reuse of instances the caller already
    /// holds; shared instances are still offered.
    pub async fn acquire(
        &self,
        model_name: &str,
        caller_id: &str,
        share_mode: ShareMode,
        force_new: bool,
    ) -> ShareResult<Option<String>> {
        let decision = self.admit(model_name, caller_id, share_mode, force_new).await?;
        Ok(decision.instance_id().map(str::to_string))
    }

    /// Finalize a loading placeholder with the handle the caller loaded.
    ///
    /// The caller that reserved the placeholder becomes its first holder.
    /// When the placeholder is gone or already committed the handle is
    /// unloaded and an error returned.
    pub async fn commit_instance(
        &self,
        instance_id: &str,
        handle: ModelHandle,
        memory_mb: f64,
    ) -> ShareResult<()> {
        let now = self.now_ms();
        let outcome = {
            let mut registry = self.inner.registry.lock();
            match registry.get(instance_id).map(|inst| inst.is_loading()) {
                None => Err(ShareError::InstanceNotFound(instance_id.to_string())),
                Some(false) => Err(ShareError::NotLoading(instance_id.to_string())),
                Some(true) => {
                    let owner = registry.commit(instance_id, handle.clone(), memory_mb, now);
                    if let Some(owner) = &owner {
                        registry.attach(
                            instance_id,
                            owner,
                            now,
                            self.inner.config.enable_usage_tracking,
                        );
                    }
                    Ok(owner)
                }
            }
        };

        match outcome {
            Ok(owner) => {
                info!(
                    instance_id,
                    memory_mb,
                    caller_id = owner.as_deref().unwrap_or("-"),
                    "instance committed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(instance_id, error = %e, "commit rejected, unloading orphaned handle");
                if let Err(unload_err) = self.inner.backend.unload(handle).await {
                    error!(instance_id, error = %unload_err, "failed to unload orphaned handle");
                }
                Err(e)
            }
        }
    }

    /// Load a reserved placeholder through the backend and commit it.
    ///
    /// On failure the placeholder is purged and `LoadFailed` returned.
    pub async fn load_instance(
        &self,
        instance_id: &str,
        load_config: Option<&LoadConfig>,
    ) -> ShareResult<()> {
        let model_name = {
            let registry = self.inner.registry.lock();
            match registry.get(instance_id) {
                None => return Err(ShareError::InstanceNotFound(instance_id.to_string())),
                Some(inst) if !inst.is_loading() => {
                    return Err(ShareError::NotLoading(instance_id.to_string()));
                }
                Some(inst) => inst.model_name().to_string(),
            }
        };

        let load_config = load_config.unwrap_or(&self.inner.load_config);
        debug!(instance_id, model = %model_name, backend = self.inner.backend.name(), "loading model");

        match self.inner.backend.load(&model_name, load_config).await {
            Ok(loaded) => {
                self.commit_instance(instance_id, loaded.handle, loaded.memory_mb)
                    .await
            }
            Err(source) => {
                {
                    let mut registry = self.inner.registry.lock();
                    registry.counters_mut().load_failures += 1;
                    registry.remove(instance_id);
                }
                error!(instance_id, model = %model_name, error = %source, "model load failed");
                Err(ShareError::LoadFailed { model_name, source })
            }
        }
    }

    /// Purge a loading placeholder whose load failed outside the service.
    pub fn abort_instance(&self, instance_id: &str) -> ShareResult<()> {
        let mut registry = self.inner.registry.lock();
        match registry.get(instance_id).map(|inst| inst.is_loading()) {
            None => Err(ShareError::InstanceNotFound(instance_id.to_string())),
            Some(false) => Err(ShareError::NotLoading(instance_id.to_string())),
            Some(true) => {
                registry.counters_mut().load_failures += 1;
                registry.remove(instance_id);
                warn!(instance_id, "loading instance aborted");
                Ok(())
            }
        }
    }

    /// [`acquire`](Self::acquire), then load the placeholder if one was
    /// reserved. The returned instance is ready for inference.
    ///
    /// Dropping the future while the load is in flight abandons the
    /// placeholder; the next eviction pass removes it.
    pub async fn acquire_ready(
        &self,
        model_name: &str,
        caller_id: &str,
        share_mode: ShareMode,
        force_new: bool,
    ) -> ShareResult<Option<String>> {
        match self.admit(model_name, caller_id, share_mode, force_new).await? {
            AdmissionDecision::Rejected => Ok(None),
            AdmissionDecision::Reused { instance_id, .. } => Ok(Some(instance_id)),
            AdmissionDecision::Reserved { instance_id } => {
                let pending = PendingLoad::new(self, &instance_id);
                let loaded = self.load_instance(&instance_id, None).await;
                pending.finish();
                loaded?;
                Ok(Some(instance_id))
            }
        }
    }

    /// [`acquire_ready`](Self::acquire_ready) wrapped in a guard that
    /// releases the instance when dropped.
    pub async fn lease(
        &self,
        model_name: &str,
        caller_id: &str,
        share_mode: ShareMode,
    ) -> ShareResult<Option<InstanceLease>> {
        let instance_id = self
            .acquire_ready(model_name, caller_id, share_mode, false)
            .await?;
        Ok(instance_id.map(|id| InstanceLease::new(self.clone(), id, caller_id.to_string())))
    }

    /// Drop `caller_id` from the holders of `instance_id`.
    ///
    /// Idempotent and never fails; returns whether anything changed. The
    /// instance stays resident until an eviction policy picks it.
    pub fn release(&self, instance_id: &str, caller_id: &str) -> bool {
        let now = self.now_ms();
        let changed = self.inner.registry.lock().detach(instance_id, caller_id, now);
        if changed {
            debug!(instance_id, caller_id, "instance released");
        }
        changed
    }

    /// Run inference on an instance the caller holds.
    pub async fn infer(&self, instance_id: &str, caller_id: &str, inputs: Value) -> ShareResult<Value> {
        let now = self.now_ms();
        let handle = {
            let mut registry = self.inner.registry.lock();
            let inst = registry
                .get(instance_id)
                .ok_or_else(|| ShareError::InstanceNotFound(instance_id.to_string()))?;
            if inst.is_loading() {
                return Err(ShareError::StillLoading(instance_id.to_string()));
            }
            if !inst.holders.contains(caller_id) {
                return Err(ShareError::NotHolder {
                    instance_id: instance_id.to_string(),
                    caller_id: caller_id.to_string(),
                });
            }
            let handle = inst
                .handle
                .clone()
                .ok_or_else(|| ShareError::StillLoading(instance_id.to_string()))?;
            registry.touch(instance_id, now);
            handle
        };
        Ok(self.inner.backend.infer(&handle, inputs).await?)
    }

    /// One eviction pass with the configured policy. Returns the number of
    /// instances removed.
    pub async fn run_eviction(&self) -> usize {
        let now = self.now_ms();
        let removed = {
            let mut registry = self.inner.registry.lock();
            self.inner.engine.run(&mut registry, now)
        };
        let count = removed.len();
        self.unload_removed(removed).await;
        count
    }

    /// Ask the backend to release cached allocations.
    pub async fn reclaim_memory(&self) -> ShareResult<()> {
        self.inner.backend.reclaim_memory().await?;
        Ok(())
    }

    /// Evict once if aggregate memory is above the pressure threshold.
    /// Returns the number of instances removed.
    pub async fn check_memory_pressure(&self) -> usize {
        let (total, limit) = {
            let registry = self.inner.registry.lock();
            (
                registry.total_memory_mb(),
                self.inner.config.max_memory_mb() * self.inner.config.pressure_threshold,
            )
        };
        if total <= limit {
            return 0;
        }
        warn!(
            total_memory_mb = total,
            threshold_mb = limit,
            "memory pressure detected, evicting"
        );
        self.run_eviction().await
    }

    pub(crate) fn record_host_memory(&self, sample: HostMemory) {
        self.inner.registry.lock().record_host_memory(sample);
    }

    pub fn stats(&self) -> SharingStats {
        let registry = self.inner.registry.lock();
        SharingStats::collect(&registry, &self.inner.config)
    }

    pub fn instance_info(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.inner.registry.lock().get(instance_id).map(|inst| inst.info())
    }

    /// Every instance, oldest first.
    pub fn list_instances(&self) -> Vec<InstanceInfo> {
        let registry = self.inner.registry.lock();
        let mut instances: Vec<_> = registry.instances().collect();
        instances.sort_by_key(|inst| inst.created_seq);
        instances.into_iter().map(|inst| inst.info()).collect()
    }

    /// Sorted holders of an instance, `None` if it does not exist.
    pub fn holders(&self, instance_id: &str) -> Option<Vec<String>> {
        let registry = self.inner.registry.lock();
        let inst = registry.get(instance_id)?;
        let mut holders: Vec<String> = inst.holders.iter().cloned().collect();
        holders.sort();
        Some(holders)
    }

    /// Sorted ids of the instances a caller holds.
    pub fn caller_instances(&self, caller_id: &str) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut ids: Vec<String> = registry
            .session(caller_id)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn total_memory_mb(&self) -> f64 {
        self.inner.registry.lock().total_memory_mb()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Cross-check holder sets, caller sessions and memory accounting.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.inner.registry.lock().check_consistency()
    }

    async fn unload_removed(&self, removed: Vec<RemovedInstance>) {
        if removed.is_empty() {
            return;
        }
        let backend = &self.inner.backend;
        let unloads = removed.into_iter().filter_map(|gone| {
            let handle = gone.handle?;
            let instance_id = gone.instance_id;
            Some(async move {
                if let Err(e) = backend.unload(handle).await {
                    error!(instance_id = %instance_id, error = %e, "failed to unload instance");
                } else {
                    debug!(instance_id = %instance_id, "instance unloaded");
                }
            })
        });
        join_all(unloads).await;
        if let Err(e) = backend.reclaim_memory().await {
            warn!(error = %e, "backend memory reclamation failed");
        }
    }
}

/// Marks a placeholder abandoned if its loading future is dropped early.
struct PendingLoad<'a> {
    service: &'a ModelSharingService,
    instance_id: &'a str,
    done: bool,
}

impl<'a> PendingLoad<'a> {
    fn new(service: &'a ModelSharingService, instance_id: &'a str) -> Self {
        Self {
            service,
            instance_id,
            done: false,
        }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.service.inner.registry.lock().abandon(self.instance_id) {
            warn!(instance_id = self.instance_id, "caller gave up waiting for load");
        }
    }
}

impl std::fmt::Debug for ModelSharingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSharingService")
            .field("backend", &self.inner.backend.name())
            .field("device", &self.inner.device)
            .field("policy", &self.inner.config.cache_policy)
            .field("running", &self.is_running())
            .finish()
    }
}
