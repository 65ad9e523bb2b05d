//! Instance registry.
//!
//! Authoritative map of instance id → [`ModelInstance`] plus the reverse map
//! caller id → held instance ids. The registry has no lock of its own: the
//! service wraps it in a single mutex and every multi-step cascade (remove
//! → detach holders → subtract memory) runs under one guard.

use std::collections::{HashMap, HashSet};

use modelshare_kernel::ModelHandle;
use serde::Serialize;
use tracing::debug;

use crate::instance::ModelInstance;
use crate::stats::HostMemory;

/// Cumulative cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    /// Acquires satisfied by an existing instance
    pub hits: u64,
    /// Acquires that created a new placeholder
    pub misses: u64,
    /// Acquires soft-rejected for lack of capacity
    pub rejections: u64,
    /// Instances removed by an eviction policy
    pub evictions: u64,
    /// Backend load failures
    pub load_failures: u64,
    /// Uncommitted placeholders reclaimed after their caller gave up or the
    /// loading timeout passed
    pub abandoned_placeholders: u64,
}

/// Per-caller usage history.
#[derive(Debug, Clone)]
pub(crate) struct UsageRecord {
    pub(crate) first_access_ms: u64,
    pub(crate) last_access_ms: u64,
    pub(crate) access_count: u64,
    pub(crate) instances_used: HashSet<String>,
}

/// What is left of an instance after the registry dropped it.
///
/// The handle must still be passed to the backend's `unload`.
#[derive(Debug)]
pub struct RemovedInstance {
    pub instance_id: String,
    pub model_name: String,
    pub handle: Option<ModelHandle>,
    pub memory_mb: f64,
    pub was_loading: bool,
    /// Callers detached by the removal cascade
    pub detached_holders: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    instances: HashMap<String, ModelInstance>,
    sessions: HashMap<String, HashSet<String>>,
    usage: HashMap<String, UsageRecord>,
    counters: CacheCounters,
    total_memory_mb: f64,
    peak_memory_mb: f64,
    next_seq: u64,
    host_memory: Option<HostMemory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Sum of footprints of committed instances (MB).
    pub fn total_memory_mb(&self) -> f64 {
        self.total_memory_mb
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    pub(crate) fn counters_mut(&mut self) -> &mut CacheCounters {
        &mut self.counters
    }

    pub fn get(&self, instance_id: &str) -> Option<&ModelInstance> {
        self.instances.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ModelInstance> {
        self.instances.values()
    }

    /// Instance ids held by `caller_id`, if it holds any.
    pub fn session(&self, caller_id: &str) -> Option<&HashSet<String>> {
        self.sessions.get(caller_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn usage(&self) -> impl Iterator<Item = (&String, &UsageRecord)> {
        self.usage.iter()
    }

    pub(crate) fn host_memory(&self) -> Option<HostMemory> {
        self.host_memory
    }

    pub(crate) fn record_host_memory(&mut self, sample: HostMemory) {
        self.host_memory = Some(sample);
    }

    pub(crate) fn insert(&mut self, mut instance: ModelInstance) {
        let seq = self.bump_seq();
        instance.created_seq = seq;
        instance.last_access_seq = seq;
        debug!(
            instance_id = %instance.instance_id,
            model = %instance.model_name,
            mode = %instance.share_mode,
            "registered placeholder instance"
        );
        self.instances.insert(instance.instance_id.clone(), instance);
    }

    /// An instance of `model_name` the caller already holds that still has a
    /// free holder slot.
    pub(crate) fn find_held_by(&self, caller_id: &str, model_name: &str) -> Option<String> {
        let held = self.sessions.get(caller_id)?;
        held.iter()
            .filter_map(|id| self.instances.get(id))
            .filter(|inst| inst.model_name == model_name && !inst.loading)
            .filter(|inst| inst.has_spare_capacity())
            .min_by_key(|inst| inst.created_seq)
            .map(|inst| inst.instance_id.clone())
    }

    /// First committed instance of `model_name`, in insertion order, with a
    /// free holder slot and a share mode that admits another caller.
    pub(crate) fn find_shareable(&self, model_name: &str, allow_dynamic: bool) -> Option<String> {
        self.instances
            .values()
            .filter(|inst| inst.model_name == model_name && !inst.loading)
            .filter(|inst| inst.has_spare_capacity())
            .filter(|inst| {
                inst.share_mode.is_shareable()
                    || (allow_dynamic && inst.share_mode == modelshare_kernel::ShareMode::Dynamic)
            })
            .min_by_key(|inst| inst.created_seq)
            .map(|inst| inst.instance_id.clone())
    }

    /// Register `caller_id` as a holder of a committed instance.
    ///
    /// Returns `false` when the instance is missing, still loading, or full.
    pub(crate) fn attach(
        &mut self,
        instance_id: &str,
        caller_id: &str,
        now_ms: u64,
        track_usage: bool,
    ) -> bool {
        let seq = self.bump_seq();
        let Some(inst) = self.instances.get_mut(instance_id) else {
            return false;
        };
        if inst.loading || !inst.has_spare_capacity() {
            return false;
        }

        inst.holders.insert(caller_id.to_string());
        inst.touch(now_ms, seq);

        self.sessions
            .entry(caller_id.to_string())
            .or_default()
            .insert(instance_id.to_string());

        if track_usage {
            let record = self
                .usage
                .entry(caller_id.to_string())
                .or_insert_with(|| UsageRecord {
                    first_access_ms: now_ms,
                    last_access_ms: now_ms,
                    access_count: 0,
                    instances_used: HashSet::new(),
                });
            record.last_access_ms = now_ms;
            record.access_count += 1;
            record.instances_used.insert(instance_id.to_string());
        }
        true
    }

    /// Remove `caller_id` from an instance's holders. Idempotent.
    ///
    /// Returns `true` when something changed.
    pub(crate) fn detach(&mut self, instance_id: &str, caller_id: &str, now_ms: u64) -> bool {
        let mut changed = false;
        if let Some(inst) = self.instances.get_mut(instance_id) {
            if inst.holders.remove(caller_id) {
                inst.last_accessed_ms = now_ms;
                changed = true;
            }
        }
        if let Some(held) = self.sessions.get_mut(caller_id) {
            changed |= held.remove(instance_id);
            if held.is_empty() {
                self.sessions.remove(caller_id);
            }
        }
        changed
    }

    /// Bump the access time of an instance used for inference.
    pub(crate) fn touch(&mut self, instance_id: &str, now_ms: u64) {
        let seq = self.bump_seq();
        if let Some(inst) = self.instances.get_mut(instance_id) {
            inst.last_accessed_ms = now_ms;
            inst.last_access_seq = seq;
        }
    }

    /// Finalize a loading placeholder. The caller has verified that the
    /// instance exists and is loading.
    ///
    /// Returns the caller the placeholder was reserved for.
    pub(crate) fn commit(
        &mut self,
        instance_id: &str,
        handle: ModelHandle,
        memory_mb: f64,
        now_ms: u64,
    ) -> Option<String> {
        let inst = self.instances.get_mut(instance_id)?;
        debug_assert!(inst.loading, "commit of non-loading instance {instance_id}");
        inst.handle = Some(handle);
        inst.memory_mb = memory_mb.max(0.0);
        inst.loading = false;
        inst.last_accessed_ms = now_ms;
        let reserved = inst.reserved_for.take();

        self.total_memory_mb += inst.memory_mb;
        self.peak_memory_mb = self.peak_memory_mb.max(self.total_memory_mb);
        reserved
    }

    /// Drop an instance and cascade: detach every holder, subtract its
    /// footprint once if it was committed, and return the handle.
    pub(crate) fn remove(&mut self, instance_id: &str) -> Option<RemovedInstance> {
        let inst = self.instances.remove(instance_id)?;

        let mut detached: Vec<String> = inst.holders.iter().cloned().collect();
        detached.sort();
        for caller_id in &detached {
            if let Some(held) = self.sessions.get_mut(caller_id) {
                held.remove(instance_id);
                if held.is_empty() {
                    self.sessions.remove(caller_id);
                }
            }
        }

        if !inst.loading {
            self.total_memory_mb = (self.total_memory_mb - inst.memory_mb).max(0.0);
        }
        if self.instances.is_empty() {
            // Clear accumulated float error once nothing is resident
            self.total_memory_mb = 0.0;
        }

        Some(RemovedInstance {
            instance_id: inst.instance_id,
            model_name: inst.model_name,
            handle: inst.handle,
            memory_mb: inst.memory_mb,
            was_loading: inst.loading,
            detached_holders: detached,
        })
    }

    /// Remove every instance regardless of holders, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<RemovedInstance> {
        let mut ids: Vec<(u64, String)> = self
            .instances
            .values()
            .map(|inst| (inst.created_seq, inst.instance_id.clone()))
            .collect();
        ids.sort();
        let removed: Vec<RemovedInstance> =
            ids.into_iter().filter_map(|(_, id)| self.remove(&id)).collect();
        self.sessions.clear();
        removed
    }

    /// Mark a loading placeholder as given up by its caller. The next
    /// eviction pass removes it whatever its age.
    pub(crate) fn abandon(&mut self, instance_id: &str) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(inst) if inst.loading => {
                inst.abandoned = true;
                inst.reserved_for = None;
                true
            }
            _ => false,
        }
    }

    /// Abandoned loading placeholders, plus any older than `timeout_ms`.
    pub(crate) fn stale_placeholders(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let mut stale: Vec<&ModelInstance> = self
            .instances
            .values()
            .filter(|inst| {
                inst.loading
                    && (inst.abandoned || now_ms.saturating_sub(inst.created_at_ms) >= timeout_ms)
            })
            .collect();
        stale.sort_by_key(|inst| inst.created_seq);
        stale.into_iter().map(|inst| inst.instance_id.clone()).collect()
    }

    /// Drop usage records of callers that hold nothing and have not
    /// acquired anything for `retention_ms`. Returns how many were dropped.
    pub(crate) fn prune_usage(&mut self, now_ms: u64, retention_ms: u64) -> usize {
        let before = self.usage.len();
        let sessions = &self.sessions;
        self.usage.retain(|caller_id, record| {
            sessions.contains_key(caller_id)
                || now_ms.saturating_sub(record.last_access_ms) < retention_ms
        });
        before - self.usage.len()
    }

    /// Check session symmetry, footprint accounting and the no-empty-session
    /// rule. Returns a description of the first violation found.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (caller_id, held) in &self.sessions {
            if held.is_empty() {
                return Err(format!("caller {caller_id} has an empty session"));
            }
            for instance_id in held {
                let Some(inst) = self.instances.get(instance_id) else {
                    return Err(format!("caller {caller_id} holds missing instance {instance_id}"));
                };
                if !inst.holders.contains(caller_id) {
                    return Err(format!(
                        "caller {caller_id} lists {instance_id} but is not among its holders"
                    ));
                }
            }
        }

        for inst in self.instances.values() {
            for caller_id in &inst.holders {
                let listed = self
                    .sessions
                    .get(caller_id)
                    .is_some_and(|held| held.contains(&inst.instance_id));
                if !listed {
                    return Err(format!(
                        "{caller_id} holds {} but its session does not list it",
                        inst.instance_id
                    ));
                }
            }
            if inst.holders.len() > inst.max_holders {
                return Err(format!("{} exceeds its holder limit", inst.instance_id));
            }
        }

        let committed: f64 = self
            .instances
            .values()
            .filter(|inst| !inst.loading)
            .map(|inst| inst.memory_mb)
            .sum();
        if (committed - self.total_memory_mb).abs() > 1e-6 {
            return Err(format!(
                "aggregate memory {} MB does not match committed sum {} MB",
                self.total_memory_mb, committed
            ));
        }
        Ok(())
    }
}
