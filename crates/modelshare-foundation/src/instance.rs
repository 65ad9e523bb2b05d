//! Model instance records.

use std::collections::HashSet;

use modelshare_kernel::{Device, ModelHandle, ShareMode};
use serde::Serialize;

use crate::stats::millis_to_datetime;

/// One loaded (or loading) copy of a named model.
///
/// Only the [`Registry`](crate::registry::Registry) mutates instances; the
/// backend handle stays inside the record until removal hands it to
/// `unload`.
#[derive(Debug)]
pub struct ModelInstance {
    pub(crate) instance_id: String,
    pub(crate) model_name: String,
    pub(crate) handle: Option<ModelHandle>,
    pub(crate) device: Device,
    pub(crate) memory_mb: f64,
    pub(crate) created_at_ms: u64,
    pub(crate) last_accessed_ms: u64,
    pub(crate) access_count: u64,
    /// Registry-wide insertion order, used to break ties
    pub(crate) created_seq: u64,
    /// Registry-wide access order, used to break LRU ties
    pub(crate) last_access_seq: u64,
    pub(crate) holders: HashSet<String>,
    pub(crate) max_holders: usize,
    pub(crate) share_mode: ShareMode,
    pub(crate) loading: bool,
    /// Caller whose `acquire` created this placeholder
    pub(crate) reserved_for: Option<String>,
    /// The reserving caller stopped waiting for the load
    pub(crate) abandoned: bool,
}

impl ModelInstance {
    /// A fresh placeholder in loading state with no footprint yet.
    pub(crate) fn placeholder(
        instance_id: String,
        model_name: &str,
        share_mode: ShareMode,
        device: Device,
        max_holders: usize,
        reserved_for: &str,
        now_ms: u64,
    ) -> Self {
        Self {
            instance_id,
            model_name: model_name.to_string(),
            handle: None,
            device,
            memory_mb: 0.0,
            created_at_ms: now_ms,
            last_accessed_ms: now_ms,
            access_count: 0,
            created_seq: 0,
            last_access_seq: 0,
            holders: HashSet::new(),
            max_holders: match share_mode {
                ShareMode::Exclusive => 1,
                _ => max_holders,
            },
            share_mode,
            loading: true,
            reserved_for: Some(reserved_for.to_string()),
            abandoned: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_mb
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn last_accessed_ms(&self) -> u64 {
        self.last_accessed_ms
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn share_mode(&self) -> ShareMode {
        self.share_mode
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub fn is_held(&self) -> bool {
        !self.holders.is_empty()
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.holders.len() < self.max_holders
    }

    /// Unheld and committed: the only state any eviction policy may touch.
    pub fn is_evictable(&self) -> bool {
        !self.is_held() && !self.loading
    }

    /// Idle time relative to `now_ms`, saturating at zero.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_accessed_ms)
    }

    pub(crate) fn touch(&mut self, now_ms: u64, seq: u64) {
        self.last_accessed_ms = now_ms;
        self.last_access_seq = seq;
        self.access_count += 1;
    }

    pub(crate) fn info(&self) -> InstanceInfo {
        let mut holders: Vec<String> = self.holders.iter().cloned().collect();
        holders.sort();
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            model_name: self.model_name.clone(),
            device: self.device,
            memory_mb: self.memory_mb,
            created_at: millis_to_datetime(self.created_at_ms),
            last_accessed: millis_to_datetime(self.last_accessed_ms),
            access_count: self.access_count,
            holders,
            max_holders: self.max_holders,
            share_mode: self.share_mode,
            loading: self.loading,
        }
    }
}

/// Read-only snapshot of an instance for callers and API layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub model_name: String,
    pub device: Device,
    pub memory_mb: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
    pub holders: Vec<String>,
    pub max_holders: usize,
    pub share_mode: ShareMode,
    pub loading: bool,
}
