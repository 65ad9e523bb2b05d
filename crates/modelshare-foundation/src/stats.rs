//! Statistics snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use modelshare_kernel::CachePolicy;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::registry::{CacheCounters, Registry};

/// Number of callers listed in [`SharingStats::top_callers`].
const TOP_CALLERS: usize = 10;

pub(crate) fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Host memory sample taken by the pressure loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostMemory {
    pub total_mb: f64,
    pub available_mb: f64,
}

impl HostMemory {
    pub fn used_fraction(&self) -> f64 {
        if self.total_mb <= 0.0 {
            return 0.0;
        }
        ((self.total_mb - self.available_mb) / self.total_mb).clamp(0.0, 1.0)
    }
}

/// Per-caller usage line in the top-callers table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerUsage {
    pub caller_id: String,
    pub access_count: u64,
    pub instances_used: usize,
    pub active_instances: usize,
    pub first_access: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Advisory scaling hint derived from holder utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingRecommendation {
    /// Ready instances are close to their holder limits
    ScaleUp,
    /// Ready instances are mostly idle
    ScaleDown,
    Steady,
    /// Auto-scaling is disabled in the configuration
    Disabled,
}

impl ScalingRecommendation {
    pub(crate) fn evaluate(registry: &Registry, config: &CacheConfig) -> Self {
        if !config.auto_scale_instances {
            return Self::Disabled;
        }
        let (held, capacity) = registry
            .instances()
            .filter(|inst| !inst.is_loading())
            .fold((0usize, 0usize), |(held, cap), inst| {
                (held + inst.holder_count(), cap + inst.max_holders)
            });
        if capacity == 0 {
            return Self::Steady;
        }
        let utilization = held as f64 / capacity as f64;
        if utilization >= config.scale_up_threshold {
            Self::ScaleUp
        } else if utilization <= config.scale_down_threshold {
            Self::ScaleDown
        } else {
            Self::Steady
        }
    }
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct SharingStats {
    pub total_instances: usize,
    /// Instances with at least one holder
    pub active_instances: usize,
    pub loading_instances: usize,
    pub total_active_holders: usize,
    pub total_memory_mb: f64,
    pub peak_memory_mb: f64,
    /// `total_memory_mb` over the configured budget
    pub memory_utilization: f64,
    pub cache_policy: CachePolicy,
    /// Callers currently holding at least one instance
    pub caller_sessions: usize,
    pub average_holders_per_instance: f64,
    pub instances_by_share_mode: BTreeMap<String, usize>,
    pub top_callers: Vec<CallerUsage>,
    pub counters: CacheCounters,
    /// hits / (hits + misses), 0 before any acquire
    pub hit_rate: f64,
    pub scaling: ScalingRecommendation,
    pub host_memory: Option<HostMemory>,
}

impl SharingStats {
    pub(crate) fn collect(registry: &Registry, config: &CacheConfig) -> Self {
        let total_instances = registry.len();
        let mut active_instances = 0;
        let mut loading_instances = 0;
        let mut total_active_holders = 0;
        let mut instances_by_share_mode = BTreeMap::new();

        for inst in registry.instances() {
            if inst.is_held() {
                active_instances += 1;
            }
            if inst.is_loading() {
                loading_instances += 1;
            }
            total_active_holders += inst.holder_count();
            *instances_by_share_mode
                .entry(inst.share_mode().as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut top_callers: Vec<CallerUsage> = registry
            .usage()
            .map(|(caller_id, record)| CallerUsage {
                caller_id: caller_id.clone(),
                access_count: record.access_count,
                instances_used: record.instances_used.len(),
                active_instances: registry.session(caller_id).map_or(0, |s| s.len()),
                first_access: millis_to_datetime(record.first_access_ms),
                last_access: millis_to_datetime(record.last_access_ms),
            })
            .collect();
        top_callers.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.caller_id.cmp(&b.caller_id))
        });
        top_callers.truncate(TOP_CALLERS);

        let counters = registry.counters();
        let lookups = counters.hits + counters.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            counters.hits as f64 / lookups as f64
        };

        Self {
            total_instances,
            active_instances,
            loading_instances,
            total_active_holders,
            total_memory_mb: registry.total_memory_mb(),
            peak_memory_mb: registry.peak_memory_mb(),
            memory_utilization: registry.total_memory_mb() / config.max_memory_mb(),
            cache_policy: config.cache_policy,
            caller_sessions: registry.session_count(),
            average_holders_per_instance: if total_instances == 0 {
                0.0
            } else {
                total_active_holders as f64 / total_instances as f64
            },
            instances_by_share_mode,
            top_callers,
            counters,
            hit_rate,
            scaling: ScalingRecommendation::evaluate(registry, config),
            host_memory: registry.host_memory(),
        }
    }
}
