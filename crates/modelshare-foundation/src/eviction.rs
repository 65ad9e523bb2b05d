//! Eviction policies and the engine that applies them.
//!
//! A strategy only ranks candidates; the [`EvictionEngine`] filters the
//! candidate set down to unheld, committed instances before asking, and
//! re-checks each pick before removal.

use std::cmp::Ordering;

use modelshare_kernel::CachePolicy;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, EvictionTuning};
use crate::instance::ModelInstance;
use crate::registry::{Registry, RemovedInstance};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Ranks evictable instances and picks which ones to remove.
pub trait EvictionStrategy: Send + Sync {
    fn policy(&self) -> CachePolicy;

    /// Ids to evict, in eviction order. Every candidate is unheld and
    /// committed.
    fn select(&self, candidates: &[&ModelInstance], now_ms: u64) -> Vec<String>;
}

fn take_ids(sorted: Vec<&ModelInstance>, limit: usize) -> Vec<String> {
    sorted
        .into_iter()
        .take(limit)
        .map(|inst| inst.instance_id.clone())
        .collect()
}

/// Least recently accessed first.
#[derive(Debug, Clone)]
pub struct LruStrategy {
    pub batch_size: usize,
}

impl EvictionStrategy for LruStrategy {
    fn policy(&self) -> CachePolicy {
        CachePolicy::Lru
    }

    fn select(&self, candidates: &[&ModelInstance], _now_ms: u64) -> Vec<String> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by_key(|inst| (inst.last_accessed_ms, inst.last_access_seq));
        take_ids(sorted, self.batch_size)
    }
}

/// Least frequently accessed first.
#[derive(Debug, Clone)]
pub struct LfuStrategy {
    pub batch_size: usize,
}

impl EvictionStrategy for LfuStrategy {
    fn policy(&self) -> CachePolicy {
        CachePolicy::Lfu
    }

    fn select(&self, candidates: &[&ModelInstance], _now_ms: u64) -> Vec<String> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by_key(|inst| (inst.access_count, inst.created_seq));
        take_ids(sorted, self.batch_size)
    }
}

/// Oldest creation first.
#[derive(Debug, Clone)]
pub struct FifoStrategy {
    pub batch_size: usize,
}

impl EvictionStrategy for FifoStrategy {
    fn policy(&self) -> CachePolicy {
        CachePolicy::Fifo
    }

    fn select(&self, candidates: &[&ModelInstance], _now_ms: u64) -> Vec<String> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by_key(|inst| (inst.created_at_ms, inst.created_seq));
        take_ids(sorted, self.batch_size)
    }
}

/// Every instance idle for at least `ttl_ms`. Not batch limited.
#[derive(Debug, Clone)]
pub struct TtlStrategy {
    pub ttl_ms: u64,
}

impl EvictionStrategy for TtlStrategy {
    fn policy(&self) -> CachePolicy {
        CachePolicy::Ttl
    }

    fn select(&self, candidates: &[&ModelInstance], now_ms: u64) -> Vec<String> {
        let mut expired: Vec<&ModelInstance> = candidates
            .iter()
            .copied()
            .filter(|inst| inst.idle_ms(now_ms) >= self.ttl_ms)
            .collect();
        expired.sort_by_key(|inst| inst.created_seq);
        take_ids(expired, usize::MAX)
    }
}

/// Weighted blend of idle time, rarity of use and footprint. Highest score
/// goes first.
#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    pub batch_size: usize,
    pub recency_weight: f64,
    pub frequency_weight: f64,
    pub memory_weight: f64,
}

impl AdaptiveStrategy {
    pub fn from_tuning(tuning: &EvictionTuning) -> Self {
        Self {
            batch_size: tuning.batch_size,
            recency_weight: tuning.recency_weight,
            frequency_weight: tuning.frequency_weight,
            memory_weight: tuning.memory_weight,
        }
    }

    pub fn score(&self, inst: &ModelInstance, now_ms: u64) -> f64 {
        let hours_idle = inst.idle_ms(now_ms) as f64 / MS_PER_HOUR;
        let rarity = 1.0 / (inst.access_count as f64 + 1.0);
        let memory_gb = inst.memory_mb / 1024.0;
        self.recency_weight * hours_idle
            + self.frequency_weight * rarity
            + self.memory_weight * memory_gb
    }
}

impl EvictionStrategy for AdaptiveStrategy {
    fn policy(&self) -> CachePolicy {
        CachePolicy::Adaptive
    }

    fn select(&self, candidates: &[&ModelInstance], now_ms: u64) -> Vec<String> {
        let mut scored: Vec<(f64, &ModelInstance)> = candidates
            .iter()
            .map(|inst| (self.score(inst, now_ms), *inst))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| match sb.total_cmp(sa) {
            Ordering::Equal => a.created_seq.cmp(&b.created_seq),
            other => other,
        });
        take_ids(scored.into_iter().map(|(_, inst)| inst).collect(), self.batch_size)
    }
}

/// Build the strategy configured in `config`.
pub fn strategy_for(config: &CacheConfig) -> Box<dyn EvictionStrategy> {
    let batch_size = config.eviction.batch_size;
    match config.cache_policy {
        CachePolicy::Lru => Box::new(LruStrategy { batch_size }),
        CachePolicy::Lfu => Box::new(LfuStrategy { batch_size }),
        CachePolicy::Fifo => Box::new(FifoStrategy { batch_size }),
        CachePolicy::Ttl => Box::new(TtlStrategy {
            ttl_ms: config.ttl_minutes.saturating_mul(60_000),
        }),
        CachePolicy::Adaptive => Box::new(AdaptiveStrategy::from_tuning(&config.eviction)),
    }
}

/// Applies a strategy to the registry.
pub struct EvictionEngine {
    strategy: Box<dyn EvictionStrategy>,
    loading_timeout_ms: u64,
    usage_retention_ms: u64,
}

impl EvictionEngine {
    /// Usage records of idle callers are kept for one TTL.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_strategy(strategy_for(config), config.loading_timeout_secs.saturating_mul(1_000))
            .with_usage_retention_ms(config.ttl_minutes.saturating_mul(60_000))
    }

    /// Engine that never prunes usage records until a retention is set.
    pub fn with_strategy(strategy: Box<dyn EvictionStrategy>, loading_timeout_ms: u64) -> Self {
        Self {
            strategy,
            loading_timeout_ms,
            usage_retention_ms: u64::MAX,
        }
    }

    pub fn with_usage_retention_ms(mut self, retention_ms: u64) -> Self {
        self.usage_retention_ms = retention_ms;
        self
    }

    pub fn policy(&self) -> CachePolicy {
        self.strategy.policy()
    }

    /// One eviction pass: reclaim abandoned placeholders, prune idle usage
    /// records, then apply the policy. Returned instances still need their
    /// handles unloaded.
    pub(crate) fn run(&self, registry: &mut Registry, now_ms: u64) -> Vec<RemovedInstance> {
        let mut removed = Vec::new();

        for instance_id in registry.stale_placeholders(now_ms, self.loading_timeout_ms) {
            if let Some(gone) = registry.remove(&instance_id) {
                warn!(
                    instance_id = %gone.instance_id,
                    model = %gone.model_name,
                    "reclaimed abandoned loading placeholder"
                );
                registry.counters_mut().abandoned_placeholders += 1;
                removed.push(gone);
            }
        }

        let pruned = registry.prune_usage(now_ms, self.usage_retention_ms);
        if pruned > 0 {
            debug!(pruned, "dropped usage records of idle callers");
        }

        let selected = {
            let candidates: Vec<&ModelInstance> =
                registry.instances().filter(|inst| inst.is_evictable()).collect();
            if candidates.is_empty() {
                debug!(policy = %self.policy(), "no evictable instances");
                return removed;
            }
            self.strategy.select(&candidates, now_ms)
        };

        for instance_id in selected {
            let evictable = registry.get(&instance_id).map(ModelInstance::is_evictable);
            debug_assert!(
                evictable != Some(false),
                "policy selected held or loading instance {instance_id}"
            );
            match evictable {
                Some(true) => {}
                Some(false) => {
                    error!(
                        instance_id = %instance_id,
                        policy = %self.policy(),
                        "policy selected an instance that is held or loading; skipping"
                    );
                    continue;
                }
                None => continue,
            }
            if let Some(gone) = registry.remove(&instance_id) {
                info!(
                    instance_id = %gone.instance_id,
                    model = %gone.model_name,
                    memory_mb = gone.memory_mb,
                    policy = %self.policy(),
                    "evicted instance"
                );
                registry.counters_mut().evictions += 1;
                removed.push(gone);
            }
        }
        removed
    }
}

impl std::fmt::Debug for EvictionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionEngine")
            .field("policy", &self.policy())
            .field("loading_timeout_ms", &self.loading_timeout_ms)
            .field("usage_retention_ms", &self.usage_retention_ms)
            .finish()
    }
}
