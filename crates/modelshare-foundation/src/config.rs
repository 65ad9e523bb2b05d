//! Configuration for the model sharing cache.

use std::time::Duration;

use modelshare_kernel::config::{ConfigError, ConfigResult, load_with_env};
use modelshare_kernel::{CachePolicy, Device};
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides, e.g. `MODELSHARE__MAX_INSTANCES=4`.
pub const ENV_PREFIX: &str = "MODELSHARE";

/// Tuning knobs for the eviction engine.
///
/// The adaptive weights and the batch size are empirical defaults rather
/// than derived values; deployments are expected to tune them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvictionTuning {
    /// Maximum instances removed per LRU/LFU/FIFO/adaptive pass
    pub batch_size: usize,
    /// Adaptive weight applied to hours since last access
    pub recency_weight: f64,
    /// Adaptive weight applied to `1 / (access_count + 1)`
    pub frequency_weight: f64,
    /// Adaptive weight applied to footprint in GB
    pub memory_weight: f64,
}

impl Default for EvictionTuning {
    fn default() -> Self {
        Self {
            batch_size: 2,
            recency_weight: 0.4,
            frequency_weight: 0.4,
            memory_weight: 0.2,
        }
    }
}

/// Configuration for the model sharing cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate memory budget across committed instances (GB)
    pub max_memory_gb: f64,
    /// Maximum number of instances, loading placeholders included
    pub max_instances: usize,
    /// Holder limit for non-exclusive instances
    pub max_holders_per_instance: usize,
    /// Eviction policy
    pub cache_policy: CachePolicy,
    /// Idle time after which the TTL policy expires an instance
    pub ttl_minutes: u64,
    /// Period of the cleanup loop
    pub cleanup_interval_minutes: u64,
    /// Run the memory pressure loop
    pub enable_memory_monitoring: bool,
    /// Fraction of the memory budget above which the pressure loop evicts
    pub pressure_threshold: f64,
    /// Period of the memory pressure loop
    pub pressure_check_interval_secs: u64,
    /// Keep per-caller usage statistics
    pub enable_usage_tracking: bool,
    /// Let `Dynamic` instances share under load and report scaling hints
    pub auto_scale_instances: bool,
    /// Utilization at or above which the cache counts as under load
    pub scale_up_threshold: f64,
    /// Holder utilization at or below which a scale-down is recommended
    pub scale_down_threshold: f64,
    /// Age after which an uncommitted placeholder counts as abandoned
    pub loading_timeout_secs: u64,
    /// Placement override; detected from the host when unset
    pub device: Option<Device>,
    pub eviction: EvictionTuning,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_gb: 8.0,
            max_instances: 10,
            max_holders_per_instance: 10,
            cache_policy: CachePolicy::Lru,
            ttl_minutes: 60,
            cleanup_interval_minutes: 5,
            enable_memory_monitoring: true,
            pressure_threshold: 0.9,
            pressure_check_interval_secs: 30,
            enable_usage_tracking: true,
            auto_scale_instances: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            loading_timeout_secs: 600,
            device: None,
            eviction: EvictionTuning::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML/TOML/JSON/INI/RON/JSON5 file, applying
    /// `MODELSHARE__*` environment overrides, then validate.
    pub fn from_file(path: &str) -> ConfigResult<Self> {
        let config: Self = load_with_env(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_memory_gb(mut self, gb: f64) -> Self {
        self.max_memory_gb = gb;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_max_holders(mut self, max: usize) -> Self {
        self.max_holders_per_instance = max;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_ttl_minutes(mut self, minutes: u64) -> Self {
        self.ttl_minutes = minutes;
        self
    }

    pub fn with_cleanup_interval_minutes(mut self, minutes: u64) -> Self {
        self.cleanup_interval_minutes = minutes;
        self
    }

    pub fn with_memory_monitoring(mut self, enabled: bool) -> Self {
        self.enable_memory_monitoring = enabled;
        self
    }

    pub fn with_pressure_check_interval_secs(mut self, secs: u64) -> Self {
        self.pressure_check_interval_secs = secs;
        self
    }

    pub fn with_auto_scale(mut self, enabled: bool) -> Self {
        self.auto_scale_instances = enabled;
        self
    }

    pub fn with_loading_timeout_secs(mut self, secs: u64) -> Self {
        self.loading_timeout_secs = secs;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_eviction_tuning(mut self, tuning: EvictionTuning) -> Self {
        self.eviction = tuning;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.max_memory_gb > 0.0) {
            return Err(invalid("max_memory_gb must be greater than 0"));
        }
        if self.max_instances == 0 {
            return Err(invalid("max_instances must be greater than 0"));
        }
        if self.max_holders_per_instance == 0 {
            return Err(invalid("max_holders_per_instance must be greater than 0"));
        }
        if self.cleanup_interval_minutes == 0 {
            return Err(invalid("cleanup_interval_minutes must be greater than 0"));
        }
        if self.pressure_check_interval_secs == 0 {
            return Err(invalid("pressure_check_interval_secs must be greater than 0"));
        }
        for (name, value) in [
            ("pressure_threshold", self.pressure_threshold),
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(&format!("{} must be in (0, 1], got {}", name, value)));
            }
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            return Err(invalid("scale_down_threshold must not exceed scale_up_threshold"));
        }
        if self.eviction.batch_size == 0 {
            return Err(invalid("eviction.batch_size must be greater than 0"));
        }
        let weights = [
            self.eviction.recency_weight,
            self.eviction.frequency_weight,
            self.eviction.memory_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("eviction weights must be finite and non-negative"));
        }
        Ok(())
    }

    /// Memory budget in MB.
    pub fn max_memory_mb(&self) -> f64 {
        self.max_memory_gb * 1024.0
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }

    pub fn pressure_check_interval(&self) -> Duration {
        Duration::from_secs(self.pressure_check_interval_secs)
    }

    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.loading_timeout_secs)
    }

    /// Placement for new instances.
    pub fn resolve_device(&self) -> Device {
        self.device.unwrap_or_else(Device::detect)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
