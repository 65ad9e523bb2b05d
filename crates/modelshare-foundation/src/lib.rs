//! # modelshare-foundation
//!
//! Shared cache of memory-resident model instances.
//!
//! Callers ask [`ModelSharingService`] for a named model. The service either
//! attaches them to an existing instance, reserves a new loading placeholder,
//! or soft-rejects with `Ok(None)` when capacity is exhausted even after an
//! eviction pass. Unheld instances are removed by the configured
//! [`CachePolicy`](modelshare_kernel::CachePolicy), reactively during
//! admission and periodically from background loops.
//!
//! ```ignore
//! let service = ModelSharingService::new(CacheConfig::default(), backend)?;
//! service.start();
//!
//! if let Some(id) = service.acquire_ready("llama-3-8b", "user-1", ShareMode::Shared, false).await? {
//!     let out = service.infer(&id, "user-1", json!({ "prompt": "hi" })).await?;
//!     service.release(&id, "user-1");
//! }
//!
//! service.stop().await;
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod eviction;
pub mod instance;
pub mod lease;
mod monitor;
pub mod registry;
pub mod service;
pub mod stats;

pub use admission::AdmissionDecision;
pub use config::{CacheConfig, EvictionTuning};
pub use error::{ShareError, ShareResult};
pub use eviction::{EvictionEngine, EvictionStrategy};
pub use instance::InstanceInfo;
pub use lease::InstanceLease;
pub use registry::CacheCounters;
pub use service::{ModelSharingService, ModelSharingServiceBuilder};
pub use stats::{CallerUsage, HostMemory, ScalingRecommendation, SharingStats};

pub use modelshare_kernel::{CachePolicy, Device, InferenceBackend, LoadConfig, ShareMode};
