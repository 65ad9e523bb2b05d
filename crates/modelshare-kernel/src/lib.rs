//! # modelshare-kernel
//!
//! Contracts shared by every modelshare crate:
//!
//! - [`backend`]: the [`InferenceBackend`] trait the cache drives, plus the
//!   opaque [`ModelHandle`] a backend hands back from `load`
//! - [`types`]: [`ShareMode`] and [`CachePolicy`] selectors
//! - [`device`]: placement descriptors and best-effort accelerator probing
//! - [`clock`]: injectable millisecond clock
//! - [`config`]: multi-format configuration loading with env substitution
//! - [`error`]: backend error taxonomy

pub mod backend;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod types;

pub use backend::{InferenceBackend, LoadConfig, LoadedModel, ModelHandle};
pub use clock::{Clock, SystemClock};
pub use device::Device;
pub use error::{BackendError, BackendResult};
pub use types::{CachePolicy, ShareMode};
