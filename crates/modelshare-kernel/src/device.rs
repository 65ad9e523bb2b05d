//! Device placement descriptors.
//!
//! Detection uses filesystem probes rather than linking to GPU libraries,
//! so the kernel stays lightweight on hosts without accelerators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Where a model instance lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host memory, always available
    #[default]
    Cpu,
    /// NVIDIA GPU by ordinal
    Cuda(u32),
    /// AMD GPU by ordinal
    Rocm(u32),
    /// Apple Metal
    Metal,
}

impl Device {
    /// Best available placement on this host.
    ///
    /// Probe order: CUDA (`/dev/nvidia0`) → ROCm (`/dev/kfd`) → Metal (macOS) → CPU.
    pub fn detect() -> Self {
        if Path::new("/dev/nvidia0").exists() {
            return Device::Cuda(0);
        }
        if Path::new("/dev/kfd").exists() {
            return Device::Rocm(0);
        }
        if cfg!(target_os = "macos") {
            return Device::Metal;
        }
        Device::Cpu
    }

    /// Whether the placement is an accelerator rather than host memory.
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            Device::Rocm(ordinal) => write!(f, "rocm:{}", ordinal),
            Device::Metal => write!(f, "metal"),
        }
    }
}
