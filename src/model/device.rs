//! Accelerator discovery and selection.
//!
//! Resolves the `ACESTEP_DEVICE` preference (`auto`/`cuda`/`cpu`/`xpu`)
//! against detected hardware. When compiled without the `cuda` feature,
//! detection reports no accelerators and `auto` falls back to CPU.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DevicePreference;
use crate::error::{ApiError, Result};

/// A concrete compute device models can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "ordinal")]
pub enum Device {
    Cuda(usize),
    Xpu(usize),
    Cpu,
}

impl Device {
    /// Whether this device is an accelerator (not host CPU).
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Device::Xpu(ordinal) => write!(f, "xpu:{ordinal}"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Information about a detected accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g. "NVIDIA GeForce RTX 3060").
    pub name: String,

    /// Total memory in bytes.
    pub total_memory: u64,

    /// Free memory in bytes at detection time.
    pub free_memory: u64,
}

/// Detect available accelerators.
///
/// With the `cuda` feature enabled, enumerates CUDA devices through the
/// driver API. Without it, returns an empty list.
pub fn detect_accelerators() -> Vec<AcceleratorInfo> {
    #[cfg(feature = "cuda")]
    {
        detect_accelerators_cuda()
    }

    #[cfg(not(feature = "cuda"))]
    {
        info!("built without the cuda feature, no accelerators detected");
        Vec::new()
    }
}

#[cfg(feature = "cuda")]
fn detect_accelerators_cuda() -> Vec<AcceleratorInfo> {
    use cudarc::driver::CudaContext;

    let count = match CudaContext::device_count() {
        Ok(n) => n as usize,
        Err(_) => return Vec::new(),
    };

    let mut devices = Vec::with_capacity(count);
    for id in 0..count {
        let Ok(ctx) = CudaContext::new(id) else {
            continue;
        };
        let name = ctx.name().unwrap_or_else(|_| format!("cuda:{id}"));
        let total = ctx.total_memory().unwrap_or(0) as u64;
        // Free memory is not exposed per-context here; assume total minus
        // a 512 MiB driver reserve until the first allocation reports back.
        let free = total.saturating_sub(512 * 1024 * 1024);
        devices.push(AcceleratorInfo {
            id,
            name,
            total_memory: total,
            free_memory: free,
        });
    }
    devices
}

/// Resolve a device preference against detected hardware.
///
/// `auto` picks the first accelerator, or CPU when none is present.
/// An explicit `cuda`/`xpu` preference fails when no matching device
/// exists, so a misconfigured deployment surfaces at startup rather
/// than at the first generation.
pub fn resolve_device(
    preference: DevicePreference,
    accelerators: &[AcceleratorInfo],
) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => {
            if accelerators.is_empty() {
                return Err(ApiError::Config(
                    "ACESTEP_DEVICE=cuda but no CUDA device detected".into(),
                ));
            }
            Device::Cuda(accelerators[0].id)
        }
        DevicePreference::Xpu => {
            if accelerators.is_empty() {
                return Err(ApiError::Config(
                    "ACESTEP_DEVICE=xpu but no XPU device detected".into(),
                ));
            }
            Device::Xpu(accelerators[0].id)
        }
        DevicePreference::Auto => match accelerators.first() {
            Some(acc) => Device::Cuda(acc.id),
            None => Device::Cpu,
        },
    };

    info!(device = %device, "resolved compute device");
    Ok(device)
}

/// Free memory on the first accelerator, in bytes. Zero when none.
pub fn free_accelerator_memory(accelerators: &[AcceleratorInfo]) -> u64 {
    accelerators.first().map(|a| a.free_memory).unwrap_or(0)
}

/// Accelerator info for tests without real hardware.
pub fn stub_accelerator(free_memory: u64) -> AcceleratorInfo {
    AcceleratorInfo {
        id: 0,
        name: "stub accelerator".to_string(),
        total_memory: free_memory + 1024 * 1024 * 1024,
        free_memory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_prefers_accelerator() {
        let accs = vec![stub_accelerator(8 * 1024 * 1024 * 1024)];
        let device = resolve_device(DevicePreference::Auto, &accs).unwrap();
        assert_eq!(device, Device::Cuda(0));
        assert!(device.is_accelerator());
    }

    #[test]
    fn test_auto_falls_back_to_cpu() {
        let device = resolve_device(DevicePreference::Auto, &[]).unwrap();
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_explicit_cuda_without_hardware_fails() {
        assert!(resolve_device(DevicePreference::Cuda, &[]).is_err());
    }

    #[test]
    fn test_free_memory() {
        assert_eq!(free_accelerator_memory(&[]), 0);
        let accs = vec![stub_accelerator(4096)];
        assert_eq!(free_accelerator_memory(&accs), 4096);
    }
}
