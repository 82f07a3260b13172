// Common model utilities and types
// Device selection and activation dtype rules shared by training and inference

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Device configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force CUDA (NVIDIA GPU)
    Cuda,
    /// Force Metal (Apple Silicon GPU)
    Metal,
}

/// Resolve a device preference to a concrete candle device
pub fn get_device_with_preference(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => {
            if !candle_core::utils::cuda_is_available() {
                bail!("CUDA requested but this build has no CUDA support (enable the `cuda` feature)");
            }
            Ok(Device::new_cuda(0)?)
        }
        DevicePreference::Metal => {
            if !candle_core::utils::metal_is_available() {
                bail!("Metal requested but this build has no Metal support (enable the `metal` feature)");
            }
            Ok(Device::new_metal(0)?)
        }
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                if let Ok(device) = Device::new_cuda(0) {
                    return Ok(device);
                }
            }
            if candle_core::utils::metal_is_available() {
                if let Ok(device) = Device::new_metal(0) {
                    return Ok(device);
                }
            }
            Ok(Device::Cpu)
        }
    }
}

/// Human-readable device name for logs
pub fn device_info(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal (Apple Silicon GPU)",
    }
}

/// Activation dtype for a run.
///
/// Half precision is only honoured on accelerators; CPU kernels run in f32.
pub fn activation_dtype(device: &Device, half: bool) -> DType {
    if half && !device.is_cpu() {
        DType::F16
    } else {
        DType::F32
    }
}
