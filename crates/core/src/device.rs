//! Compute device selection.
//!
//! Auto-detection prefers CUDA, then Metal, then falls back to the CPU.

use candle_core::Device;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn of(device: &Device) -> Self {
        if device.is_cuda() {
            DeviceKind::Cuda
        } else if device.is_metal() {
            DeviceKind::Metal
        } else {
            DeviceKind::Cpu
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unrecognised device '{0}' (expected auto, cpu, cuda[:N] or metal[:N])")]
    Unrecognised(String),
    #[error("failed to open {spec}: {source}")]
    Open {
        spec: String,
        source: candle_core::Error,
    },
}

fn try_cuda(ordinal: usize) -> Option<Device> {
    if !candle_core::utils::cuda_is_available() {
        return None;
    }
    match Device::new_cuda(ordinal) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!(ordinal, error = %e, "CUDA reported available but failed to open");
            None
        }
    }
}

fn try_metal(ordinal: usize) -> Option<Device> {
    if !candle_core::utils::metal_is_available() {
        return None;
    }
    match Device::new_metal(ordinal) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!(ordinal, error = %e, "Metal reported available but failed to open");
            None
        }
    }
}

/// Pick the best available device: CUDA, then Metal, then CPU.
pub fn infer_device() -> Device {
    if let Some(device) = try_cuda(0) {
        info!("using CUDA device 0");
        return device;
    }
    if let Some(device) = try_metal(0) {
        info!("using Metal device 0");
        return device;
    }
    debug!("no accelerator available, falling back to CPU");
    Device::Cpu
}

/// Parse a device string from configuration.
///
/// Accepts `auto`, `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N` (and `mps`).
pub fn parse_device(spec: &str) -> Result<Device, DeviceError> {
    let normalized = spec.trim().to_lowercase();
    let (kind, ordinal) = match normalized.split_once(':') {
        Some((kind, idx)) => {
            let ordinal = idx
                .parse::<usize>()
                .map_err(|_| DeviceError::Unrecognised(spec.to_string()))?;
            (kind.to_string(), ordinal)
        }
        None => (normalized.clone(), 0),
    };

    match kind.as_str() {
        "" | "auto" => Ok(infer_device()),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal).map_err(|source| DeviceError::Open {
            spec: spec.to_string(),
            source,
        }),
        "metal" | "mps" => Device::new_metal(ordinal).map_err(|source| DeviceError::Open {
            spec: spec.to_string(),
            source,
        }),
        _ => Err(DeviceError::Unrecognised(spec.to_string())),
    }
}
