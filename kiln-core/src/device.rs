use std::process::Command;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Point-in-time view of the accelerator, as reported by `/health`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub name: Option<String>,
    /// Device memory in use, in GB (10^9 bytes), rounded to 2 decimals.
    pub memory_allocated_gb: Option<f64>,
}

/// Queries the CUDA device. Name and memory come from `nvidia-smi`; when the
/// tool is missing or fails they are left empty.
pub fn query_accelerator() -> AcceleratorInfo {
    if !cuda_is_available() {
        return AcceleratorInfo::default();
    }
    let query = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.used", "--format=csv,noheader,nounits"])
        .output();
    let parsed = match query {
        Ok(output) if output.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            tracing::debug!(status = %output.status, "nvidia-smi exited unsuccessfully");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi unavailable");
            None
        }
    };
    match parsed {
        Some((name, memory_allocated_gb)) => AcceleratorInfo {
            available: true,
            name: Some(name),
            memory_allocated_gb: Some(memory_allocated_gb),
        },
        None => AcceleratorInfo {
            available: true,
            ..AcceleratorInfo::default()
        },
    }
}

/// Parses the first line of `nvidia-smi --query-gpu=name,memory.used`
/// (memory in MiB) into a device name and GB in use.
fn parse_nvidia_smi(output: &str) -> Option<(String, f64)> {
    let line = output.lines().next()?;
    let (name, used_mib) = line.rsplit_once(',')?;
    let used_mib: f64 = used_mib.trim().parse().ok()?;
    let gb = used_mib * 1024.0 * 1024.0 / 1e9;
    Some((name.trim().to_string(), round_to(gb, 2)))
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_gpu_line() {
        let output = "NVIDIA A10G, 7825\nNVIDIA A10G, 12\n";
        let (name, gb) = parse_nvidia_smi(output).unwrap();
        assert_eq!(name, "NVIDIA A10G");
        assert_eq!(gb, 8.21);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_nvidia_smi(""), None);
        assert_eq!(parse_nvidia_smi("No devices were found"), None);
        assert_eq!(parse_nvidia_smi("GPU, [N/A]"), None);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_to(12.345, 1), 12.3);
        assert_eq!(round_to(0.005, 2), 0.01);
        assert_eq!(round_to(3.0, 2), 3.0);
    }
}
