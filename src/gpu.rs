//! GPU detection and device placement
//!
//! Detects available GPUs via nvidia-smi. Placement is decided by
//! [`DevicePolicy`]: the first preferred GPU that exists and, when a threshold
//! is configured, has enough free memory. Without a usable GPU the policy
//! either falls back to CPU or refuses the placement.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::{Arc, OnceLock};

/// Source of GPU information, swappable in tests
pub type GpuDetector = Arc<dyn Fn() -> GpuInfo + Send + Sync>;

/// Cached GPU information detected at startup
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// One GPU as reported by nvidia-smi
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
}

impl GpuDevice {
    pub fn memory_free_mib(&self) -> u64 {
        self.memory_total_mib.saturating_sub(self.memory_used_mib)
    }
}

/// Information about available GPUs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuInfo {
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.devices.iter().map(|device| device.index).collect()
    }

    pub fn device(&self, index: u32) -> Option<&GpuDevice> {
        self.devices.iter().find(|device| device.index == index)
    }

    pub fn is_valid_gpu_id(&self, gpu_id: u32) -> bool {
        self.device(gpu_id).is_some()
    }
}

/// Parse `nvidia-smi --query-gpu=index,name,memory.total,memory.used --format=csv,noheader,nounits`
pub fn parse_nvidia_smi(output: &str) -> GpuInfo {
    let devices = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GpuDevice {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                memory_total_mib: fields[2].parse().ok()?,
                memory_used_mib: fields[3].parse().ok()?,
            })
        })
        .collect();
    GpuInfo { devices }
}

/// Query nvidia-smi for the current GPU list and memory usage
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let info = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
            tracing::debug!(
                gpu_count = info.count(),
                indices = ?info.indices(),
                "Detected available GPUs"
            );
            info
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::debug!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Startup snapshot, detected once
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}

/// Where a model runtime should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DevicePlan {
    Gpu { index: u32 },
    Cpu,
}

impl DevicePlan {
    /// Value for `CUDA_VISIBLE_DEVICES`; empty hides every GPU
    pub fn cuda_visible_devices(&self) -> String {
        match self {
            Self::Gpu { index } => index.to_string(),
            Self::Cpu => String::new(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Gpu { index } => format!("cuda:{}", index),
            Self::Cpu => "cpu".to_string(),
        }
    }
}

/// Placement policy; thresholds are deployment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePolicy {
    /// Skip GPUs with less free memory than this
    pub min_free_memory_mib: Option<u64>,
    pub allow_cpu_fallback: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            min_free_memory_mib: None,
            allow_cpu_fallback: true,
        }
    }
}

impl DevicePolicy {
    /// Pick a device for `preferred` (most preferred first)
    ///
    /// An empty preference means "any detected GPU, in index order".
    pub fn plan(&self, gpus: &GpuInfo, preferred: &[u32]) -> ModelResult<DevicePlan> {
        let candidates: Vec<u32> = if preferred.is_empty() {
            gpus.indices()
        } else {
            preferred.to_vec()
        };

        let mut rejected = Vec::new();
        for index in candidates {
            let Some(device) = gpus.device(index) else {
                rejected.push(format!("gpu {} not present", index));
                continue;
            };
            if let Some(min_free) = self.min_free_memory_mib
                && device.memory_free_mib() < min_free
            {
                rejected.push(format!(
                    "gpu {} has {} MiB free, needs {} MiB",
                    index,
                    device.memory_free_mib(),
                    min_free
                ));
                continue;
            }
            return Ok(DevicePlan::Gpu { index });
        }

        if self.allow_cpu_fallback {
            if !rejected.is_empty() {
                tracing::warn!(reasons = ?rejected, "No usable GPU, falling back to CPU");
            }
            return Ok(DevicePlan::Cpu);
        }

        let reason = if rejected.is_empty() {
            "no GPU detected".to_string()
        } else {
            rejected.join("; ")
        };
        Err(ModelError::Placement { message: reason })
    }
}
