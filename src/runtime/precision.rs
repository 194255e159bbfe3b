//! Weight precision and device placement
//!
//! Both are plain configuration values until a provider resolves them against
//! the hardware it finds at load time.

use crate::error::Error;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric format of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// bfloat16, halves memory against f32
    #[default]
    Bf16,
    /// float16 for hardware without bf16 kernels
    F16,
    /// Full precision, mostly for CPU debugging
    F32,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Bf16 => DType::BF16,
            Precision::F16 => DType::F16,
            Precision::F32 => DType::F32,
        }
    }

    /// Precision actually used on `device`.
    ///
    /// Reduced-precision matmuls are slow or missing on the CPU backend, so
    /// CPU placement always runs in f32.
    pub fn effective_for(self, device: &Device) -> Precision {
        match device {
            Device::Cpu => Precision::F32,
            _ => self,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Bf16 => write!(f, "bf16"),
            Precision::F16 => write!(f, "f16"),
            Precision::F32 => write!(f, "f32"),
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f16" | "fp16" | "float16" => Ok(Precision::F16),
            "f32" | "fp32" | "float32" => Ok(Precision::F32),
            other => Err(Error::ConfigurationError(format!(
                "Unknown precision '{}' (expected bf16, f16 or f32)",
                other
            ))),
        }
    }
}

/// Where the model weights are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DevicePolicy {
    /// First CUDA device when available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
}

impl DevicePolicy {
    /// Resolve the policy to a concrete candle device.
    pub fn resolve(self) -> candle_core::Result<Device> {
        match self {
            DevicePolicy::Auto => Device::cuda_if_available(0),
            DevicePolicy::Cpu => Ok(Device::Cpu),
            DevicePolicy::Cuda(ordinal) => Device::new_cuda(ordinal),
        }
    }
}

impl fmt::Display for DevicePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePolicy::Auto => write!(f, "auto"),
            DevicePolicy::Cpu => write!(f, "cpu"),
            DevicePolicy::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

impl FromStr for DevicePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        match value.as_str() {
            "auto" => Ok(DevicePolicy::Auto),
            "cpu" => Ok(DevicePolicy::Cpu),
            "cuda" | "gpu" => Ok(DevicePolicy::Cuda(0)),
            _ => value
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(DevicePolicy::Cuda)
                .ok_or_else(|| {
                    Error::ConfigurationError(format!(
                        "Unknown device '{}' (expected auto, cpu, cuda or cuda:N)",
                        s
                    ))
                }),
        }
    }
}

impl TryFrom<String> for DevicePolicy {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevicePolicy> for String {
    fn from(policy: DevicePolicy) -> Self {
        policy.to_string()
    }
}
