use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

/// Element type of the key/value cache handed to the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    Bf16,
}

/// Open the requested device and pick the cache dtype.
///
/// Exported decoder graphs default to f32 caches; an explicit precision overrides that on any
/// device.
pub fn prepare_device_and_dtype(
    device: DeviceKind,
    precision: Option<Precision>,
) -> Result<(Device, DType)> {
    let device = match device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Metal => Device::new_metal(0).context("failed to initialise Metal device")?,
        DeviceKind::Cuda => Device::new_cuda(0).context("failed to initialise CUDA device")?,
    };
    let dtype = precision.map(dtype_from_precision).unwrap_or(DType::F32);
    Ok((device, dtype))
}

pub fn dtype_from_precision(p: Precision) -> DType {
    match p {
        Precision::F32 => DType::F32,
        Precision::F16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
