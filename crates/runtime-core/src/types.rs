//! Core type definitions for the fine-tuning support runtime

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Rank of a worker within a process group
pub type Rank = usize;

/// Identifier attached to a partitioned parameter by the sharding backend
pub type PartitionId = u64;

/// Numeric element kind of a tensor
///
/// The string form follows the torch naming (`float32`, `bfloat16`, ...).
/// `Custom` covers framework-extension kinds the runtime cannot size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
    Custom(String),
}

impl DType {
    /// Storage bytes per element, `None` for custom kinds
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DType::Bool | DType::U8 | DType::I8 => Some(1),
            DType::I16 | DType::F16 | DType::BF16 => Some(2),
            DType::I32 | DType::F32 => Some(4),
            DType::I64 | DType::F64 => Some(8),
            DType::Custom(_) => None,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DType::U8 | DType::I8 | DType::I16 | DType::I32 | DType::I64
        )
    }

    pub fn name(&self) -> &str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Custom(name) => name,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.strip_prefix("torch.").unwrap_or(name);
        let dtype = match name {
            "bool" => DType::Bool,
            "uint8" => DType::U8,
            "int8" => DType::I8,
            "int16" | "short" => DType::I16,
            "int32" | "int" => DType::I32,
            "int64" | "long" => DType::I64,
            "float16" | "half" => DType::F16,
            "bfloat16" => DType::BF16,
            "float32" | "float" => DType::F32,
            "float64" | "double" => DType::F64,
            "" => {
                return Err(Error::InvalidConfig {
                    message: "empty dtype name".to_string(),
                })
            }
            other => DType::Custom(other.to_string()),
        };
        Ok(dtype)
    }
}

impl From<DType> for String {
    fn from(dtype: DType) -> Self {
        dtype.to_string()
    }
}

impl TryFrom<String> for DType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Compute device a tensor lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("unknown device: {}", other),
                }),
        }
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse_and_display() {
        assert_eq!("torch.bfloat16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("half".parse::<DType>().unwrap(), DType::F16);
        assert_eq!(DType::F32.to_string(), "float32");
        assert_eq!(
            "customtype".parse::<DType>().unwrap(),
            DType::Custom("customtype".to_string())
        );
        assert!("".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_element_size() {
        assert_eq!(DType::Bool.element_size(), Some(1));
        assert_eq!(DType::BF16.element_size(), Some(2));
        assert_eq!(DType::I64.element_size(), Some(8));
        assert_eq!(DType::Custom("int4".to_string()).element_size(), None);
    }

    #[test]
    fn test_device_round_trip() {
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
        assert!("tpu:0".parse::<Device>().is_err());

        let json = serde_json::to_string(&Device::Cuda(2)).unwrap();
        assert_eq!(json, "\"cuda:2\"");
    }
}
