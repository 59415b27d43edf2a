//! Weight index (`pytorch_model.bin.index.json`) and dtype size accounting

use once_cell::sync::Lazy;
use regex::Regex;
use runtime_core::{DType, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Single-shard weights file name
pub const WEIGHTS_NAME: &str = "pytorch_model_00001-of-00001.bin";

/// Model configuration file name
pub const CONFIG_NAME: &str = "config.json";

/// Weight index file name
pub const INDEX_NAME: &str = "pytorch_model.bin.index.json";

static BIT_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\d](\d+)$").expect("bit width pattern is valid"));

/// Adapter (LoRA) weights are never part of an exported checkpoint
pub fn is_adapter_name(name: &str) -> bool {
    name.contains("lora")
}

/// Bits per element, read from the trailing width in the dtype name
pub fn dtype_bits(dtype: &DType) -> Result<u64> {
    if *dtype == DType::Bool {
        return Ok(1);
    }

    let name = dtype.to_string();
    BIT_WIDTH
        .captures(&name)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .ok_or_else(|| Error::unsupported_dtype(dtype))
}

/// Bytes per element; booleans count as one eighth of a byte
pub fn get_dtype_size(dtype: &DType) -> Result<f64> {
    Ok(dtype_bits(dtype)? as f64 / 8.0)
}

/// On-disk layout of the weight index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub total_size: u64,
}

/// Weight index under construction
///
/// Sizes are accumulated in bits so sub-byte kinds add up exactly;
/// `total_size` rounds the sum up to whole bytes.
#[derive(Debug, Clone, Default)]
pub struct WeightIndex {
    weight_map: BTreeMap<String, String>,
    total_bits: u64,
}

impl WeightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parameter stored in `file`
    ///
    /// Adapter parameters are skipped; returns whether the entry was kept.
    pub fn add(&mut self, name: &str, file: &str, numel: usize, dtype: &DType) -> Result<bool> {
        if is_adapter_name(name) {
            return Ok(false);
        }
        let bits = dtype_bits(dtype)?;
        self.total_bits += numel as u64 * bits;
        self.weight_map.insert(name.to_string(), file.to_string());
        Ok(true)
    }

    pub fn total_size(&self) -> u64 {
        self.total_bits.div_ceil(8)
    }

    pub fn weight_map(&self) -> &BTreeMap<String, String> {
        &self.weight_map
    }

    pub fn len(&self) -> usize {
        self.weight_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight_map.is_empty()
    }

    pub fn to_file(&self) -> IndexFile {
        IndexFile {
            metadata: IndexMetadata {
                total_size: self.total_size(),
            },
            weight_map: self.weight_map.clone(),
        }
    }

    /// 2-space indented JSON, keys sorted, trailing newline
    pub fn to_json_string(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(&self.to_file())?;
        json.push('\n');
        Ok(json)
    }
}

impl IndexFile {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_dtype_size() {
        assert_eq!(get_dtype_size(&DType::Bool).unwrap(), 0.125);
        assert_eq!(get_dtype_size(&DType::F32).unwrap(), 4.0);
        assert_eq!(get_dtype_size(&DType::BF16).unwrap(), 2.0);
        assert_eq!(get_dtype_size(&DType::F16).unwrap(), 2.0);
        assert_eq!(get_dtype_size(&DType::I64).unwrap(), 8.0);
        assert_eq!(get_dtype_size(&DType::U8).unwrap(), 1.0);
        assert_eq!(
            get_dtype_size(&DType::Custom("int4".to_string())).unwrap(),
            0.5
        );
    }

    #[test]
    fn test_unknown_dtype_is_fatal() {
        let err = get_dtype_size(&DType::Custom("customtype".to_string())).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype { .. }));
        assert!(err.is_fatal());

        assert!(get_dtype_size(&DType::Custom("float8_e4m3fn".to_string())).is_err());
    }

    #[test]
    fn test_total_size_sums_element_widths() {
        let mut index = WeightIndex::new();
        let entries = [
            ("embed.weight", 1000usize, DType::BF16),
            ("norm.weight", 64, DType::F32),
            ("mask", 16, DType::Bool),
            ("step", 1, DType::I64),
        ];
        for (name, numel, dtype) in &entries {
            assert!(index.add(name, WEIGHTS_NAME, *numel, dtype).unwrap());
        }

        let expected: f64 = entries
            .iter()
            .map(|(_, numel, dtype)| *numel as f64 * get_dtype_size(dtype).unwrap())
            .sum();
        assert_eq!(index.total_size() as f64, expected);
        assert_eq!(index.total_size(), 2000 + 256 + 2 + 8);
    }

    #[test]
    fn test_sub_byte_total_rounds_up() {
        let mut index = WeightIndex::new();
        index.add("flags", WEIGHTS_NAME, 9, &DType::Bool).unwrap();
        assert_eq!(index.total_size(), 2);
    }

    #[test]
    fn test_adapters_are_skipped() {
        let mut index = WeightIndex::new();
        assert!(!index
            .add("layers.0.attn.lora_A.weight", WEIGHTS_NAME, 128, &DType::F32)
            .unwrap());
        assert!(index.is_empty());
        assert_eq!(index.total_size(), 0);
    }

    #[test]
    fn test_index_json_layout() {
        let mut index = WeightIndex::new();
        index.add("b.weight", WEIGHTS_NAME, 2, &DType::F32).unwrap();
        index.add("a.weight", WEIGHTS_NAME, 1, &DType::F16).unwrap();

        let json = index.to_json_string().unwrap();
        let expected = concat!(
            "{\n",
            "  \"metadata\": {\n",
            "    \"total_size\": 10\n",
            "  },\n",
            "  \"weight_map\": {\n",
            "    \"a.weight\": \"pytorch_model_00001-of-00001.bin\",\n",
            "    \"b.weight\": \"pytorch_model_00001-of-00001.bin\"\n",
            "  }\n",
            "}\n",
        );
        assert_eq!(json, expected);
        assert_eq!(IndexFile::from_json_str(&json).unwrap(), index.to_file());
    }
}
