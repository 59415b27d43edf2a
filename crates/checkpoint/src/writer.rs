//! State-dict serialization for the single-shard weights file
//!
//! The file body uses the safetensors layout: an 8-byte little-endian header
//! length, a JSON header with per-tensor dtype/shape/offsets, then the raw
//! little-endian tensor data.

use bytes::Bytes;
use runtime_core::{DType, Error, Result, Tensor};
use safetensors::tensor::{Dtype, SafeTensors, View};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Name → host tensor mapping that ends up in the weights file
pub type StateDict = BTreeMap<String, Tensor>;

fn to_safetensors_dtype(dtype: &DType) -> Result<Dtype> {
    Ok(match dtype {
        DType::Bool => Dtype::BOOL,
        DType::U8 => Dtype::U8,
        DType::I8 => Dtype::I8,
        DType::I16 => Dtype::I16,
        DType::I32 => Dtype::I32,
        DType::I64 => Dtype::I64,
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        DType::Custom(_) => return Err(Error::unsupported_dtype(dtype)),
    })
}

fn from_safetensors_dtype(dtype: Dtype) -> Result<DType> {
    Ok(match dtype {
        Dtype::BOOL => DType::Bool,
        Dtype::U8 => DType::U8,
        Dtype::I8 => DType::I8,
        Dtype::I16 => DType::I16,
        Dtype::I32 => DType::I32,
        Dtype::I64 => DType::I64,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        other => return Err(Error::unsupported_dtype(format!("{:?}", other))),
    })
}

struct TensorView<'a> {
    tensor: &'a Tensor,
    dtype: Dtype,
}

impl View for TensorView<'_> {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.tensor.data())
    }

    fn data_len(&self) -> usize {
        self.tensor.size_in_bytes()
    }
}

/// Serialize a state dict into the weights file body
pub fn encode_state_dict(state: &StateDict) -> Result<Bytes> {
    let views = state
        .iter()
        .map(|(name, tensor)| {
            Ok((
                name.as_str(),
                TensorView {
                    tensor,
                    dtype: to_safetensors_dtype(tensor.dtype())?,
                },
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    let buf = safetensors::tensor::serialize(views, &metadata)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Read a weights file body back into host tensors
pub fn decode_state_dict(data: &[u8]) -> Result<StateDict> {
    let tensors =
        SafeTensors::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let tensor = Tensor::from_bytes(
                from_safetensors_dtype(view.dtype())?,
                view.shape(),
                Bytes::copy_from_slice(view.data()),
            )?;
            Ok((name, tensor))
        })
        .collect()
}
