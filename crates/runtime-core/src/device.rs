//! Moving training batches between devices

use std::collections::BTreeMap;

use crate::{Device, Error, Result, Tensor};

/// A named batch as produced by a data collator
pub type Batch = BTreeMap<String, BatchValue>;

/// One entry of a [`Batch`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchValue {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl BatchValue {
    /// Move to `device`; only tensors can move
    pub fn to(&self, device: Device) -> Result<BatchValue> {
        match self {
            BatchValue::Tensor(t) => Ok(BatchValue::Tensor(t.to(device))),
            other => Err(Error::NotMovable {
                kind: other.kind().to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BatchValue::Tensor(_) => "tensor",
            BatchValue::Int(_) => "int",
            BatchValue::Float(_) => "float",
            BatchValue::Text(_) => "text",
            BatchValue::Json(_) => "json",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            BatchValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Tensor> for BatchValue {
    fn from(t: Tensor) -> Self {
        BatchValue::Tensor(t)
    }
}

/// Move every movable value of `batch` to `device`
///
/// Values that cannot move are carried over as they are; the key set never
/// changes.
pub fn to_device(batch: &Batch, device: Device) -> Batch {
    batch
        .iter()
        .map(|(key, value)| {
            let moved = value.to(device).unwrap_or_else(|_| value.clone());
            (key.clone(), moved)
        })
        .collect()
}
