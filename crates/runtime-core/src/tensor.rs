//! Host-side tensor representation
//!
//! A [`Tensor`] is a dtype, a shape, a device tag and contiguous little-endian
//! storage. Storage is reference counted (`Bytes`), so clones are shallow;
//! [`Tensor::to`] and [`Tensor::cpu`] produce an owned copy when the tensor
//! actually changes device.

use bytes::{Bytes, BytesMut};
use half::{bf16, f16};

use crate::{DType, Device, Error, Result};

/// Rust scalar types that map onto a [`DType`]
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut BytesMut);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le(self, out: &mut BytesMut) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i8, DType::I8);
impl_element!(i16, DType::I16);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f16, DType::F16);
impl_element!(bf16, DType::BF16);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_le(self, out: &mut BytesMut) {
        out.extend_from_slice(&[self as u8]);
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: Device,
    data: Bytes,
}

impl Tensor {
    /// Wrap raw little-endian storage
    ///
    /// The storage length is checked against the shape for every dtype with
    /// a known element width.
    pub fn from_bytes(dtype: DType, shape: &[usize], data: Bytes) -> Result<Self> {
        if let Some(width) = dtype.element_size() {
            let expected = shape.iter().product::<usize>() * width;
            if data.len() != expected {
                return Err(Error::InvalidTensorData {
                    message: format!(
                        "{} tensor of shape {:?} needs {} bytes, got {}",
                        dtype,
                        shape,
                        expected,
                        data.len()
                    ),
                });
            }
        }

        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            device: Device::Cpu,
            data,
        })
    }

    pub fn from_slice<T: Element>(values: &[T], shape: &[usize]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * std::mem::size_of::<T>());
        for value in values {
            value.write_le(&mut buf);
        }
        Self::from_bytes(T::DTYPE, shape, buf.freeze())
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self> {
        let width = dtype
            .element_size()
            .ok_or_else(|| Error::unsupported_dtype(&dtype))?;
        let len = shape.iter().product::<usize>() * width;
        Self::from_bytes(dtype, shape, Bytes::from(vec![0u8; len]))
    }

    /// Build a tensor of `dtype` from `f64` values, casting each element
    pub fn from_f64(values: &[f64], dtype: DType, shape: &[usize]) -> Result<Self> {
        let mut buf = BytesMut::new();
        for &v in values {
            match dtype {
                DType::Bool => (v != 0.0).write_le(&mut buf),
                DType::U8 => (v as u8).write_le(&mut buf),
                DType::I8 => (v as i8).write_le(&mut buf),
                DType::I16 => (v as i16).write_le(&mut buf),
                DType::I32 => (v as i32).write_le(&mut buf),
                DType::I64 => (v as i64).write_le(&mut buf),
                DType::F16 => f16::from_f64(v).write_le(&mut buf),
                DType::BF16 => bf16::from_f64(v).write_le(&mut buf),
                DType::F32 => (v as f32).write_le(&mut buf),
                DType::F64 => v.write_le(&mut buf),
                DType::Custom(_) => return Err(Error::unsupported_dtype(&dtype)),
            }
        }
        Self::from_bytes(dtype, shape, buf.freeze())
    }

    /// Decode every element as `f64`
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let width = self
            .dtype
            .element_size()
            .ok_or_else(|| Error::unsupported_dtype(&self.dtype))?;
        let values = self
            .data
            .chunks_exact(width)
            .map(|chunk| match self.dtype {
                DType::Bool => f64::from(u8::from(bool::read_le(chunk))),
                DType::U8 => f64::from(u8::read_le(chunk)),
                DType::I8 => f64::from(i8::read_le(chunk)),
                DType::I16 => f64::from(i16::read_le(chunk)),
                DType::I32 => f64::from(i32::read_le(chunk)),
                DType::I64 => i64::read_le(chunk) as f64,
                DType::F16 => f16::read_le(chunk).to_f64(),
                DType::BF16 => bf16::read_le(chunk).to_f64(),
                DType::F32 => f64::from(f32::read_le(chunk)),
                DType::F64 => f64::read_le(chunk),
                DType::Custom(_) => unreachable!("custom dtypes have no element width"),
            })
            .collect();
        Ok(values)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::InvalidTensorData {
                message: format!("cannot read {} tensor as {}", self.dtype, T::DTYPE),
            });
        }
        Ok(self
            .data
            .chunks_exact(std::mem::size_of::<T>())
            .map(T::read_le)
            .collect())
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// Move to `device`, copying storage when the device changes
    pub fn to(&self, device: Device) -> Tensor {
        if self.device == device {
            return self.clone();
        }
        Tensor {
            dtype: self.dtype.clone(),
            shape: self.shape.clone(),
            device,
            data: Bytes::copy_from_slice(&self.data),
        }
    }

    /// Host copy of this tensor
    pub fn cpu(&self) -> Tensor {
        self.to(Device::Cpu)
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                actual: shape.to_vec(),
            });
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            ..self.clone()
        })
    }

    pub fn flatten(&self) -> Tensor {
        Tensor {
            shape: vec![self.numel()],
            ..self.clone()
        }
    }

    /// Slice `len` elements starting at `start` out of the flattened tensor
    pub fn narrow_flat(&self, start: usize, len: usize) -> Result<Tensor> {
        let width = self
            .dtype
            .element_size()
            .ok_or_else(|| Error::unsupported_dtype(&self.dtype))?;
        if start + len > self.numel() {
            return Err(Error::InvalidTensorData {
                message: format!(
                    "range {}..{} out of bounds for {} elements",
                    start,
                    start + len,
                    self.numel()
                ),
            });
        }
        Ok(Tensor {
            dtype: self.dtype.clone(),
            shape: vec![len],
            device: self.device,
            data: self.data.slice(start * width..(start + len) * width),
        })
    }

    /// Concatenate tensors of the same dtype along a flattened view
    pub fn cat_flat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| Error::InvalidTensorData {
            message: "cannot concatenate zero tensors".to_string(),
        })?;
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        let mut numel = 0;
        for part in parts {
            if part.dtype != first.dtype {
                return Err(Error::InvalidTensorData {
                    message: format!("cannot concatenate {} with {}", first.dtype, part.dtype),
                });
            }
            buf.extend_from_slice(&part.data);
            numel += part.numel();
        }
        Ok(Tensor {
            dtype: first.dtype.clone(),
            shape: vec![numel],
            device: first.device,
            data: buf.freeze(),
        })
    }
}
