//! Weight values as seen by the model.

use candle_core::{Device, Tensor};

use super::QuantizedTensor;

/// A model weight: either a native tensor or a lazily decoded GGUF tensor.
#[derive(Debug, Clone)]
pub enum Weight {
    Full(Tensor),
    Quantized(QuantizedTensor),
}

impl Weight {
    /// Logical dimensions, independent of the storage encoding
    pub fn dims(&self) -> &[usize] {
        match self {
            Weight::Full(t) => t.dims(),
            Weight::Quantized(q) => q.dims(),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Weight::Quantized(_))
    }

    pub fn as_quantized(&self) -> Option<&QuantizedTensor> {
        match self {
            Weight::Quantized(q) => Some(q),
            Weight::Full(_) => None,
        }
    }

    pub fn as_quantized_mut(&mut self) -> Option<&mut QuantizedTensor> {
        match self {
            Weight::Quantized(q) => Some(q),
            Weight::Full(_) => None,
        }
    }

    /// Full-precision value on `device`, replaying any deferred patches
    pub fn materialize(&self, device: &Device) -> crate::Result<Tensor> {
        match self {
            Weight::Full(t) => t.to_device(device).map_err(Into::into),
            Weight::Quantized(q) => q.materialize(device),
        }
    }

    pub fn into_tensor(self, device: &Device) -> crate::Result<Tensor> {
        match self {
            Weight::Full(t) => t.to_device(device).map_err(Into::into),
            Weight::Quantized(q) => q.materialize(device),
        }
    }
}

impl From<Tensor> for Weight {
    fn from(tensor: Tensor) -> Self {
        Weight::Full(tensor)
    }
}

impl From<QuantizedTensor> for Weight {
    fn from(tensor: QuantizedTensor) -> Self {
        Weight::Quantized(tensor)
    }
}
