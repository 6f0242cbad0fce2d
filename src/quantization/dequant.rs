//! Dequantization primitives backed by candle.

use candle_core::quantized::{ggml_file, GgmlDType};
use candle_core::{DType, Device, Tensor};

use super::Dequantizer;

/// Reinterprets an already full-precision payload without any numeric change.
pub struct DenseReinterpret {
    dtype: DType,
}

impl DenseReinterpret {
    pub fn new(dtype: DType) -> Self {
        Self { dtype }
    }
}

impl Dequantizer for DenseReinterpret {
    fn dequantize(&self, raw: &[u8], shape: &[usize], device: &Device) -> crate::Result<Tensor> {
        let tensor = Tensor::from_raw_buffer(raw, self.dtype, shape, &Device::Cpu)?;
        tensor.to_device(device).map_err(Into::into)
    }
}

/// Decodes GGML block formats to f32.
pub struct BlockDequantizer {
    dtype: GgmlDType,
}

impl BlockDequantizer {
    pub fn new(dtype: GgmlDType) -> Self {
        Self { dtype }
    }
}

impl Dequantizer for BlockDequantizer {
    fn dequantize(&self, raw: &[u8], shape: &[usize], device: &Device) -> crate::Result<Tensor> {
        let qtensor = ggml_file::qtensor_from_ggml(self.dtype, raw, shape.to_vec(), device)?;
        qtensor.dequantize(device).map_err(Into::into)
    }
}
