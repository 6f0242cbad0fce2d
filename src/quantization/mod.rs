//! Lazily dequantized weights.
//!
//! A weight is either a native full-precision tensor or a [`QuantizedTensor`]
//! that keeps its GGUF encoding until materialized:
//! - Dense tags (F32/F16/BF16/F64) are reinterpreted byte-for-byte
//! - Block tags (Q4_0 .. Q8_K) decode through candle's GGML kernels
//! - Anything else fails with `UnsupportedQuantization` at materialization time

mod dequant;
mod tensor;
mod weight;

pub use dequant::{BlockDequantizer, DenseReinterpret};
pub use tensor::{PendingPatch, QuantizedTensor, RawData};
pub use weight::Weight;

use candle_core::{Device, Tensor};

use crate::gguf::GgmlType;

/// Dequantization primitive for one encoding
pub trait Dequantizer: Send + Sync {
    /// Decode `raw` into a dense tensor of the given logical shape
    fn dequantize(&self, raw: &[u8], shape: &[usize], device: &Device) -> crate::Result<Tensor>;
}

/// Look up the dequantization primitive registered for a quantization tag
pub fn dequantizer_for(ggml_type: GgmlType) -> Option<Box<dyn Dequantizer>> {
    if let Some(dtype) = ggml_type.dense_dtype() {
        return Some(Box::new(DenseReinterpret::new(dtype)));
    }
    ggml_type
        .block_dtype()
        .map(|dtype| Box::new(BlockDequantizer::new(dtype)) as Box<dyn Dequantizer>)
}
