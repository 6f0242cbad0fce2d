//! Layers that read their parameters through [`Weight`], materializing at forward time.

use candle_core::{DType, Tensor};
use candle_nn::{Embedding, Linear, Module};

use crate::quantization::Weight;

fn materialize_as(weight: &Weight, tensor: &Tensor, dtype: DType) -> crate::Result<Tensor> {
    Ok(weight.materialize(tensor.device())?.to_dtype(dtype)?)
}

/// Linear layer over a possibly quantized weight.
#[derive(Debug, Clone)]
pub struct QuantLinear {
    name: String,
    weight: Weight,
    bias: Option<Weight>,
    dtype: DType,
}

impl QuantLinear {
    pub fn new(name: impl Into<String>, weight: Weight, bias: Option<Weight>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
            dtype,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    /// Decode the weight (replaying deferred patches) and apply `x @ w.T + b`
    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let weight = materialize_as(&self.weight, x, self.dtype)?;
        let bias = match &self.bias {
            Some(b) => Some(materialize_as(b, x, self.dtype)?),
            None => None,
        };

        tracing::trace!("{}: forward with weight {:?}", self.name, weight.dims());
        let x = x.to_dtype(self.dtype)?;
        Ok(Linear::new(weight, bias).forward(&x)?)
    }
}

/// Embedding table over a possibly quantized weight.
#[derive(Debug, Clone)]
pub struct QuantEmbedding {
    name: String,
    weight: Weight,
    hidden_size: usize,
    dtype: DType,
}

impl QuantEmbedding {
    pub fn new(name: impl Into<String>, weight: Weight, dtype: DType) -> crate::Result<Self> {
        let name = name.into();
        let hidden_size = match weight.dims() {
            [_, hidden] => *hidden,
            dims => {
                return Err(crate::GgufError::InvalidTensor {
                    tensor: name,
                    reason: format!("embedding table must be 2-D, got {:?}", dims),
                })
            }
        };

        Ok(Self {
            name,
            weight,
            hidden_size,
            dtype,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Look up rows for `ids`
    pub fn forward(&self, ids: &Tensor) -> crate::Result<Tensor> {
        let table = materialize_as(&self.weight, ids, self.dtype)?;
        tracing::trace!("{}: lookup in table {:?}", self.name, table.dims());
        Ok(Embedding::new(table, self.hidden_size).forward(ids)?)
    }
}
