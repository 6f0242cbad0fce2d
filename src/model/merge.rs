//! Weight patches and the merge entry point.

use candle_core::{DType, Device, Tensor};

use crate::quantization::Weight;

/// An adjustment to be merged into a weight at use time.
#[derive(Debug, Clone)]
pub enum WeightPatch {
    /// Full-size delta added to the weight
    Diff { delta: Tensor, strength: f64 },
    /// Low-rank delta `up @ down`, scaled by `alpha / rank` when alpha is given
    Lora {
        up: Tensor,
        down: Tensor,
        alpha: Option<f64>,
        strength: f64,
    },
}

impl WeightPatch {
    pub fn strength(&self) -> f64 {
        match self {
            WeightPatch::Diff { strength, .. } | WeightPatch::Lora { strength, .. } => *strength,
        }
    }

    /// Scaled f32 delta shaped like the target weight
    fn delta(&self, shape: &[usize], key: &str, device: &Device) -> crate::Result<Tensor> {
        let merge_error = |reason: String| crate::GgufError::Merge {
            key: key.to_string(),
            reason,
        };

        match self {
            WeightPatch::Diff { delta, strength } => {
                if delta.dims() != shape {
                    return Err(merge_error(format!(
                        "diff shape {:?} does not match weight shape {:?}",
                        delta.dims(),
                        shape
                    )));
                }
                let delta = delta.to_device(device)?.to_dtype(DType::F32)?;
                Ok(delta.affine(*strength, 0.0)?)
            }
            WeightPatch::Lora {
                up,
                down,
                alpha,
                strength,
            } => {
                // Conv LoRAs carry trailing kernel dims; fold them into the matmul.
                let up = up.to_device(device)?.to_dtype(DType::F32)?.flatten_from(1)?;
                let down = down.to_device(device)?.to_dtype(DType::F32)?.flatten_from(1)?;
                let rank = down.dim(0)?;
                if up.dim(1)? != rank {
                    return Err(merge_error(format!(
                        "lora up {:?} and down {:?} disagree on rank",
                        up.dims(),
                        down.dims()
                    )));
                }

                let product = up.matmul(&down)?;
                let expected: usize = shape.iter().product();
                if product.elem_count() != expected {
                    return Err(merge_error(format!(
                        "lora product {:?} cannot be reshaped to weight shape {:?}",
                        product.dims(),
                        shape
                    )));
                }

                let scale = alpha.map_or(1.0, |a| a / rank as f64);
                Ok(product.reshape(shape)?.affine(strength * scale, 0.0)?)
            }
        }
    }
}

/// The weight-merge entry point of a model.
pub trait WeightMerge: Send + Sync {
    /// Merge `patches` into `weight`, returning the adjusted weight
    fn calculate_weight(&self, patches: &[WeightPatch], weight: Weight, key: &str) -> crate::Result<Weight>;

    /// Whether this strategy defers merges for block-quantized weights
    fn defers_quantized(&self) -> bool {
        false
    }
}

/// Eager merge: decodes the weight if needed and adds every delta in f32.
///
/// The result keeps the dtype of the incoming weight. Full-precision inputs
/// stay on their device; quantized inputs are decoded on the merge's device.
#[derive(Debug, Clone, Default)]
pub struct NativeMerge {
    /// Decode target for quantized inputs, CPU when unset
    device: Option<Device>,
}

impl NativeMerge {
    /// Merge that decodes quantized inputs on `device`
    pub fn on(device: Device) -> Self {
        Self { device: Some(device) }
    }

    pub fn device(&self) -> Device {
        self.device.clone().unwrap_or(Device::Cpu)
    }
}

impl WeightMerge for NativeMerge {
    fn calculate_weight(&self, patches: &[WeightPatch], weight: Weight, key: &str) -> crate::Result<Weight> {
        let device = match &weight {
            Weight::Full(t) => t.device().clone(),
            Weight::Quantized(_) => self.device(),
        };
        let original = weight.into_tensor(&device)?;
        if patches.is_empty() {
            return Ok(Weight::Full(original));
        }

        let dtype = original.dtype();
        let mut merged = original.to_dtype(DType::F32)?;
        for patch in patches {
            let delta = patch.delta(merged.dims(), key, &device)?;
            merged = (merged + delta)?;
        }

        Ok(Weight::Full(merged.to_dtype(dtype)?))
    }
}
