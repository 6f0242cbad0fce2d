//! Model construction from a raw state dict.

use std::collections::BTreeMap;

use candle_core::{DType, Device};

use super::base::Model;
use crate::config::ModelArchitecture;
use crate::quantization::Weight;

/// Prefix used by checkpoints that bundle the diffusion model with other components
const DIFFUSION_MODEL_PREFIX: &str = "model.diffusion_model.";

/// Options for building a model
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Device weights are materialized on
    pub device: Device,
    /// Compute dtype of weight-aware layers
    pub dtype: DType,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }
}

/// Build a model from named weights.
///
/// Returns `None` when no supported architecture matches the weight names.
pub fn build_model_from_state_dict(state_dict: BTreeMap<String, Weight>, options: &BuildOptions) -> Option<Model> {
    let state_dict = strip_common_prefix(state_dict, DIFFUSION_MODEL_PREFIX);

    let architecture = ModelArchitecture::detect(state_dict.keys().map(String::as_str))?;
    tracing::info!("Detected architecture: {:?}", architecture);

    Some(Model::new(architecture, state_dict, options))
}

/// Drop `prefix` from every key, but only when all keys carry it
fn strip_common_prefix(state_dict: BTreeMap<String, Weight>, prefix: &str) -> BTreeMap<String, Weight> {
    if state_dict.is_empty() || !state_dict.keys().all(|k| k.starts_with(prefix)) {
        return state_dict;
    }

    tracing::debug!("Stripping '{}' from {} weight names", prefix, state_dict.len());
    state_dict
        .into_iter()
        .map(|(k, v)| (k[prefix.len()..].to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    fn weight() -> Weight {
        Weight::Full(Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap())
    }

    #[test]
    fn test_detects_prefixed_flux() {
        let mut sd = BTreeMap::new();
        sd.insert("model.diffusion_model.double_blocks.0.img_attn.qkv.weight".to_string(), weight());
        sd.insert("model.diffusion_model.final_layer.linear.weight".to_string(), weight());

        let model = build_model_from_state_dict(sd, &BuildOptions::default()).unwrap();
        assert_eq!(model.architecture(), &ModelArchitecture::Flux);
        assert!(model.weight("double_blocks.0.img_attn.qkv.weight").is_some());
    }

    #[test]
    fn test_keeps_mixed_prefixes() {
        let mut sd = BTreeMap::new();
        sd.insert("model.diffusion_model.input_blocks.0.0.weight".to_string(), weight());
        sd.insert("first_stage_model.decoder.conv_in.weight".to_string(), weight());

        assert!(build_model_from_state_dict(sd, &BuildOptions::default()).is_none());
    }

    #[test]
    fn test_unknown_architecture() {
        let mut sd = BTreeMap::new();
        sd.insert("encoder.layer.0.weight".to_string(), weight());

        assert!(build_model_from_state_dict(sd, &BuildOptions::default()).is_none());
    }
}
