//! Diffusion model architecture detection from weight names.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Supported diffusion model architectures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelArchitecture {
    Flux,
    Sd3,
    AuraFlow,
    Ltxv,
    Sdxl,
    Sd15,
}

impl ModelArchitecture {
    /// Detect architecture from the weight names of a state dict
    pub fn detect<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let keys: HashSet<&str> = keys.into_iter().collect();

        if keys.contains("double_blocks.0.img_attn.qkv.weight") {
            Some(ModelArchitecture::Flux)
        } else if keys.contains("joint_blocks.0.context_block.attn.qkv.weight") {
            Some(ModelArchitecture::Sd3)
        } else if keys.contains("double_layers.0.attn.w1q.weight") {
            Some(ModelArchitecture::AuraFlow)
        } else if keys.contains("adaln_single.emb.timestep_embedder.linear_1.weight") {
            Some(ModelArchitecture::Ltxv)
        } else if keys.contains("input_blocks.0.0.weight") {
            // Class-conditioned UNets carry a label embedding
            if keys.contains("label_emb.0.0.weight") {
                Some(ModelArchitecture::Sdxl)
            } else {
                Some(ModelArchitecture::Sd15)
            }
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelArchitecture::Flux => "flux",
            ModelArchitecture::Sd3 => "sd3",
            ModelArchitecture::AuraFlow => "auraflow",
            ModelArchitecture::Ltxv => "ltxv",
            ModelArchitecture::Sdxl => "sdxl",
            ModelArchitecture::Sd15 => "sd15",
        }
    }
}
