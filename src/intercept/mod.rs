//! Weight-patch interception.
//!
//! Merging a patch directly into block-quantized bytes would corrupt them, so
//! a model's merge entry point is decorated with [`DeferredMerge`]:
//! - Full-precision weights and dense GGUF tags go straight to the original merge
//! - Block-quantized weights get the merge queued on the tensor and are returned as-is
//!
//! [`PatchInterceptor`] installs the decorator and re-installs it on every
//! duplicate, each time around that instance's own native merge.

use std::sync::Arc;

use crate::model::{CloneHook, Model, WeightMerge, WeightPatch};
use crate::quantization::{PendingPatch, Weight};

/// Merge strategy that defers patches on block-quantized weights.
pub struct DeferredMerge {
    original: Arc<dyn WeightMerge>,
}

impl DeferredMerge {
    pub fn new(original: Arc<dyn WeightMerge>) -> Self {
        Self { original }
    }

    /// The merge this strategy delegates to and queues for replay
    pub fn original(&self) -> &Arc<dyn WeightMerge> {
        &self.original
    }
}

impl WeightMerge for DeferredMerge {
    fn calculate_weight(&self, patches: &[WeightPatch], weight: Weight, key: &str) -> crate::Result<Weight> {
        match weight {
            Weight::Quantized(mut tensor) if !tensor.is_dense() => {
                tensor.enqueue_patch(PendingPatch::new(self.original.clone(), patches.to_vec(), key));
                Ok(Weight::Quantized(tensor))
            }
            weight => self.original.calculate_weight(patches, weight, key),
        }
    }

    fn defers_quantized(&self) -> bool {
        true
    }
}

/// Installs [`DeferredMerge`] on a model and keeps it installed across duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchInterceptor;

impl PatchInterceptor {
    /// Decorate the model's merge entry point. A model that already defers is left alone.
    pub fn install(model: &mut Model) {
        if model.merge_strategy().defers_quantized() {
            tracing::debug!("Patch interception already installed");
            return;
        }

        let original = model.merge_strategy().clone();
        model.set_merge_strategy(Arc::new(DeferredMerge::new(original)));
        model.set_clone_hook(Arc::new(PatchInterceptor));
    }
}

impl CloneHook for PatchInterceptor {
    fn after_clone(&self, model: &mut Model) {
        Self::install(model);
    }
}
