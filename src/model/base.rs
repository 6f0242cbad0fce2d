//! Model container with explicit merge and clone entry points.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Device};

use super::merge::{NativeMerge, WeightMerge, WeightPatch};
use super::ops::{QuantEmbedding, QuantLinear};
use super::BuildOptions;
use crate::config::ModelArchitecture;
use crate::quantization::Weight;

/// Runs on every freshly duplicated model before it is handed out.
pub trait CloneHook: Send + Sync {
    fn after_clone(&self, model: &mut Model);
}

/// A loaded diffusion model.
///
/// Weight merges go through the active [`WeightMerge`] strategy. Duplicating a
/// model resets the strategy to the native one and then runs the clone hook,
/// so decorators are re-applied per instance instead of being inherited.
pub struct Model {
    architecture: ModelArchitecture,
    weights: BTreeMap<String, Weight>,
    /// Patches registered per weight key, merged by `patch_weights`
    patches: BTreeMap<String, Vec<WeightPatch>>,
    native_merge: Arc<dyn WeightMerge>,
    merge: Arc<dyn WeightMerge>,
    clone_hook: Option<Arc<dyn CloneHook>>,
    device: Device,
    dtype: DType,
}

impl Model {
    /// Create a model using the native eager merge
    pub fn new(architecture: ModelArchitecture, weights: BTreeMap<String, Weight>, options: &BuildOptions) -> Self {
        let native: Arc<dyn WeightMerge> = Arc::new(NativeMerge::on(options.device.clone()));
        Self {
            architecture,
            weights,
            patches: BTreeMap::new(),
            native_merge: native.clone(),
            merge: native,
            clone_hook: None,
            device: options.device.clone(),
            dtype: options.dtype,
        }
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    /// Device weights are materialized on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Compute dtype for materialized weights
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn weights(&self) -> &BTreeMap<String, Weight> {
        &self.weights
    }

    pub fn weight(&self, key: &str) -> Option<&Weight> {
        self.weights.get(key)
    }

    pub fn weight_mut(&mut self, key: &str) -> Option<&mut Weight> {
        self.weights.get_mut(key)
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// Active merge strategy
    pub fn merge_strategy(&self) -> &Arc<dyn WeightMerge> {
        &self.merge
    }

    pub fn set_merge_strategy(&mut self, merge: Arc<dyn WeightMerge>) {
        self.merge = merge;
    }

    pub fn set_clone_hook(&mut self, hook: Arc<dyn CloneHook>) {
        self.clone_hook = Some(hook);
    }

    /// Register patches for a weight. Returns false if the model has no such weight.
    pub fn add_patches(&mut self, key: &str, patches: Vec<WeightPatch>) -> bool {
        if !self.weights.contains_key(key) {
            tracing::debug!("Ignoring patches for unknown weight {}", key);
            return false;
        }
        self.patches.entry(key.to_string()).or_default().extend(patches);
        true
    }

    pub fn patches_for(&self, key: &str) -> &[WeightPatch] {
        self.patches.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Merge entry point: dispatches through the active strategy
    pub fn calculate_weight(&self, patches: &[WeightPatch], weight: Weight, key: &str) -> crate::Result<Weight> {
        self.merge.calculate_weight(patches, weight, key)
    }

    /// Merge every registered patch set into its weight, consuming the registrations.
    ///
    /// Keys are merged in order. On error, keys merged so far stay merged and the
    /// failing key plus every later one keep their registrations.
    pub fn patch_weights(&mut self) -> crate::Result<usize> {
        let mut pending = std::mem::take(&mut self.patches).into_iter();
        let mut count = 0;

        while let Some((key, patches)) = pending.next() {
            match self.merge_registered(&key, &patches) {
                Ok(merged) => {
                    self.weights.insert(key, merged);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!("Merging patches into {} failed: {}", key, e);
                    self.patches.insert(key, patches);
                    self.patches.extend(pending);
                    return Err(e);
                }
            }
        }

        tracing::debug!("Merged patches into {} weights", count);
        Ok(count)
    }

    fn merge_registered(&self, key: &str, patches: &[WeightPatch]) -> crate::Result<Weight> {
        let weight = self.require(key)?;
        self.calculate_weight(patches, weight, key)
    }

    /// Clone entry point.
    ///
    /// Weights are duplicated per instance (encoded bytes stay shared) and the
    /// copy starts from the native merge strategy before the clone hook runs.
    pub fn duplicate(&self) -> Model {
        let mut copy = Model {
            architecture: self.architecture.clone(),
            weights: self.weights.clone(),
            patches: self.patches.clone(),
            native_merge: self.native_merge.clone(),
            merge: self.native_merge.clone(),
            clone_hook: None,
            device: self.device.clone(),
            dtype: self.dtype,
        };

        if let Some(hook) = &self.clone_hook {
            hook.after_clone(&mut copy);
        }
        copy
    }

    fn require(&self, key: &str) -> crate::Result<Weight> {
        self.weights
            .get(key)
            .cloned()
            .ok_or_else(|| crate::GgufError::MissingWeight(key.to_string()))
    }

    /// Linear layer reading `<prefix>.weight` and optional `<prefix>.bias`
    pub fn linear(&self, prefix: &str) -> crate::Result<QuantLinear> {
        let weight = self.require(&format!("{}.weight", prefix))?;
        let bias = self.weights.get(&format!("{}.bias", prefix)).cloned();
        Ok(QuantLinear::new(prefix, weight, bias, self.dtype))
    }

    /// Embedding table reading `<prefix>.weight`
    pub fn embedding(&self, prefix: &str) -> crate::Result<QuantEmbedding> {
        let weight = self.require(&format!("{}.weight", prefix))?;
        QuantEmbedding::new(prefix, weight, self.dtype)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("architecture", &self.architecture)
            .field("num_weights", &self.weights.len())
            .field("num_patched_keys", &self.patches.len())
            .field("defers_quantized", &self.merge.defers_quantized())
            .finish()
    }
}
