//! Host-side model: named weights, the merge entry point and weight-aware layers.

mod base;
mod builder;
mod merge;
mod ops;

pub use base::{CloneHook, Model};
pub use builder::{build_model_from_state_dict, BuildOptions};
pub use merge::{NativeMerge, WeightMerge, WeightPatch};
pub use ops::{QuantEmbedding, QuantLinear};
