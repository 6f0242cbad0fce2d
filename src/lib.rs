//! # rs-gguf-unet
//!
//! Lazy loading of GGUF-quantized diffusion models.
//!
//! ## Core Concept
//!
//! Weights stay in their on-disk quantized encoding until they are used:
//! - **Memory-mapped payloads**: tensor bytes are borrowed from the mapped file, never copied at load
//! - **Deferred dequantization**: a [`QuantizedTensor`] decodes to full precision only when materialized
//! - **Deferred patching**: LoRA/diff patches targeting a block-quantized weight are queued on
//!   the tensor and replayed after dequantization instead of being applied to packed bytes
//!
//! ## Example
//!
//! ```ignore
//! use rs_gguf_unet::{LoaderConfig, UnetLoader};
//!
//! fn main() -> rs_gguf_unet::Result<()> {
//!     let config = LoaderConfig::load()?;
//!     let loader = UnetLoader::from_config(&config)?;
//!     let mut model = loader.load_unet("flux1-dev-Q4_K.gguf")?;
//!     model.patch_weights()?;
//!     let layer = model.linear("double_blocks.0.img_attn.qkv")?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod gguf;
pub mod intercept;
pub mod loader;
pub mod model;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use config::{LoaderConfig, ModelArchitecture};
pub use gguf::{GgmlType, GgufReader, TensorRecord};
pub use intercept::{DeferredMerge, PatchInterceptor};
pub use loader::{load_state_dict, StateDict, TypeSummary, UnetLoader};
pub use model::{
    build_model_from_state_dict, BuildOptions, Model, NativeMerge, QuantEmbedding, QuantLinear,
    WeightMerge, WeightPatch,
};
pub use quantization::{PendingPatch, QuantizedTensor, RawData, Weight};
pub use utils::ModelPaths;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum GgufError {
    #[error("Failed to read GGUF container {path}: {reason}")]
    ContainerRead { path: String, reason: String },

    #[error("Could not detect model type of: {0}")]
    UnsupportedModel(String),

    #[error("No dequantization available for tensor '{tensor}' of type {qtype}")]
    UnsupportedQuantization { tensor: String, qtype: String },

    #[error("Invalid tensor '{tensor}': {reason}")]
    InvalidTensor { tensor: String, reason: String },

    #[error("Weight not found in model: {0}")]
    MissingWeight(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to merge patches into '{key}': {reason}")]
    Merge { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GgufError>;
