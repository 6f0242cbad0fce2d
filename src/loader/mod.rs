//! State-dict loading from GGUF containers.
//!
//! This module provides:
//! - `load_state_dict`: map a GGUF file into named `QuantizedTensor`s without copying payloads
//! - `TypeSummary`: per-quantization-type tensor counts for a loaded file
//! - `UnetLoader`: name resolution, model construction and patch interception in one call

mod unet;

pub use unet::UnetLoader;

use std::collections::BTreeMap;
use std::path::Path;

use crate::gguf::{GgmlType, GgufReader};
use crate::quantization::{QuantizedTensor, Weight};

/// Number of tensors per quantization type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeSummary {
    counts: BTreeMap<GgmlType, usize>,
}

impl TypeSummary {
    fn record(&mut self, ggml_type: GgmlType) {
        *self.counts.entry(ggml_type).or_insert(0) += 1;
    }

    pub fn count(&self, ggml_type: GgmlType) -> usize {
        self.counts.get(&ggml_type).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GgmlType, usize)> + '_ {
        self.counts.iter().map(|(t, n)| (*t, *n))
    }

    fn log(&self, path: &Path) {
        tracing::info!("GGUF tensor types in {}:", path.display());
        for (ggml_type, count) in self.iter() {
            tracing::info!(" {:30}{:3}", ggml_type.name(), count);
        }
    }
}

/// Named quantized tensors read from one GGUF file.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: BTreeMap<String, QuantizedTensor>,
    summary: TypeSummary,
    architecture: Option<String>,
}

impl StateDict {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&QuantizedTensor> {
        self.tensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &QuantizedTensor)> {
        self.tensors.iter()
    }

    /// Tensor counts per quantization type, over every record in the file
    pub fn summary(&self) -> &TypeSummary {
        &self.summary
    }

    /// `general.architecture` from the container metadata
    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    /// Total encoded payload size in bytes
    pub fn encoded_size(&self) -> usize {
        self.tensors.values().map(QuantizedTensor::encoded_size).sum()
    }

    pub fn into_tensors(self) -> BTreeMap<String, QuantizedTensor> {
        self.tensors
    }

    /// Weights ready for `build_model_from_state_dict`
    pub fn into_weights(self) -> BTreeMap<String, Weight> {
        self.tensors
            .into_iter()
            .map(|(name, tensor)| (name, Weight::Quantized(tensor)))
            .collect()
    }
}

/// Read a GGUF file as a state dict of lazily decoded tensors.
///
/// Logical shapes are the container dimensions reversed. When a name occurs
/// more than once the later record wins.
pub fn load_state_dict(path: impl AsRef<Path>) -> crate::Result<StateDict> {
    let path = path.as_ref();
    let reader = GgufReader::open(path)?;

    let mut tensors = BTreeMap::new();
    let mut summary = TypeSummary::default();

    for record in reader.records() {
        summary.record(record.ggml_type);
        let tensor = QuantizedTensor::from_record(record)?;
        tracing::trace!("{}: {} {:?}", tensor.name(), tensor.ggml_type(), tensor.dims());

        if let Some(previous) = tensors.insert(tensor.name().to_string(), tensor) {
            tracing::warn!("Duplicate tensor '{}' in {}, keeping the later one", previous.name(), path.display());
        }
    }

    summary.log(path);

    Ok(StateDict {
        tensors,
        summary,
        architecture: reader.architecture().map(str::to_string),
    })
}
