//! Diffusion model loading by file name.

use std::path::Path;

use super::load_state_dict;
use crate::config::LoaderConfig;
use crate::intercept::PatchInterceptor;
use crate::model::{build_model_from_state_dict, BuildOptions, Model};
use crate::utils::ModelPaths;

/// Loads GGUF diffusion models from the configured model directories.
#[derive(Debug, Clone)]
pub struct UnetLoader {
    paths: ModelPaths,
    options: BuildOptions,
}

impl UnetLoader {
    pub fn new(paths: ModelPaths, options: BuildOptions) -> Self {
        Self { paths, options }
    }

    pub fn from_config(config: &LoaderConfig) -> crate::Result<Self> {
        Ok(Self::new(config.model_paths(), config.build_options()?))
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    /// File names that can be passed to `load_unet`
    pub fn available_models(&self) -> Vec<String> {
        self.paths.list_filenames()
    }

    /// Resolve `name` in the model directories and load it
    pub fn load_unet(&self, name: &str) -> crate::Result<Model> {
        let path = self
            .paths
            .full_path(name)
            .ok_or_else(|| crate::GgufError::ModelNotFound(name.to_string()))?;
        self.load_unet_path(&path)
    }

    /// Load a GGUF diffusion model with patch interception installed
    pub fn load_unet_path(&self, path: &Path) -> crate::Result<Model> {
        tracing::info!("Loading diffusion model from {:?}", path);

        let state_dict = load_state_dict(path)?;
        let Some(mut model) = build_model_from_state_dict(state_dict.into_weights(), &self.options) else {
            tracing::error!("Unsupported diffusion model {}", path.display());
            return Err(crate::GgufError::UnsupportedModel(path.display().to_string()));
        };

        PatchInterceptor::install(&mut model);

        tracing::info!(
            "Loaded {} model with {} weights",
            model.architecture().name(),
            model.num_weights()
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelArchitecture;
    use crate::gguf::test_util::{f32_bytes, q8_0_bytes, GgufBuilder};
    use crate::gguf::{GgmlType, GgufReader};
    use crate::model::WeightPatch;
    use crate::quantization::Weight;
    use candle_core::{DType, Device, Tensor};
    use std::fs;

    const QKV: &str = "double_blocks.0.img_attn.qkv.weight";

    fn flux_fixture() -> GgufBuilder {
        GgufBuilder::new()
            .tensor("img_in.weight", &[2, 2], GgmlType::F32, f32_bytes(&[1.0, 2.0, 3.0, 4.0]))
            .tensor("img_in.bias", &[2], GgmlType::F32, f32_bytes(&[0.0, 0.0]))
            .tensor(QKV, &[32, 2], GgmlType::Q8_0, q8_0_bytes(0.5, &[2; 64]))
    }

    fn loader_for(dir: &Path) -> UnetLoader {
        UnetLoader::new(
            ModelPaths::new(vec![dir.to_path_buf()], vec!["gguf".to_string()]),
            BuildOptions::default(),
        )
    }

    #[test]
    fn test_load_unet_installs_interception() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("flux-Q8_0.gguf"), flux_fixture().to_bytes()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loader = loader_for(dir.path());
        assert_eq!(loader.available_models(), vec!["flux-Q8_0.gguf"]);

        let model = loader.load_unet("flux-Q8_0.gguf").unwrap();
        assert_eq!(model.architecture(), &ModelArchitecture::Flux);
        assert_eq!(model.num_weights(), 3);
        assert!(model.merge_strategy().defers_quantized());
    }

    #[test]
    fn test_clone_then_patch_only_touches_clone() {
        let file = flux_fixture().write_temp();
        let model = loader_for(Path::new("/")).load_unet_path(file.path()).unwrap();

        let mut clone = model.duplicate();
        let delta = Tensor::ones((2, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(clone.add_patches(QKV, vec![WeightPatch::Diff { delta, strength: 1.0 }]));
        clone.patch_weights().unwrap();

        let pending = |m: &Model| m.weight(QKV).and_then(Weight::as_quantized).unwrap().pending_patches().len();
        assert_eq!(pending(&clone), 1);
        assert_eq!(pending(&model), 0);

        let layer = clone.linear("double_blocks.0.img_attn.qkv").unwrap();
        let x = Tensor::ones((1, 32), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<f32> = layer.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![64.0, 64.0]);
    }

    #[test]
    fn test_unsupported_model_names_path() {
        let file = GgufBuilder::new()
            .tensor("text_model.embeddings.weight", &[4], GgmlType::F32, f32_bytes(&[0.0; 4]))
            .write_temp();

        let err = loader_for(Path::new("/")).load_unet_path(file.path()).unwrap_err();
        match err {
            crate::GgufError::UnsupportedModel(path) => assert_eq!(path, file.path().display().to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader_for(dir.path()).load_unet("missing.gguf").unwrap_err();
        assert!(matches!(err, crate::GgufError::ModelNotFound(_)));
    }

    #[test]
    fn test_fixture_is_well_formed() {
        let file = flux_fixture().write_temp();
        assert_eq!(GgufReader::open(file.path()).unwrap().tensor_count(), 3);
    }
}
