//! Loader configuration: model search paths, accepted extensions, device and dtype.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::BuildOptions;
use crate::utils::{get_device, parse_dtype, ModelPaths};

/// Environment variable naming an extra model directory (searched first)
pub const MODEL_DIR_ENV: &str = "GGUF_UNET_DIR";

/// Environment variable naming the JSON config file
pub const CONFIG_PATH_ENV: &str = "GGUF_UNET_CONFIG";

/// Loader configuration, usually read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories searched for diffusion models
    pub model_dirs: Vec<PathBuf>,

    /// Accepted file extensions, without the dot
    pub extensions: Vec<String>,

    /// Accelerator ordinal (CPU when absent or unavailable)
    pub device: Option<usize>,

    /// Compute dtype for materialized weights
    pub dtype: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            model_dirs: vec![PathBuf::from("models").join("unet")],
            extensions: vec!["gguf".to_string()],
            device: None,
            dtype: "f32".to_string(),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoaderConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Configuration from `GGUF_UNET_CONFIG` (or defaults), with `GGUF_UNET_DIR` applied
    pub fn load() -> crate::Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                tracing::debug!("Reading loader config from {}", path);
                Self::from_file(path)?
            }
            Err(_) => Self::default(),
        };

        config.apply_model_dir(std::env::var(MODEL_DIR_ENV).ok().map(PathBuf::from));
        Ok(config)
    }

    /// Put `dir` in front of the search path
    pub fn apply_model_dir(&mut self, dir: Option<PathBuf>) {
        if let Some(dir) = dir {
            self.model_dirs.retain(|d| d != &dir);
            self.model_dirs.insert(0, dir);
        }
    }

    /// Path resolver restricted to the configured extensions
    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::new(self.model_dirs.clone(), self.extensions.clone())
    }

    /// Device and dtype for model construction
    pub fn build_options(&self) -> crate::Result<BuildOptions> {
        let dtype = parse_dtype(&self.dtype)
            .ok_or_else(|| crate::GgufError::Config(format!("unknown dtype '{}'", self.dtype)))?;
        Ok(BuildOptions {
            device: get_device(self.device)?,
            dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"model_dirs": ["/data/unet"], "dtype": "bf16"}}"#).unwrap();

        let config = LoaderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model_dirs, vec![PathBuf::from("/data/unet")]);
        assert_eq!(config.extensions, vec!["gguf".to_string()]);
        assert_eq!(config.build_options().unwrap().dtype, DType::BF16);
    }

    #[test]
    fn test_model_dir_override_goes_first() {
        let mut config = LoaderConfig {
            model_dirs: vec![PathBuf::from("a"), PathBuf::from("b")],
            ..Default::default()
        };
        config.apply_model_dir(Some(PathBuf::from("b")));
        assert_eq!(config.model_dirs, vec![PathBuf::from("b"), PathBuf::from("a")]);

        config.apply_model_dir(None);
        assert_eq!(config.model_dirs.len(), 2);
    }

    #[test]
    fn test_unknown_dtype() {
        let config = LoaderConfig {
            dtype: "int3".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.build_options(), Err(crate::GgufError::Config(_))));
    }
}
