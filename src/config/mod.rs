//! Configuration module for loader settings and architecture detection.

mod architecture;
mod loader_config;

pub use architecture::ModelArchitecture;
pub use loader_config::{LoaderConfig, CONFIG_PATH_ENV, MODEL_DIR_ENV};
