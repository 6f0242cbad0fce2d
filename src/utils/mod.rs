//! Utility modules for devices, model paths, and sizes.

mod device;
mod memory;
mod paths;

pub use device::{get_device, parse_dtype};
pub use memory::format_bytes;
pub use paths::ModelPaths;
