//! gguf-unet CLI - inspect and load GGUF diffusion models
//!
//! Tensors stay quantized on disk until used; this tool lists, inspects and
//! test-loads model files without materializing more than asked.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rs_gguf_unet::{
    load_state_dict, utils::format_bytes, GgufError, GgufReader, LoaderConfig, UnetLoader,
};

#[derive(Parser)]
#[command(name = "gguf-unet")]
#[command(author, version, about = "Lazy GGUF diffusion model loader", long_about = None)]
struct Cli {
    /// Loader config file (JSON)
    #[arg(long, global = true, env = "GGUF_UNET_CONFIG")]
    config: Option<PathBuf>,

    /// Extra model directory, searched first
    #[arg(long, global = true, env = "GGUF_UNET_DIR")]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loadable model files
    List,

    /// Show tensor type counts and metadata of a model file
    Inspect {
        /// Model name (as listed) or path
        model: String,
    },

    /// Load a model and report the detected architecture
    Load {
        /// Model name (as listed) or path
        model: String,
    },

    /// Dequantize every tensor to check the file decodes
    Verify {
        /// Model name (as listed) or path
        model: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_gguf_unet=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::default(),
    };
    config.apply_model_dir(cli.model_dir.clone());
    let loader = UnetLoader::from_config(&config)?;

    match cli.command {
        Commands::List => {
            let models = loader.available_models();
            if models.is_empty() {
                println!("No models found in {:?}", loader.paths().roots());
            }
            for name in models {
                println!("{}", name);
            }
        }

        Commands::Inspect { model } => {
            inspect(&resolve(&loader, &model)?)?;
        }

        Commands::Load { model } => {
            let model = loader.load_unet_path(&resolve(&loader, &model)?)?;
            println!("Architecture: {}", model.architecture().name());
            println!("Weights:      {}", model.num_weights());
            println!("Device:       {:?}", model.device());
        }

        Commands::Verify { model } => {
            verify(&resolve(&loader, &model)?)?;
        }
    }

    Ok(())
}

/// Accept either an existing path or a name relative to the model directories
fn resolve(loader: &UnetLoader, model: &str) -> rs_gguf_unet::Result<PathBuf> {
    let path = Path::new(model);
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    loader
        .paths()
        .full_path(model)
        .ok_or_else(|| GgufError::ModelNotFound(model.to_string()))
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let reader = GgufReader::open(path)?;
    println!("File:         {}", path.display());
    println!("GGUF version: {}", reader.version());
    println!("Architecture: {}", reader.architecture().unwrap_or("<unset>"));
    println!("File size:    {}", format_bytes(reader.file_size() as u64));
    println!("Metadata:     {} entries", reader.metadata().len());

    let state_dict = load_state_dict(path)?;
    println!("Tensors:      {}", state_dict.len());
    for (ggml_type, count) in state_dict.summary().iter() {
        println!("  {:30}{:5}", ggml_type.name(), count);
    }
    println!("Payload:      {}", format_bytes(state_dict.encoded_size() as u64));

    Ok(())
}

fn verify(path: &Path) -> anyhow::Result<()> {
    let state_dict = load_state_dict(path)?;
    let device = candle_core::Device::Cpu;

    let pb = ProgressBar::new(state_dict.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} Decoding tensors")?,
    );

    let mut unsupported = Vec::new();
    for (name, tensor) in state_dict.iter() {
        match tensor.dequantize(&device) {
            Ok(_) => {}
            Err(GgufError::UnsupportedQuantization { qtype, .. }) => unsupported.push((name.clone(), qtype)),
            Err(e) => {
                pb.abandon();
                return Err(e.into());
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if unsupported.is_empty() {
        println!("All {} tensors decode", state_dict.len());
    } else {
        println!("{} tensors use types without a decoder:", unsupported.len());
        for (name, qtype) in unsupported {
            println!("  {} ({})", name, qtype);
        }
    }
    Ok(())
}
