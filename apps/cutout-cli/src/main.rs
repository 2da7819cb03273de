use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use cutout_core::{run_removal, AlphaRefinement, RemovalRequest};
use cutout_model_registry::KnownModel;
use cutout_runtime_ort::OrtRemover;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cutout", version, about = "Remove the background from an image and write it as PNG")]
struct Cli {
    /// Image to cut out.
    #[arg(long = "in", value_name = "PATH")]
    input: PathBuf,
    /// Destination file. Always PNG-encoded, whatever the extension.
    #[arg(long = "out", value_name = "PATH")]
    output: PathBuf,
    /// Binarize alpha at this cutoff (clamped to 0..=255).
    #[arg(long, allow_negative_numbers = true)]
    threshold: Option<i64>,
    /// Gaussian blur radius applied to alpha, in pixels.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    feather: i64,
    /// Erosion radius applied to alpha, in pixels.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    erode: i64,
    /// Segmentation model: u2net, u2netp or isnet-general-use.
    #[arg(long, default_value = "u2net", value_parser = parse_model_choice)]
    model: KnownModel,
    /// Model cache root (defaults to ~/.cutout/models).
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn refinement(&self) -> AlphaRefinement {
        AlphaRefinement {
            threshold: self.threshold,
            feather: self.feather,
            erode: self.erode,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let remover = OrtRemover::new(cli.model, cli.model_dir.clone());
    let request = RemovalRequest {
        refinement: cli.refinement(),
        input_path: cli.input,
        output_path: cli.output,
    };
    run_removal(&remover, &request)?;
    Ok(())
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(verbosity_to_filter(verbosity))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}

fn verbosity_to_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn parse_model_choice(model: &str) -> Result<KnownModel, String> {
    let lowered = model.to_ascii_lowercase();
    let model_id = match lowered.as_str() {
        "isnet" => "isnet-general-use",
        other => other,
    };
    KnownModel::from_model_id(model_id)
        .ok_or_else(|| format!("unknown model '{}'; expected one of: u2net, u2netp, isnet-general-use", model))
}
