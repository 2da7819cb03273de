use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageReader, RgbaImage};
use thiserror::Error;
use tracing::{debug, info, info_span};

pub use cutout_image::{AlphaError, AlphaRefinement};

/// Anything that can turn a decoded image into one whose background is
/// transparent. The returned image may use any colour type; the pipeline
/// normalises it to RGBA.
pub trait BackgroundRemover: Send + Sync {
    fn remove(&self, image: &DynamicImage) -> Result<DynamicImage, CoreError>;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read input {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("background removal failed: {0}")]
    Model(String),
    #[error(transparent)]
    Alpha(#[from] AlphaError),
    #[error("failed to write {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
}

#[derive(Debug, Clone)]
pub struct RemovalRequest {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub refinement: AlphaRefinement,
}

#[derive(Debug, Clone)]
pub struct RemovalReport {
    pub width: u32,
    pub height: u32,
    pub refined: bool,
    pub output_path: PathBuf,
}

/// Removes the background of `request.input_path` and writes the result as
/// PNG to `request.output_path`, refining alpha on the way when asked to.
///
/// The output is PNG-encoded whatever extension the output path carries.
pub fn run_removal(remover: &dyn BackgroundRemover, request: &RemovalRequest) -> Result<RemovalReport, CoreError> {
    let span = info_span!("run_removal", input = %request.input_path.display());
    let _guard = span.enter();

    prepare_output_dir(&request.output_path)?;

    let removed = {
        let source = load_input(&request.input_path)?;
        debug!(width = source.width(), height = source.height(), "decoded input");
        remover.remove(&source)?
    };

    let mut cutout = removed.to_rgba8();
    let refined = cutout_image::refine_alpha(&mut cutout, &request.refinement)?;
    write_png(&request.output_path, &cutout)?;

    let (width, height) = cutout.dimensions();
    info!(output = %request.output_path.display(), width, height, refined, "wrote cutout");
    Ok(RemovalReport {
        width,
        height,
        refined,
        output_path: request.output_path.clone(),
    })
}

fn prepare_output_dir(output_path: &Path) -> Result<(), CoreError> {
    let Some(parent) = output_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).map_err(|source| CoreError::OutputDir {
        path: parent.to_path_buf(),
        source,
    })
}

/// Decodes the input and applies its EXIF orientation, so a rotated photo
/// comes out upright.
fn load_input(path: &Path) -> Result<DynamicImage, CoreError> {
    let input_error = |source| CoreError::Input {
        path: path.to_path_buf(),
        source,
    };
    let mut decoder = ImageReader::open(path)
        .map_err(|e| input_error(ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| input_error(ImageError::IoError(e)))?
        .into_decoder()
        .map_err(input_error)?;
    let orientation = decoder.orientation().map_err(input_error)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(input_error)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn write_png(path: &Path, image: &RgbaImage) -> Result<(), CoreError> {
    let encode_error = |source| CoreError::Encode {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(|e| encode_error(ImageError::IoError(e)))?;
    let mut writer = BufWriter::new(file);
    image.write_to(&mut writer, ImageFormat::Png).map_err(encode_error)?;
    writer.flush().map_err(|e| encode_error(ImageError::IoError(e)))
}
