use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Result};
use cutout_core::{BackgroundRemover, CoreError};
use cutout_installer::ensure_model;
use cutout_model_registry::KnownModel;
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Luma};
use ndarray::ArrayViewD;
use ort::{inputs, session::Session, value::Tensor};
use tracing::{debug, info};

/// Square input resolution and per-channel normalisation a model expects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn input_spec(model: KnownModel) -> InputSpec {
    match model {
        KnownModel::U2net | KnownModel::U2netp => InputSpec {
            size: 320,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        },
        KnownModel::IsnetGeneralUse => InputSpec {
            size: 1024,
            mean: [0.5, 0.5, 0.5],
            std: [1.0, 1.0, 1.0],
        },
    }
}

/// Background remover backed by a salient-object segmentation network run
/// through ONNX Runtime. The model file is installed on the first call to
/// `remove`, after the input has decoded.
#[derive(Debug, Clone)]
pub struct OrtRemover {
    model: KnownModel,
    model_dir: Option<PathBuf>,
}

impl OrtRemover {
    pub fn new(model: KnownModel, model_dir: Option<PathBuf>) -> Self {
        Self { model, model_dir }
    }

    fn predict_mask(&self, image: &DynamicImage) -> Result<GrayImage> {
        let installed = ensure_model(self.model, self.model_dir.as_deref())?;
        info!(model = %self.model, outcome = ?installed.outcome, "model ready");

        let spec = input_spec(self.model);
        let side = spec.size as usize;
        let input = Tensor::<f32>::from_array(([1usize, 3, side, side], preprocess(image, &spec)))?;

        let mut session = build_session(&installed.path)?;
        let start = Instant::now();
        let outputs = session.run(inputs![input])?;
        if outputs.len() == 0 {
            return Err(anyhow!("model returned no outputs"));
        }
        let prediction = outputs[0].try_extract_array::<f32>()?;
        debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            shape = ?prediction.shape(),
            "inference complete"
        );

        let mask = normalize_prediction(prediction)?;
        Ok(imageops::resize(&mask, image.width(), image.height(), FilterType::Lanczos3))
    }
}

impl BackgroundRemover for OrtRemover {
    fn remove(&self, image: &DynamicImage) -> Result<DynamicImage, CoreError> {
        let mask = self
            .predict_mask(image)
            .map_err(|e| CoreError::Model(format!("{}: {:#}", self.model, e)))?;
        let cutout = cutout_image::naive_cutout(&image.to_rgba8(), &mask)?;
        Ok(DynamicImage::ImageRgba8(cutout))
    }
}

fn build_session(model_file: &Path) -> Result<Session> {
    let builder = Session::builder()?;
    #[cfg(feature = "cuda")]
    let builder = builder.with_execution_providers([ort::execution_providers::CUDAExecutionProvider::default().build()])?;
    #[cfg(feature = "coreml")]
    let builder = builder.with_execution_providers([ort::execution_providers::CoreMLExecutionProvider::default().build()])?;
    #[cfg(feature = "directml")]
    let builder =
        builder.with_execution_providers([ort::execution_providers::DirectMLExecutionProvider::default().build()])?;
    debug!(path = %model_file.display(), "loading onnx session");
    Ok(builder.commit_from_file(model_file)?)
}

/// Drops alpha, resizes to the model resolution and lays the pixels out as a
/// normalised NCHW buffer. Pixels are first scaled by the brightest sample in
/// the image.
pub fn preprocess(image: &DynamicImage, spec: &InputSpec) -> Vec<f32> {
    let side = spec.size;
    let resized = imageops::resize(&image.to_rgb8(), side, side, FilterType::Lanczos3);
    let peak = resized.as_raw().iter().copied().max().unwrap_or(0) as f32;
    let scale = peak.max(1e-6);

    let plane = side as usize * side as usize;
    let mut data = vec![0f32; 3 * plane];
    for (idx, px) in resized.pixels().enumerate() {
        for c in 0..3 {
            let value = px[c] as f32 / scale;
            data[c * plane + idx] = (value - spec.mean[c]) / spec.std[c];
        }
    }
    data
}

/// Turns the first channel of the raw network output into an 8-bit mask at
/// model resolution, stretched so the weakest prediction maps to 0 and the
/// strongest to 255.
pub fn normalize_prediction(prediction: ArrayViewD<'_, f32>) -> Result<GrayImage> {
    let (mask_h, mask_w) = match prediction.ndim() {
        4 => (prediction.shape()[2], prediction.shape()[3]),
        3 => (prediction.shape()[1], prediction.shape()[2]),
        2 => (prediction.shape()[0], prediction.shape()[1]),
        _ => return Err(anyhow!("unsupported output dimensions: {:?}", prediction.shape())),
    };
    let at = |y: usize, x: usize| match prediction.ndim() {
        4 => prediction[[0, 0, y, x]],
        3 => prediction[[0, y, x]],
        _ => prediction[[y, x]],
    };

    let mut min_v = f32::INFINITY;
    let mut max_v = f32::NEG_INFINITY;
    for y in 0..mask_h {
        for x in 0..mask_w {
            let v = at(y, x);
            min_v = min_v.min(v);
            max_v = max_v.max(v);
        }
    }
    let range = (max_v - min_v).max(1e-6);

    Ok(GrayImage::from_fn(mask_w as u32, mask_h as u32, |x, y| {
        let normalized = ((at(y as usize, x as usize) - min_v) / range).clamp(0.0, 1.0);
        Luma([(normalized * 255.0) as u8])
    }))
}
