//! ONNX Runtime bring-up and image preprocessing for the YOLO adapter.

use super::decode::Letterbox;
use super::DetectorError;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::OnceLock;

/// Grey used for letterbox padding, matching the training pipeline.
const PAD_VALUE: u8 = 114;

static ORT_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Loads the ONNX Runtime dynamic library. Subsequent calls after a
/// successful initialisation are no-ops.
pub fn init_ort_runtime(dylib_path: impl AsRef<Path>) -> Result<(), DetectorError> {
    let path = dylib_path.as_ref();

    if ORT_INITIALIZED.get().is_some() {
        return Ok(());
    }

    if !path.exists() {
        return Err(DetectorError::ModelLoad {
            path: path.to_path_buf(),
            message: String::from("ONNX Runtime library not found"),
        });
    }

    let path_str = path.to_str().ok_or_else(|| DetectorError::ModelLoad {
        path: path.to_path_buf(),
        message: String::from("ONNX Runtime path contains invalid UTF-8"),
    })?;

    ort::init_from(path_str)
        .commit()
        .map_err(|error| DetectorError::ModelLoad {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;

    let _ = ORT_INITIALIZED.set(());
    Ok(())
}

/// Builds an inference session from a model file.
pub(super) fn load_session(model_path: &Path) -> Result<Session, DetectorError> {
    let fail = |message: String| DetectorError::ModelLoad {
        path: model_path.to_path_buf(),
        message,
    };

    if !model_path.exists() {
        return Err(fail(String::from("model file not found")));
    }

    let model_bytes = std::fs::read(model_path)
        .map_err(|e| fail(format!("failed to read model file: {}", e)))?;

    Session::builder()
        .map_err(|e| fail(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| fail(e.to_string()))?
        .with_intra_threads(4)
        .map_err(|e| fail(e.to_string()))?
        .commit_from_memory(&model_bytes)
        .map_err(|e| fail(e.to_string()))
}

/// Letterboxes the image at `image_path` into a normalised `[1, 3, S, S]`
/// RGB tensor.
pub(super) fn preprocess_image(
    image_path: &Path,
    input_size: u32,
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let image = image::open(image_path).map_err(|e| DetectorError::Invocation {
        path: image_path.to_path_buf(),
        message: format!("failed to decode image: {}", e),
    })?;
    let rgb = image.to_rgb8();
    let letterbox = Letterbox::new(rgb.width(), rgb.height(), input_size);

    let (width, height) = letterbox.scaled_size();
    let resized = imageops::resize(&rgb, width, height, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([PAD_VALUE; 3]));
    imageops::overlay(
        &mut canvas,
        &resized,
        letterbox.pad_x.floor() as i64,
        letterbox.pad_y.floor() as i64,
    );

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = pixel[channel] as f32 / 255.0;
        }
    }

    Ok((tensor, letterbox))
}
