//! Object detection boundary.
//!
//! The pipeline never looks inside a model. It hands an image path to an
//! [`ObjectDetector`] and gets back a list of [`Detection`]s. The shipped
//! implementation is [`YoloDetector`], which runs YOLO-family ONNX exports
//! through a dynamically loaded ONNX Runtime (feature `onnx`).

pub mod decode;
pub mod labels;
#[cfg(feature = "onnx")]
mod runtime;
#[cfg(feature = "onnx")]
mod yolo;

#[cfg(feature = "onnx")]
pub use runtime::init_ort_runtime;
#[cfg(feature = "onnx")]
pub use yolo::YoloDetector;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Axis-aligned box in source image pixels, serialised as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with `other`, 0.0 when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(value: [f32; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(value: BoundingBox) -> Self {
        [value.x1, value.y1, value.x2, value.y2]
    }
}

/// One object instance found in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bounding_box: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bounding_box,
        }
    }
}

/// Anything that can turn an image file into detections.
///
/// Implementations may keep mutable inference state, so `detect` takes
/// `&mut self`; the scanner serialises calls behind a mutex.
pub trait ObjectDetector: Send {
    fn detect(&mut self, image: &Path) -> Result<Vec<Detection>, DetectorError>;

    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(&mut self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(image)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Builds its inner detector on the first `detect` call, so a pass served
/// entirely from the cache never loads a model.
///
/// A failed load is remembered and reported again on every later call.
pub struct LazyDetector<D, F> {
    state: LazyState<D, F>,
}

enum LazyState<D, F> {
    Pending(F),
    Ready(D),
    Failed { path: PathBuf, message: String },
}

impl<D, F> LazyDetector<D, F>
where
    D: ObjectDetector,
    F: FnOnce() -> Result<D, DetectorError> + Send,
{
    pub fn new(load: F) -> Self {
        Self {
            state: LazyState::Pending(load),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LazyState::Ready(_))
    }

    fn ready(&mut self) -> Result<&mut D, DetectorError> {
        if matches!(self.state, LazyState::Pending(_)) {
            let pending = std::mem::replace(
                &mut self.state,
                LazyState::Failed {
                    path: PathBuf::new(),
                    message: String::from("detector construction panicked"),
                },
            );
            if let LazyState::Pending(load) = pending {
                match load() {
                    Ok(detector) => {
                        info!(name = detector.name(), "detector loaded");
                        self.state = LazyState::Ready(detector);
                    }
                    Err(error) => {
                        let message = match &error {
                            DetectorError::ModelLoad { message, .. } => message.clone(),
                            other => other.to_string(),
                        };
                        self.state = LazyState::Failed {
                            path: error.path().to_path_buf(),
                            message,
                        };
                        return Err(error);
                    }
                }
            }
        }

        match &mut self.state {
            LazyState::Ready(detector) => Ok(detector),
            LazyState::Failed { path, message } => Err(DetectorError::ModelLoad {
                path: path.clone(),
                message: message.clone(),
            }),
            LazyState::Pending(_) => Err(DetectorError::ModelLoad {
                path: PathBuf::new(),
                message: String::from("detector was never loaded"),
            }),
        }
    }
}

impl<D, F> ObjectDetector for LazyDetector<D, F>
where
    D: ObjectDetector,
    F: FnOnce() -> Result<D, DetectorError> + Send,
{
    fn detect(&mut self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        self.ready()?.detect(image)
    }

    fn name(&self) -> &str {
        match &self.state {
            LazyState::Ready(detector) => detector.name(),
            _ => "lazy detector",
        }
    }
}

/// Settings for the shipped YOLO adapter, stored under `[detector]` in the
/// configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Path to the ONNX model export.
    pub model_path: PathBuf,
    /// Path to the ONNX Runtime dynamic library.
    pub ort_library: PathBuf,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Candidates below this class score are dropped before NMS.
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Inline class names; takes precedence over `labels_file`.
    pub labels: Vec<String>,
    /// One class name per line.
    pub labels_file: Option<PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolo11x.onnx"),
            ort_library: default_ort_library(),
            input_size: 640,
            score_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            labels: Vec::new(),
            labels_file: None,
        }
    }
}

fn default_ort_library() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(".vendor/onnxruntime/lib/onnxruntime.dll")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from(".vendor/onnxruntime/lib/libonnxruntime.dylib")
    }
    #[cfg(not(any(windows, target_os = "macos")))]
    {
        PathBuf::from(".vendor/onnxruntime/lib/libonnxruntime.so")
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    /// The model or runtime could not be brought up. Fatal for the run.
    #[error("failed to load model {}: {message}", path.display())]
    ModelLoad { path: PathBuf, message: String },
    /// A single image could not be run through the model.
    #[error("detection failed for {}: {message}", path.display())]
    Invocation { path: PathBuf, message: String },
    #[error("failed to read labels from {}: {source}", path.display())]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DetectorError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Invocation { .. })
    }

    /// Model, labels file or image the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            Self::ModelLoad { path, .. } | Self::Invocation { path, .. } | Self::Labels { path, .. } => {
                path
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_serialises_as_array() {
        let detection = Detection::new("cat", 0.5, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        let json = serde_json::to_value(&detection).unwrap();
        assert_eq!(json["class"], "cat");
        assert_eq!(json["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        let back: Detection = serde_json::from_value(json).unwrap();
        assert_eq!(back, detection);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);

        let half = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn invocation_errors_are_not_fatal() {
        let per_file = DetectorError::Invocation {
            path: PathBuf::from("a.jpg"),
            message: String::from("bad pixels"),
        };
        let setup = DetectorError::ModelLoad {
            path: PathBuf::from("model.onnx"),
            message: String::from("missing"),
        };
        assert!(!per_file.is_fatal());
        assert!(setup.is_fatal());
        assert_eq!(setup.path(), Path::new("model.onnx"));
    }

    struct Fixed;

    impl ObjectDetector for Fixed {
        fn detect(&mut self, _image: &Path) -> Result<Vec<Detection>, DetectorError> {
            Ok(vec![Detection::new("cat", 0.8, BoundingBox::new(0.0, 0.0, 1.0, 1.0))])
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn lazy_detector_loads_on_first_use() {
        let mut detector = LazyDetector::new(|| Ok(Fixed));
        assert!(!detector.is_loaded());
        assert_eq!(detector.name(), "lazy detector");

        let found = detector.detect(Path::new("a.jpg")).unwrap();
        assert_eq!(found[0].label, "cat");
        assert!(detector.is_loaded());
        assert_eq!(detector.name(), "fixed");
    }

    #[test]
    fn failed_load_is_reported_on_every_call() {
        let mut detector = LazyDetector::new(|| -> Result<Fixed, DetectorError> {
            Err(DetectorError::ModelLoad {
                path: PathBuf::from("missing.onnx"),
                message: String::from("no such file"),
            })
        });
        for _ in 0..2 {
            let err = detector.detect(Path::new("a.jpg")).unwrap_err();
            assert!(err.is_fatal());
            assert_eq!(err.path(), Path::new("missing.onnx"));
            assert!(err.to_string().contains("no such file"));
        }
        assert!(!detector.is_loaded());
    }
}
