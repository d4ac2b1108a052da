use super::decode::{decode_predictions, non_max_suppression};
use super::labels::load_labels;
use super::runtime::{init_ort_runtime, load_session, preprocess_image};
use super::{Detection, DetectorConfig, DetectorError, ObjectDetector};
use ort::session::Session;
use std::path::Path;
use tracing::{debug, info};

/// YOLO-family ONNX model run through ONNX Runtime.
pub struct YoloDetector {
    session: Session,
    labels: Vec<String>,
    config: DetectorConfig,
}

impl YoloDetector {
    /// Initialises the runtime and loads the configured model. Any failure
    /// here is a [`DetectorError::ModelLoad`] and should abort the run.
    pub fn load(config: DetectorConfig) -> Result<Self, DetectorError> {
        if config.input_size == 0 {
            return Err(DetectorError::ModelLoad {
                path: config.model_path.clone(),
                message: String::from("input size must be positive"),
            });
        }
        init_ort_runtime(&config.ort_library)?;
        let labels = load_labels(&config)?;
        let session = load_session(&config.model_path)?;
        info!(
            model = %config.model_path.display(),
            classes = labels.len(),
            "detection model loaded"
        );
        Ok(Self {
            session,
            labels,
            config,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        let fail = |message: String| DetectorError::Invocation {
            path: image.to_path_buf(),
            message,
        };

        let (input, letterbox) = preprocess_image(image, self.config.input_size)?;

        let input_name = self
            .session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "images".to_string());

        let input_tensor =
            ort::value::Tensor::from_array(input).map_err(|e| fail(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![input_name => input_tensor])
            .map_err(|e| fail(e.to_string()))?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| fail(String::from("model produced no output tensor")))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| fail(e.to_string()))?;
        let shape: Vec<usize> = shape.iter().map(|&dim| dim.max(0) as usize).collect();

        let candidates = decode_predictions(
            &shape,
            data,
            &self.labels,
            &letterbox,
            self.config.score_threshold,
        );
        let detections = non_max_suppression(
            candidates,
            self.config.iou_threshold,
            self.config.max_detections,
        );
        debug!(
            path = %image.display(),
            count = detections.len(),
            "image processed"
        );
        Ok(detections)
    }

    fn name(&self) -> &str {
        "yolo"
    }
}
