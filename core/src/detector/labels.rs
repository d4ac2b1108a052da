//! Class-name resolution for detection models.

use super::{DetectorConfig, DetectorError};
use std::fs;
use std::path::Path;

/// The 80 COCO classes, in model output order.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Resolves class names: inline labels first, then `labels_file`, then COCO.
pub fn load_labels(config: &DetectorConfig) -> Result<Vec<String>, DetectorError> {
    if !config.labels.is_empty() {
        return Ok(config.labels.clone());
    }
    if let Some(path) = config.labels_file.as_deref() {
        return load_labels_from_txt(path);
    }
    Ok(COCO_LABELS.iter().map(|label| label.to_string()).collect())
}

/// Reads one label per line, skipping blank lines.
pub fn load_labels_from_txt(path: &Path) -> Result<Vec<String>, DetectorError> {
    let content = fs::read_to_string(path).map_err(|source| DetectorError::Labels {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
