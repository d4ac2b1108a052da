//! Pure post-processing for YOLO-style outputs: letterbox geometry, raw
//! tensor decoding and non-maximum suppression.

use super::{BoundingBox, Detection};
use std::cmp::Ordering;

/// Mapping between source image pixels and the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub source_width: u32,
    pub source_height: u32,
    pub input_size: u32,
}

impl Letterbox {
    pub fn new(source_width: u32, source_height: u32, input_size: u32) -> Self {
        let longest = source_width.max(source_height).max(1) as f32;
        let scale = input_size as f32 / longest;
        let (width, height) = scaled_dimensions(source_width, source_height, scale);
        Self {
            scale,
            pad_x: input_size.saturating_sub(width) as f32 / 2.0,
            pad_y: input_size.saturating_sub(height) as f32 / 2.0,
            source_width,
            source_height,
            input_size,
        }
    }

    /// Size of the resized image before padding.
    pub fn scaled_size(&self) -> (u32, u32) {
        scaled_dimensions(self.source_width, self.source_height, self.scale)
    }

    /// Converts a centre/size box in model space to corners in source space,
    /// clamped to the image.
    pub fn to_source(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let max_x = self.source_width as f32;
        let max_y = self.source_height as f32;
        let unmap_x = |x: f32| ((x - self.pad_x) / self.scale).clamp(0.0, max_x);
        let unmap_y = |y: f32| ((y - self.pad_y) / self.scale).clamp(0.0, max_y);
        BoundingBox::new(
            unmap_x(cx - w / 2.0),
            unmap_y(cy - h / 2.0),
            unmap_x(cx + w / 2.0),
            unmap_y(cy + h / 2.0),
        )
    }
}

fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
    )
}

/// Decodes a `[1, 4 + C, N]` (or transposed `[1, N, 4 + C]`) prediction
/// tensor into detections above `score_threshold`.
pub fn decode_predictions(
    shape: &[usize],
    data: &[f32],
    labels: &[String],
    letterbox: &Letterbox,
    score_threshold: f32,
) -> Vec<Detection> {
    let (rows, cols) = match shape {
        [1, rows, cols] | [rows, cols] => (*rows, *cols),
        _ => return Vec::new(),
    };
    if rows * cols > data.len() {
        return Vec::new();
    }

    // Exports put either the attributes or the anchors first. With a known
    // label count the attribute axis is unambiguous; otherwise anchors are
    // assumed to outnumber attributes.
    let expected_attributes = (!labels.is_empty()).then(|| labels.len() + 4);
    let channels_first = match expected_attributes {
        Some(attributes) if rows == attributes => true,
        Some(attributes) if cols == attributes => false,
        _ => rows < cols,
    };
    let (attributes, anchors) = if channels_first { (rows, cols) } else { (cols, rows) };
    if attributes <= 4 {
        return Vec::new();
    }
    let value = |attribute: usize, anchor: usize| -> f32 {
        if channels_first {
            data[attribute * anchors + anchor]
        } else {
            data[anchor * attributes + attribute]
        }
    };

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0;
        let mut best_score = f32::MIN;
        for class in 0..attributes - 4 {
            let score = value(4 + class, anchor);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score < score_threshold {
            continue;
        }
        let bounding_box = letterbox.to_source(
            value(0, anchor),
            value(1, anchor),
            value(2, anchor),
            value(3, anchor),
        );
        detections.push(Detection::new(
            label_for(labels, best_class),
            best_score.clamp(0.0, 1.0),
            bounding_box,
        ));
    }
    detections
}

fn label_for(labels: &[String], class: usize) -> String {
    labels
        .get(class)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class))
}

/// Greedy per-class NMS; keeps at most `max_detections`, highest confidence
/// first.
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|existing| {
            existing.label == candidate.label
                && existing.bounding_box.iou(&candidate.bounding_box) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
