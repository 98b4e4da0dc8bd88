use serde::Serialize;

use crate::geometry::Rect;
use crate::overlap::Mask;

/// One detector output for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Bounding box in frame pixels (xyxy).
    pub bbox: Rect,
    pub class_id: u32,
    pub label: String,
    /// Confidence in `0..=1`.
    pub confidence: f32,
    /// Optional per-pixel mask at frame resolution.
    pub mask: Option<Mask>,
}

impl Detection {
    pub fn new(bbox: Rect, class_id: u32, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            label: label.into(),
            confidence,
            mask: None,
        }
    }

    /// Detection labelled with the COCO name for `class_id`.
    pub fn coco(bbox: Rect, class_id: u32, confidence: f32) -> Self {
        Self::new(bbox, class_id, coco_label(class_id), confidence)
    }
}

/// The most recent cycle's detections, kept for the inspection stream.
#[derive(Clone, Debug, Default)]
pub struct DetectionBatch {
    /// Everything the detector returned.
    pub all: Vec<Detection>,
    /// The subset that passed the vehicle class/confidence filter.
    pub vehicles: Vec<Detection>,
}

impl DetectionBatch {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            objects: self.all.len(),
            vehicles: self.vehicles.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub objects: usize,
    pub vehicles: usize,
}

/// COCO class ids for car, bus and truck.
pub const VEHICLE_CLASS_IDS: [u32; 3] = [2, 5, 7];

const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

pub fn coco_label(class_id: u32) -> &'static str {
    COCO_LABELS
        .get(class_id as usize)
        .copied()
        .unwrap_or("object")
}
