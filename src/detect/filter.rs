use crate::detect::result::{Detection, DetectionBatch, VEHICLE_CLASS_IDS};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Keeps vehicle-like classes above a confidence floor.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFilter {
    pub allowed_classes: Vec<u32>,
    /// Detections must score strictly above this value.
    pub min_confidence: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            allowed_classes: VEHICLE_CLASS_IDS.to_vec(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl DetectionFilter {
    pub fn accepts(&self, det: &Detection) -> bool {
        self.allowed_classes.contains(&det.class_id) && det.confidence > self.min_confidence
    }

    /// Split a raw detector result into the inspection batch.
    pub fn partition(&self, all: Vec<Detection>) -> DetectionBatch {
        let vehicles = all.iter().filter(|d| self.accepts(d)).cloned().collect();
        DetectionBatch { all, vehicles }
    }
}
