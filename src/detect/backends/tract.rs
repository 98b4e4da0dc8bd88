#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::geometry::Rect;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const DEFAULT_NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, N]`
/// output of `cx, cy, w, h` boxes followed by per-class scores, the layout
/// exported by YOLOv8/YOLO11. The model is loaded in `warm_up`.
pub struct TractBackend {
    model_path: PathBuf,
    input_size: u32,
    score_threshold: f32,
    nms_iou: f32,
    model: Option<Plan>,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            input_size,
            score_threshold: 0.25,
            nms_iou: DEFAULT_NMS_IOU,
            model: None,
        }
    }

    /// Raw score floor applied before NMS. The engine's vehicle filter runs
    /// on top of this.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn load(&self) -> Result<Plan> {
        let size = self.input_size as usize;
        tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!("failed to load ONNX model from {}", self.model_path.display())
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let rgb = RgbImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(
            &rgb,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );
        let size = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let (channels, anchors) = (shape[1], shape[2]);
        let sx = frame.width() as f32 / self.input_size as f32;
        let sy = frame.height() as f32 / self.input_size as f32;

        let mut candidates = Vec::new();
        for n in 0..anchors {
            let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
            for c in 4..channels {
                let score = view[[0, c, n]];
                if score > best_score {
                    best_score = score;
                    best_class = c - 4;
                }
            }
            if best_score < self.score_threshold {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, 0, n]], view[[0, 1, n]], view[[0, 2, n]], view[[0, 3, n]]);
            let bbox = Rect::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            );
            candidates.push(Detection::coco(bbox, best_class as u32, best_score.min(1.0)));
        }
        Ok(non_max_suppression(candidates, self.nms_iou))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn warm_up(&mut self) -> Result<()> {
        if self.model.is_none() {
            self.model = Some(self.load()?);
            log::info!("tract detector loaded {}", self.model_path.display());
        }
        Ok(())
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract detector used before warm_up"))?;
        let outputs = model.run(tvec!(input.into())).context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, frame)
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut dets: Vec<Detection>, iou: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for det in dets {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_same_class_duplicates() {
        let a = Detection::coco(Rect::new(0.0, 0.0, 10.0, 10.0), 2, 0.9);
        let b = Detection::coco(Rect::new(1.0, 1.0, 10.0, 10.0), 2, 0.8);
        let c = Detection::coco(Rect::new(1.0, 1.0, 10.0, 10.0), 7, 0.7);
        let kept = non_max_suppression(vec![b, c, a.clone()], 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], a);
    }
}
