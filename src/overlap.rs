//! Overlap metrics between a spot and a detection.
//!
//! The metric is configuration: the engine calls `OverlapEvaluator::overlaps`
//! the same way whichever metric is selected.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::geometry::{polygon_contains, Point, Rect};
use crate::registry::Spot;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum OverlapMetric {
    /// Any intersection on both axes (touching edges excluded).
    AnyOverlap,
    /// Box intersection-over-union at or above `threshold`.
    BoxIou { threshold: f32 },
    /// Pixel mask intersection-over-union at or above `threshold`.
    MaskIou { threshold: f32 },
}

impl Default for OverlapMetric {
    fn default() -> Self {
        Self::AnyOverlap
    }
}

impl OverlapMetric {
    /// Parse the names used in config files and env vars.
    pub fn from_name(name: &str, threshold: Option<f32>) -> Result<Self> {
        let threshold = threshold.unwrap_or(DEFAULT_IOU_THRESHOLD);
        let metric = match name.trim().to_lowercase().as_str() {
            "any" | "any_overlap" => Self::AnyOverlap,
            "box_iou" | "iou" => Self::BoxIou { threshold },
            "mask_iou" => Self::MaskIou { threshold },
            other => return Err(anyhow!("unknown overlap metric '{}'", other)),
        };
        metric.validate()?;
        Ok(metric)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::AnyOverlap => Ok(()),
            Self::BoxIou { threshold } | Self::MaskIou { threshold } => {
                if !(0.0..=1.0).contains(threshold) || *threshold == 0.0 {
                    return Err(anyhow!("iou threshold must be in (0, 1], got {}", threshold));
                }
                Ok(())
            }
        }
    }

    pub fn needs_masks(&self) -> bool {
        matches!(self, Self::MaskIou { .. })
    }
}

/// Binary per-pixel mask, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Mask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    /// Wrap detector-provided mask data. `bits.len()` must equal `width * height`.
    pub fn from_bits(width: u32, height: u32, bits: Vec<bool>) -> Result<Self> {
        if bits.len() != width as usize * height as usize {
            return Err(anyhow!(
                "mask of {}x{} needs {} cells, got {}",
                width,
                height,
                width as usize * height as usize,
                bits.len()
            ));
        }
        Ok(Self { width, height, bits })
    }

    /// Rasterize a rectangle, sampling at pixel centres.
    pub fn from_rect(rect: &Rect, width: u32, height: u32) -> Self {
        let mut mask = Self::empty(width, height);
        let Some((x0, y0, x1, y1)) = rect.pixel_bounds(width, height) else {
            return mask;
        };
        for y in y0..=y1 {
            let cy = y as f32 + 0.5;
            if cy < rect.y1 || cy >= rect.y2 {
                continue;
            }
            for x in x0..=x1 {
                let cx = x as f32 + 0.5;
                if cx >= rect.x1 && cx < rect.x2 {
                    mask.set(x, y);
                }
            }
        }
        mask
    }

    /// Rasterize a polygon with the even-odd rule, sampling at pixel centres.
    pub fn from_polygon(points: &[Point], width: u32, height: u32) -> Self {
        let mut mask = Self::empty(width, height);
        if points.len() < 3 {
            return mask;
        }
        let min_x = points.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let min_y = points.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
        let max_x = points.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
        let max_y = points.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);
        let bounds = Rect::new(min_x, min_y, max_x, max_y);
        let Some((x0, y0, x1, y1)) = bounds.pixel_bounds(width, height) else {
            return mask;
        };
        for y in y0..=y1 {
            for x in x0..=x1 {
                if polygon_contains(points, x as f32 + 0.5, y as f32 + 0.5) {
                    mask.set(x, y);
                }
            }
        }
        mask
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[(y * self.width + x) as usize]
    }

    fn set(&mut self, x: u32, y: u32) {
        let idx = (y * self.width + x) as usize;
        self.bits[idx] = true;
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Pixel-wise AND over OR. Masks of different sizes score zero.
    pub fn iou(&self, other: &Mask) -> f32 {
        if self.width != other.width || self.height != other.height {
            return 0.0;
        }
        let (mut inter, mut union) = (0usize, 0usize);
        for (a, b) in self.bits.iter().zip(&other.bits) {
            if *a && *b {
                inter += 1;
            }
            if *a || *b {
                union += 1;
            }
        }
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

/// Spot masks rendered once per registry generation and frame size.
#[derive(Debug, Default)]
pub struct SpotMasks {
    masks: HashMap<String, Mask>,
    generation: u64,
    width: u32,
    height: u32,
}

impl SpotMasks {
    pub fn render(spots: &[Spot], generation: u64, width: u32, height: u32) -> Self {
        let masks = spots
            .iter()
            .map(|spot| {
                let mask = match &spot.polygon {
                    Some(points) => Mask::from_polygon(points, width, height),
                    None => Mask::from_rect(&spot.region, width, height),
                };
                (spot.id.clone(), mask)
            })
            .collect();
        Self {
            masks,
            generation,
            width,
            height,
        }
    }

    pub fn is_current(&self, generation: u64, width: u32, height: u32) -> bool {
        self.generation == generation && self.width == width && self.height == height
    }

    pub fn get(&self, spot_id: &str) -> Option<&Mask> {
        self.masks.get(spot_id)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OverlapEvaluator {
    metric: OverlapMetric,
}

impl OverlapEvaluator {
    pub fn new(metric: OverlapMetric) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> OverlapMetric {
        self.metric
    }

    /// Overlap score in `[0, 1]`. Any-overlap scores 0 or 1.
    ///
    /// Under the mask metric a detection without its own mask is rasterized
    /// from its box; a spot without a rendered mask falls back to box IoU.
    pub fn score(&self, region: &Rect, spot_mask: Option<&Mask>, det: &Detection) -> f32 {
        match self.metric {
            OverlapMetric::AnyOverlap => {
                if region.intersects(&det.bbox) {
                    1.0
                } else {
                    0.0
                }
            }
            OverlapMetric::BoxIou { .. } => region.iou(&det.bbox),
            OverlapMetric::MaskIou { .. } => match spot_mask {
                Some(spot_mask) => match &det.mask {
                    Some(det_mask) => spot_mask.iou(det_mask),
                    None => {
                        let det_mask =
                            Mask::from_rect(&det.bbox, spot_mask.width(), spot_mask.height());
                        spot_mask.iou(&det_mask)
                    }
                },
                None => region.iou(&det.bbox),
            },
        }
    }

    pub fn overlaps(&self, region: &Rect, spot_mask: Option<&Mask>, det: &Detection) -> bool {
        let score = self.score(region, spot_mask, det);
        match self.metric {
            OverlapMetric::AnyOverlap => score > 0.0,
            OverlapMetric::BoxIou { threshold } | OverlapMetric::MaskIou { threshold } => {
                score >= threshold
            }
        }
    }

    /// True when any detection overlaps; stops at the first match.
    pub fn any_overlap(&self, region: &Rect, spot_mask: Option<&Mask>, dets: &[Detection]) -> bool {
        dets.iter().any(|det| self.overlaps(region, spot_mask, det))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(Rect::new(x1, y1, x2, y2), 2, "car", 0.9)
    }

    #[test]
    fn any_overlap_matches_partial_cover() {
        let eval = OverlapEvaluator::new(OverlapMetric::AnyOverlap);
        let spot = Rect::new(100.0, 100.0, 200.0, 200.0);
        assert!(eval.overlaps(&spot, None, &car(150.0, 150.0, 250.0, 250.0)));
        assert!(!eval.overlaps(&spot, None, &car(200.0, 100.0, 300.0, 200.0)));
    }

    #[test]
    fn box_iou_respects_threshold() {
        let spot = Rect::new(0.0, 0.0, 100.0, 100.0);
        let det = car(50.0, 0.0, 150.0, 100.0); // iou = 1/3
        let strict = OverlapEvaluator::new(OverlapMetric::BoxIou { threshold: 0.5 });
        let loose = OverlapEvaluator::new(OverlapMetric::BoxIou { threshold: 0.3 });
        assert!(!strict.overlaps(&spot, None, &det));
        assert!(loose.overlaps(&spot, None, &det));
    }

    #[test]
    fn mask_iou_uses_rendered_spot_mask() {
        let spot = Rect::new(0.0, 0.0, 10.0, 10.0);
        let spot_mask = Mask::from_rect(&spot, 20, 20);
        assert_eq!(spot_mask.count(), 100);

        let eval = OverlapEvaluator::new(OverlapMetric::MaskIou { threshold: 0.5 });
        assert!(eval.overlaps(&spot, Some(&spot_mask), &car(0.0, 0.0, 10.0, 10.0)));
        assert!(!eval.overlaps(&spot, Some(&spot_mask), &car(5.0, 5.0, 15.0, 15.0)));
    }

    #[test]
    fn mask_iou_prefers_detector_mask() {
        let spot = Rect::new(0.0, 0.0, 4.0, 4.0);
        let spot_mask = Mask::from_rect(&spot, 4, 4);
        let mut det = car(0.0, 0.0, 4.0, 4.0);
        // Detector says only the top row is vehicle.
        let mut bits = vec![false; 16];
        bits[..4].iter_mut().for_each(|b| *b = true);
        det.mask = Some(Mask::from_bits(4, 4, bits).unwrap());
        let eval = OverlapEvaluator::new(OverlapMetric::MaskIou { threshold: 0.5 });
        assert!((eval.score(&spot, Some(&spot_mask), &det) - 0.25).abs() < 1e-6);
        assert!(!eval.overlaps(&spot, Some(&spot_mask), &det));
    }

    #[test]
    fn polygon_mask_covers_triangle_half() {
        let tri = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
        ];
        let mask = Mask::from_polygon(&tri, 10, 10);
        assert_eq!(mask.count(), 45);
        assert!(mask.get(0, 0));
        assert!(!mask.get(9, 9));
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!(OverlapMetric::from_name("any", None).unwrap(), OverlapMetric::AnyOverlap);
        assert_eq!(
            OverlapMetric::from_name("box_iou", Some(0.4)).unwrap(),
            OverlapMetric::BoxIou { threshold: 0.4 }
        );
        assert!(OverlapMetric::from_name("mask_iou", Some(1.5)).is_err());
        assert!(OverlapMetric::from_name("centroid", None).is_err());
    }

    #[test]
    fn mismatched_masks_score_zero() {
        assert_eq!(Mask::empty(4, 4).iou(&Mask::empty(5, 5)), 0.0);
        assert!(Mask::from_bits(2, 2, vec![true; 3]).is_err());
    }
}
