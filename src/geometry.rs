//! Pixel-space geometry shared by the registry, the overlap metrics and the
//! renderers.
//!
//! All coordinates are in frame pixels with the origin at the top-left corner.
//! Rectangles are stored as `xyxy` corners, the same layout detectors emit.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle. `x1 <= x2` and `y1 <= y2` after construction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    /// Build a rectangle from any two opposite corners.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Open-interval overlap on both axes. Rectangles that only share an edge
    /// do not overlap.
    pub fn intersects(&self, other: &Rect) -> bool {
        let horizontal = self.x1 < other.x2 && other.x1 < self.x2;
        let vertical = self.y1 < other.y2 && other.y1 < self.y2;
        horizontal && vertical
    }

    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// Intersection over union in `[0, 1]`. Degenerate unions score zero.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            (inter / union).clamp(0.0, 1.0)
        }
    }

    /// Corners in clockwise order, starting top-left.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ]
    }

    /// Integer pixel bounds clamped to a `width` x `height` frame.
    ///
    /// Returns `None` when the rectangle lies entirely outside the frame.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        if self.x2 < 0.0 || self.y2 < 0.0 || self.x1 > max_x || self.y1 > max_y {
            return None;
        }
        Some((
            self.x1.max(0.0).round() as u32,
            self.y1.max(0.0).round() as u32,
            self.x2.min(max_x).round() as u32,
            self.y2.min(max_y).round() as u32,
        ))
    }
}

/// A line drawn by the operator over the first frame. Each segment becomes one
/// spot whose region is the segment's bounding rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl LineSegment {
    pub fn bounding_rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }
}

/// Even-odd point-in-polygon test.
pub fn polygon_contains(points: &[Point], x: f32, y: f32) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (pi, pj) = (points[i], points[j]);
        if (pi.y > y) != (pj.y > y) {
            let cross_x = (pj.x - pi.x) * (y - pi.y) / (pj.y - pi.y) + pi.x;
            if x < cross_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_normalizes_corners() {
        let r = Rect::new(200.0, 50.0, 100.0, 150.0);
        assert_eq!(r, Rect::new(100.0, 50.0, 200.0, 150.0));
        assert_eq!(r.width(), 100.0);
        assert_eq!(r.height(), 100.0);
    }

    #[test]
    fn touching_edges_do_not_intersect() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(10.0, 0.0, 20.0, 10.0);
        assert!(!a.intersects(&b));
        let c = Rect::new(9.5, 9.5, 20.0, 20.0);
        assert!(a.intersects(&c));
    }

    #[test]
    fn iou_of_identical_and_disjoint_rects() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        let far = Rect::new(50.0, 50.0, 60.0, 60.0);
        assert_eq!(a.iou(&far), 0.0);
        let half = Rect::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn line_segment_bounding_rect_uses_min_max() {
        let line = LineSegment {
            x1: 300.0,
            y1: 40.0,
            x2: 120.0,
            y2: 220.0,
        };
        assert_eq!(line.bounding_rect(), Rect::new(120.0, 40.0, 300.0, 220.0));
    }

    #[test]
    fn polygon_contains_handles_triangle() {
        let tri = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 10.0),
        ];
        assert!(polygon_contains(&tri, 2.0, 2.0));
        assert!(!polygon_contains(&tri, 8.0, 8.0));
    }

    #[test]
    fn pixel_bounds_clamp_to_frame() {
        let r = Rect::new(-5.0, -5.0, 700.0, 20.0);
        assert_eq!(r.pixel_bounds(640, 480), Some((0, 0, 639, 20)));
        assert_eq!(Rect::new(700.0, 0.0, 800.0, 10.0).pixel_bounds(640, 480), None);
    }
}
