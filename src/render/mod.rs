//! Overlays burned into RGB frames before encoding.
//!
//! Two strategies share the drawing primitives:
//! - `Overlay::SpotStatus`: every spot outlined in its status colour.
//! - `Overlay::Detections`: detector boxes with `label confidence` captions and
//!   a header counting objects and vehicles in the batch.
//!
//! Drawing goes through `imageproc` on a borrowed view of the frame buffer.
//! Labels use the bundled DejaVu Sans Mono face.

use std::sync::OnceLock;

use ab_glyph::{FontRef, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect as PixelRect;
use serde::{Deserialize, Serialize};

use crate::detect::{Detection, DetectionBatch};
use crate::frame::{Frame, RgbCanvas};
use crate::geometry::Rect;
use crate::registry::{Spot, SpotStatus};

pub const COLOR_AVAILABLE: [u8; 3] = [0, 255, 0];
pub const COLOR_OCCUPIED: [u8; 3] = [255, 0, 0];
pub const COLOR_RESERVED: [u8; 3] = [255, 165, 0];
pub const COLOR_VEHICLE: [u8; 3] = [0, 96, 255];
pub const COLOR_OTHER: [u8; 3] = [160, 160, 160];
pub const COLOR_TEXT: [u8; 3] = [255, 255, 255];
const COLOR_LABEL_BG: [u8; 3] = [0, 0, 0];

pub const SPOT_THICKNESS: u32 = 4;
pub const DETECTION_THICKNESS: u32 = 2;
const TEXT_SCALE: PxScale = PxScale { x: 16.0, y: 16.0 };
const LABEL_PAD: u32 = 2;

const FONT_BYTES: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");

/// Parsed once; `None` only if the bundled face is unreadable, in which case
/// boxes are still drawn without captions.
fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(err) => {
            log::error!("overlay label font unreadable, captions disabled: {}", err);
            None
        }
    })
    .as_ref()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overlay {
    SpotStatus,
    Detections,
}

pub fn status_color(status: SpotStatus) -> [u8; 3] {
    match status {
        SpotStatus::Available => COLOR_AVAILABLE,
        SpotStatus::Occupied => COLOR_OCCUPIED,
        SpotStatus::Reserved => COLOR_RESERVED,
    }
}

/// Outline `rect` with lines `thickness` pixels wide, drawn inward.
pub fn draw_rect(frame: &mut Frame, rect: &Rect, color: [u8; 3], thickness: u32) {
    if let Some(mut canvas) = frame.canvas() {
        outline(&mut canvas, rect, color, thickness);
    }
}

fn outline(canvas: &mut RgbCanvas<'_>, rect: &Rect, color: [u8; 3], thickness: u32) {
    let Some((x0, y0, x1, y1)) = rect.pixel_bounds(canvas.width(), canvas.height()) else {
        return;
    };
    for i in 0..thickness.max(1) {
        if 2 * i > x1 - x0 || 2 * i > y1 - y0 {
            break;
        }
        let ring = PixelRect::at((x0 + i) as i32, (y0 + i) as i32)
            .of_size(x1 - x0 - 2 * i + 1, y1 - y0 - 2 * i + 1);
        draw_hollow_rect_mut(canvas, ring, Rgb(color));
    }
}

fn fill(canvas: &mut RgbCanvas<'_>, left: i32, top: i32, width: u32, height: u32, color: [u8; 3]) {
    if width == 0 || height == 0 {
        return;
    }
    draw_filled_rect_mut(
        canvas,
        PixelRect::at(left, top).of_size(width, height),
        Rgb(color),
    );
}

/// Caption on a dark band just above `(x, y)`, or just inside when there is
/// no room above.
fn caption(canvas: &mut RgbCanvas<'_>, font: &FontRef<'_>, x: f32, y: f32, text: &str) {
    let (text_w, text_h) = text_size(TEXT_SCALE, font, text);
    let (w, h) = (text_w + 2 * LABEL_PAD, text_h + 2 * LABEL_PAD);
    let left = x.max(0.0) as i32;
    let top = if y >= h as f32 {
        y as i32 - h as i32
    } else {
        y.max(0.0) as i32
    };
    fill(canvas, left, top, w, h, COLOR_LABEL_BG);
    draw_text_mut(
        canvas,
        Rgb(COLOR_TEXT),
        left + LABEL_PAD as i32,
        top + LABEL_PAD as i32,
        TEXT_SCALE,
        font,
        text,
    );
}

pub fn overlay_spots(frame: &mut Frame, spots: &[Spot]) {
    let Some(mut canvas) = frame.canvas() else {
        return;
    };
    for spot in spots {
        outline(&mut canvas, &spot.region, status_color(spot.status), SPOT_THICKNESS);
        if let Some(font) = label_font() {
            caption(&mut canvas, font, spot.region.x1, spot.region.y1, &spot.id);
        }
    }
}

fn detection_caption(det: &Detection) -> String {
    format!("{} {:.2}", det.label, det.confidence)
}

fn batch_header(batch: &DetectionBatch) -> String {
    let summary = batch.summary();
    format!("objects: {} vehicles: {}", summary.objects, summary.vehicles)
}

pub fn overlay_detections(frame: &mut Frame, batch: &DetectionBatch) {
    let Some(mut canvas) = frame.canvas() else {
        return;
    };
    let font = label_font();
    for det in &batch.all {
        let is_vehicle = batch.vehicles.iter().any(|v| v == det);
        let color = if is_vehicle { COLOR_VEHICLE } else { COLOR_OTHER };
        outline(&mut canvas, &det.bbox, color, DETECTION_THICKNESS);
        if let Some(font) = font {
            caption(&mut canvas, font, det.bbox.x1, det.bbox.y1, &detection_caption(det));
        }
    }
    if let Some(font) = font {
        caption(&mut canvas, font, 0.0, 0.0, &batch_header(batch));
    }
}

impl Overlay {
    pub fn apply(&self, frame: &mut Frame, spots: &[Spot], batch: &DetectionBatch) {
        match self {
            Self::SpotStatus => overlay_spots(frame, spots),
            Self::Detections => overlay_detections(frame, batch),
        }
    }
}
