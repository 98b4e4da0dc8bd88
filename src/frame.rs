//! Frames and the latest-frame publisher.
//!
//! - `Frame`: RGB24 pixel buffer with its capture time.
//! - `FramePublisher`: single-slot holder of the most recent analysis output.
//!
//! The publisher is deliberately non-queuing. The engine overwrites the slot
//! once per cycle; every viewer copies whatever is there when it looks. A
//! viewer slower than the engine skips frames, and nothing a viewer does can
//! delay the next write: readers hold the lock only long enough to clone an
//! `Arc`, and the pixel copy happens after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::{anyhow, Result};

use image::{ImageBuffer, Rgb};

use crate::detect::DetectionBatch;

/// Borrowed RGB view of a `Frame`, drawable with `imageproc`.
pub type RgbCanvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

/// Bytes per pixel (RGB24).
pub const CHANNELS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: SystemTime,
    /// Position within the source since the last rewind.
    pub index: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, captured_at: SystemTime) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at,
            index: 0,
        })
    }

    /// Black frame, used by tests and as a placeholder.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * CHANNELS],
            width,
            height,
            captured_at: SystemTime::now(),
            index: 0,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Drawing view over the pixel buffer for `imageproc`.
    pub fn canvas(&mut self) -> Option<RgbCanvas<'_>> {
        ImageBuffer::from_raw(self.width, self.height, self.data.as_mut_slice())
    }
}

/// One cycle's output as held by the publisher.
#[derive(Clone, Debug)]
pub struct PublishedFrame {
    pub raw: Frame,
    /// Raw frame with detection boxes burned in, when the engine renders one.
    pub inspection: Option<Frame>,
    pub detections: DetectionBatch,
    /// Monotonic publish counter, starting at 1.
    pub sequence: u64,
}

#[derive(Default)]
struct Slot {
    latest: Option<Arc<PublishedFrame>>,
    sequence: u64,
}

/// Latest-wins holder for the engine's output.
#[derive(Default)]
pub struct FramePublisher {
    slot: Mutex<Slot>,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Option<Arc<PublishedFrame>> {
        self.lock().latest.clone()
    }

    /// Replace raw frame, inspection frame and detections in one step.
    pub fn publish(
        &self,
        raw: Frame,
        inspection: Option<Frame>,
        detections: DetectionBatch,
    ) -> u64 {
        let mut slot = self.lock();
        slot.sequence += 1;
        let sequence = slot.sequence;
        slot.latest = Some(Arc::new(PublishedFrame {
            raw,
            inspection,
            detections,
            sequence,
        }));
        sequence
    }

    /// Copy of the latest raw frame, or `None` before the first publish.
    pub fn snapshot_raw(&self) -> Option<Frame> {
        self.current().map(|p| p.raw.clone())
    }

    /// Copy of the latest inspection frame, or `None` when nothing was
    /// published or the engine does not render one.
    pub fn snapshot_inspection(&self) -> Option<Frame> {
        self.current().and_then(|p| p.inspection.clone())
    }

    /// Copy of everything from the latest cycle.
    pub fn latest(&self) -> Option<PublishedFrame> {
        self.current().map(|p| (*p).clone())
    }

    /// Number of publishes so far; unchanged value means no new frame.
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Drop the held frame, e.g. when a new setup replaces the scene.
    pub fn clear(&self) {
        self.lock().latest = None;
    }
}
