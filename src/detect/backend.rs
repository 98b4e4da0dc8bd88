use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector backend.
///
/// The detector is an external collaborator: one frame in, an ordered list of
/// detections out. Backends may be slow; the engine calls `detect` once per
/// cycle with no timeout, so a slow backend only stretches the cycle.
pub trait DetectorBackend: Send {
    /// Backend identifier used in configuration.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Load weights or otherwise prepare for the first frame. Failure here
    /// keeps the engine from starting.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
