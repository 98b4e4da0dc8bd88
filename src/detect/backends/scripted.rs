use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::geometry::Rect;

/// Detection as written in config files for the scripted backend.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScriptedDetection {
    pub bbox: Rect,
    pub class_id: u32,
    pub confidence: f32,
}

impl From<&ScriptedDetection> for Detection {
    fn from(d: &ScriptedDetection) -> Self {
        Detection::coco(d.bbox, d.class_id, d.confidence)
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: Vec<Vec<Detection>>,
    cursor: usize,
    calls: u64,
}

/// Deterministic backend that replays a fixed schedule of detection batches,
/// one batch per call, wrapping around at the end. An empty schedule detects
/// nothing.
///
/// Clones share the schedule, so a test can keep a handle and swap batches
/// while an engine owns the backend.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Vec<Detection>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps,
                cursor: 0,
                calls: 0,
            })),
        }
    }

    /// Same batch on every call.
    pub fn constant(detections: Vec<Detection>) -> Self {
        Self::new(vec![detections])
    }

    pub fn from_config(steps: &[Vec<ScriptedDetection>]) -> Self {
        Self::new(
            steps
                .iter()
                .map(|step| step.iter().map(Detection::from).collect())
                .collect(),
        )
    }

    /// Replace the schedule; the next call returns `steps[0]`.
    pub fn set_steps(&self, steps: Vec<Vec<Detection>>) {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        script.steps = steps;
        script.cursor = 0;
    }

    pub fn set_constant(&self, detections: Vec<Detection>) {
        self.set_steps(vec![detections]);
    }

    pub fn calls(&self) -> u64 {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).calls
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        script.calls += 1;
        if script.steps.is_empty() {
            return Ok(Vec::new());
        }
        let idx = script.cursor % script.steps.len();
        script.cursor = idx + 1;
        Ok(script.steps[idx].clone())
    }
}
