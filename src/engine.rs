//! Occupancy engine: one detection cycle per interval.
//!
//! Each cycle reads the next frame, runs the detector, keeps confident
//! vehicle detections, decides occupancy per spot and publishes the frame
//! together with the detection batch. State changes go through
//! `SpotRegistry::apply_cycle`, so a cycle is applied atomically.

use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};

use crate::detect::{BatchSummary, DetectionFilter, DetectorBackend, SharedDetector};
use crate::frame::FramePublisher;
use crate::ingest::{LoopStats, LoopingSource, VideoSource};
use crate::overlap::{OverlapEvaluator, OverlapMetric, SpotMasks};
use crate::registry::{SpotRegistry, Transition};
use crate::render::Overlay;
use crate::task::{StopSignal, TaskHandle};

pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Cadence measured from the start of one cycle to the start of the next.
    pub interval: Duration,
    pub filter: DetectionFilter,
    pub metric: OverlapMetric,
    /// Burn detection boxes into a second frame for the inspection stream.
    pub render_inspection: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ANALYSIS_INTERVAL,
            filter: DetectionFilter::default(),
            metric: OverlapMetric::default(),
            render_inspection: true,
        }
    }
}

/// What one cycle saw and changed.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub frame_index: u64,
    pub sequence: u64,
    pub detections: BatchSummary,
    /// Spots with at least one overlapping vehicle this cycle.
    pub occupied: Vec<String>,
    pub transitions: Vec<Transition>,
}

pub struct OccupancyEngine {
    source: LoopingSource,
    detector: SharedDetector,
    registry: Arc<SpotRegistry>,
    publisher: Arc<FramePublisher>,
    evaluator: OverlapEvaluator,
    settings: EngineSettings,
    masks: Option<SpotMasks>,
}

impl OccupancyEngine {
    /// Open the source and warm up the detector. Either failing means no
    /// engine.
    pub fn start(
        source: Box<dyn VideoSource>,
        detector: SharedDetector,
        registry: Arc<SpotRegistry>,
        publisher: Arc<FramePublisher>,
        settings: EngineSettings,
    ) -> Result<Self> {
        settings.metric.validate()?;
        let mut source = LoopingSource::new(source);
        source.connect()?;
        {
            let mut backend = lock_detector(&detector);
            let name = backend.name();
            backend
                .warm_up()
                .with_context(|| format!("detector backend '{}' failed to initialize", name))?;
        }
        log::info!(
            "occupancy engine ready: source={} metric={:?} interval={:?}",
            source.describe(),
            settings.metric,
            settings.interval
        );
        Ok(Self {
            source,
            detector,
            registry,
            publisher,
            evaluator: OverlapEvaluator::new(settings.metric),
            settings,
            masks: None,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn source_stats(&self) -> LoopStats {
        self.source.stats()
    }

    /// Run one cycle observed at `now`.
    ///
    /// A detector error fails the cycle before anything is applied or
    /// published; the registry keeps its previous state.
    pub fn run_cycle(&mut self, now: SystemTime) -> Result<CycleReport> {
        let frame = self.source.next_frame()?;
        let raw_detections = {
            let mut backend = lock_detector(&self.detector);
            let name = backend.name();
            backend
                .detect(&frame)
                .with_context(|| format!("detector backend '{}' failed on frame {}", name, frame.index))?
        };
        let batch = self.settings.filter.partition(raw_detections);

        let spots = self.registry.snapshot();
        if self.evaluator.metric().needs_masks() {
            let generation = self.registry.generation();
            let stale = self
                .masks
                .as_ref()
                .map_or(true, |m| !m.is_current(generation, frame.width(), frame.height()));
            if stale {
                self.masks = Some(SpotMasks::render(
                    &spots,
                    generation,
                    frame.width(),
                    frame.height(),
                ));
            }
        }

        let results: Vec<(String, bool)> = spots
            .iter()
            .map(|spot| {
                let mask = self.masks.as_ref().and_then(|m| m.get(&spot.id));
                let hit = self
                    .evaluator
                    .any_overlap(&spot.region, mask, &batch.vehicles);
                (spot.id.clone(), hit)
            })
            .collect();
        let transitions = self.registry.apply_cycle(&results, now);
        for t in &transitions {
            log::info!(
                "spot {}: {} -> {}",
                t.spot_id,
                t.from.as_str(),
                t.to.as_str()
            );
        }

        let inspection = self.settings.render_inspection.then(|| {
            let mut annotated = frame.clone();
            Overlay::Detections.apply(&mut annotated, &spots, &batch);
            annotated
        });
        let frame_index = frame.index;
        let detections = batch.summary();
        let sequence = self.publisher.publish(frame, inspection, batch);

        Ok(CycleReport {
            frame_index,
            sequence,
            detections,
            occupied: results
                .into_iter()
                .filter(|(_, hit)| *hit)
                .map(|(id, _)| id)
                .collect(),
            transitions,
        })
    }

    /// Run cycles on a background thread until `stop` fires.
    pub fn spawn(mut self, stop: StopSignal) -> Result<TaskHandle> {
        TaskHandle::spawn("occupancy-engine", stop, move |stop| {
            while !stop.is_stopped() {
                let started = Instant::now();
                match self.run_cycle(SystemTime::now()) {
                    Ok(report) => log::debug!(
                        "cycle {}: frame {} objects={} vehicles={} occupied={:?}",
                        report.sequence,
                        report.frame_index,
                        report.detections.objects,
                        report.detections.vehicles,
                        report.occupied
                    ),
                    Err(err) => log::warn!("occupancy cycle skipped: {:#}", err),
                }
                let wait = self.settings.interval.saturating_sub(started.elapsed());
                if stop.wait_timeout(wait) {
                    break;
                }
            }
            log::info!("occupancy engine stopped ({})", self.source.describe());
        })
    }
}

fn lock_detector(
    detector: &SharedDetector,
) -> MutexGuard<'_, dyn DetectorBackend + 'static> {
    detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
