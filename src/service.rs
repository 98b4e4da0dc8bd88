//! Parking service: the state shared by every request path and the tasks
//! that mutate it.
//!
//! Setup runs validate, open, swap. A request that fails validation touches
//! nothing. A source or detector that fails to start leaves the previous
//! engine running. Only a fully started engine replaces the old one, and the
//! registry is redefined in the same step.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::SpotwatchConfig;
use crate::detect::{BackendRegistry, SharedDetector};
use crate::encode::JpegEncoder;
use crate::engine::OccupancyEngine;
use crate::frame::FramePublisher;
use crate::geometry::LineSegment;
use crate::ingest::open_source;
use crate::registry::{ReserveOutcome, SpotDefinition, SpotRegistry};
use crate::scheduler::ReservationScheduler;
use crate::stream::{status_report, StatusReport, StreamContext};
use crate::task::{StopSignal, TaskHandle};

/// Scene description: a video source plus one line per parking spot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupRequest {
    #[serde(default)]
    pub video: String,
    #[serde(default)]
    pub lines: Vec<LineSegment>,
}

impl SetupRequest {
    pub fn validate(&self) -> Result<()> {
        if self.video.trim().is_empty() {
            return Err(anyhow!("video source is required"));
        }
        if self.lines.is_empty() {
            return Err(anyhow!("at least one spot line is required"));
        }
        Ok(())
    }
}

/// `{success, message}` body shared by setup and reservation replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum SetupError {
    /// Missing or malformed input; nothing changed.
    Invalid(anyhow::Error),
    /// The new source or detector did not start; the previous engine is
    /// still running.
    Start(anyhow::Error),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(err) => write!(f, "invalid setup: {:#}", err),
            Self::Start(err) => write!(f, "setup failed: {:#}", err),
        }
    }
}

impl std::error::Error for SetupError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetupSummary {
    pub source: String,
    pub spots: usize,
}

pub struct ParkingService {
    config: SpotwatchConfig,
    registry: Arc<SpotRegistry>,
    publisher: Arc<FramePublisher>,
    backends: BackendRegistry,
    encoder: JpegEncoder,
    engine: Mutex<Option<TaskHandle>>,
    scheduler: Mutex<Option<TaskHandle>>,
}

fn lock_task(slot: &Mutex<Option<TaskHandle>>) -> MutexGuard<'_, Option<TaskHandle>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ParkingService {
    /// Build the shared state and start the reservation scheduler. No engine
    /// runs until the first successful `setup`.
    pub fn start(config: SpotwatchConfig, backends: BackendRegistry) -> Result<Self> {
        let registry = Arc::new(SpotRegistry::new(config.release_delay));
        let encoder = JpegEncoder::new(config.stream.jpeg_quality)?;
        let scheduler = ReservationScheduler::new(registry.clone(), config.reservation_tick)
            .spawn(StopSignal::new())?;
        log::info!(
            "parking service started: detector={} hold={:?} release_delay={:?}",
            backends.default_name().unwrap_or("none"),
            config.reservation_hold,
            config.release_delay
        );
        Ok(Self {
            config,
            registry,
            publisher: Arc::new(FramePublisher::new()),
            backends,
            encoder,
            engine: Mutex::new(None),
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    pub fn config(&self) -> &SpotwatchConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SpotRegistry> {
        self.registry.clone()
    }

    pub fn publisher(&self) -> Arc<FramePublisher> {
        self.publisher.clone()
    }

    pub fn is_running(&self) -> bool {
        lock_task(&self.engine)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn detector(&self) -> Result<SharedDetector> {
        self.backends
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))
    }

    /// Replace the scene. Concurrent setups are serialized.
    pub fn setup(&self, request: &SetupRequest) -> Result<SetupSummary, SetupError> {
        request.validate().map_err(SetupError::Invalid)?;
        let definitions = SpotDefinition::from_lines(&request.lines);

        let mut engine_slot = lock_task(&self.engine);
        let engine = open_source(&request.video)
            .and_then(|source| {
                OccupancyEngine::start(
                    source,
                    self.detector()?,
                    self.registry.clone(),
                    self.publisher.clone(),
                    self.config.engine_settings(),
                )
            })
            .map_err(SetupError::Start)?;

        if let Some(previous) = engine_slot.take() {
            log::info!("stopping previous occupancy engine");
            if let Err(err) = previous.stop() {
                log::warn!("previous engine did not stop cleanly: {:#}", err);
            }
        }
        self.registry
            .define(definitions)
            .context("define spots")
            .map_err(SetupError::Start)?;
        self.publisher.clear();
        let handle = engine
            .spawn(StopSignal::new())
            .map_err(SetupError::Start)?;
        *engine_slot = Some(handle);

        let summary = SetupSummary {
            source: request.video.clone(),
            spots: self.registry.len(),
        };
        log::info!(
            "setup complete: {} spots watching {}",
            summary.spots,
            summary.source
        );
        Ok(summary)
    }

    pub fn reserve(&self, spot_id: &str) -> ActionResponse {
        self.reserve_at(spot_id, SystemTime::now())
    }

    pub fn reserve_at(&self, spot_id: &str, now: SystemTime) -> ActionResponse {
        let hold = self.config.reservation_hold;
        match self.registry.try_set_reserved(spot_id, hold, now) {
            ReserveOutcome::Reserved { .. } => {
                log::info!("spot {} reserved for {}s", spot_id, hold.as_secs());
                ActionResponse::ok(format!(
                    "spot {} reserved for {} seconds",
                    spot_id,
                    hold.as_secs()
                ))
            }
            ReserveOutcome::UnknownSpot => {
                ActionResponse::failed(format!("spot {} does not exist", spot_id))
            }
            ReserveOutcome::NotAvailable(status) => ActionResponse::failed(format!(
                "spot {} is {} and cannot be reserved",
                spot_id,
                status.as_str()
            )),
        }
    }

    pub fn status(&self) -> StatusReport {
        status_report(&self.registry, SystemTime::now())
    }

    pub fn stream_context(&self) -> StreamContext {
        StreamContext {
            publisher: self.publisher.clone(),
            registry: self.registry.clone(),
            encoder: Arc::new(self.encoder),
            interval: self.config.stream.interval,
        }
    }

    /// Stop the engine and the scheduler. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        let engine = lock_task(&self.engine).take();
        let scheduler = lock_task(&self.scheduler).take();
        for handle in [engine, scheduler].into_iter().flatten() {
            let name = handle.name().to_string();
            handle
                .stop()
                .with_context(|| format!("stop {}", name))?;
        }
        Ok(())
    }
}

impl Drop for ParkingService {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("parking service shutdown: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, ScriptedBackend};
    use crate::geometry::Rect;
    use crate::registry::SpotStatus;
    use std::time::Duration;

    fn service(backend: ScriptedBackend) -> ParkingService {
        let mut backends = BackendRegistry::new();
        backends.register(backend);
        let config = SpotwatchConfig {
            analysis_interval: Duration::from_millis(10),
            ..SpotwatchConfig::default()
        };
        ParkingService::start(config, backends).unwrap()
    }

    fn lines() -> Vec<LineSegment> {
        vec![
            LineSegment {
                x1: 10.0,
                y1: 10.0,
                x2: 100.0,
                y2: 100.0,
            },
            LineSegment {
                x1: 200.0,
                y1: 10.0,
                x2: 300.0,
                y2: 100.0,
            },
        ]
    }

    fn request(video: &str) -> SetupRequest {
        SetupRequest {
            video: video.to_string(),
            lines: lines(),
        }
    }

    #[test]
    fn setup_defines_spots_and_runs_engine() {
        let backend = ScriptedBackend::constant(vec![Detection::coco(
            Rect::new(20.0, 20.0, 90.0, 90.0),
            2,
            0.9,
        )]);
        let service = service(backend);
        let summary = service
            .setup(&request("stub://lot?width=320&height=240"))
            .unwrap();
        assert_eq!(summary.spots, 2);
        assert!(service.is_running());

        let mut occupied = false;
        for _ in 0..200 {
            if service.registry().get("P1").map(|s| s.status) == Some(SpotStatus::Occupied) {
                occupied = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(occupied);
        assert_eq!(
            service.registry().get("P2").unwrap().status,
            SpotStatus::Available
        );
        service.shutdown().unwrap();
        assert!(!service.is_running());
    }

    #[test]
    fn invalid_setup_is_rejected_without_side_effects() {
        let service = service(ScriptedBackend::default());
        let err = service
            .setup(&SetupRequest {
                video: String::new(),
                lines: lines(),
            })
            .unwrap_err();
        assert!(matches!(err, SetupError::Invalid(_)));
        let err = service
            .setup(&SetupRequest {
                video: "stub://lot".to_string(),
                lines: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, SetupError::Invalid(_)));
        assert!(service.registry().is_empty());
        assert!(!service.is_running());
    }

    #[test]
    fn failed_source_keeps_previous_scene() {
        let service = service(ScriptedBackend::default());
        service.setup(&request("stub://lot")).unwrap();
        let generation = service.registry().generation();

        let err = service
            .setup(&request("/nonexistent/spotwatch/lot.mp4"))
            .unwrap_err();
        assert!(matches!(err, SetupError::Start(_)));
        assert_eq!(service.registry().generation(), generation);
        assert!(service.is_running());
    }

    #[test]
    fn reservation_reports_structured_outcomes() {
        let service = service(ScriptedBackend::default());
        service.setup(&request("stub://lot")).unwrap();

        let ok = service.reserve("P2");
        assert!(ok.success, "{}", ok.message);
        let remaining = service.status().get("P2").unwrap().remaining_seconds.unwrap();
        assert!((298..=300).contains(&remaining));

        let again = service.reserve("P2");
        assert!(!again.success);
        assert!(again.message.contains("reserved"));

        let missing = service.reserve("P9");
        assert!(!missing.success);
        assert!(missing.message.contains("does not exist"));
    }
}
