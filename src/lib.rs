//! spotwatch
//!
//! Parking-spot occupancy engine: turns a looping video source into live
//! per-spot status and serves it, with annotated imagery, to any number of
//! concurrent viewers.
//!
//! # Architecture
//!
//! One engine thread runs a detection cycle per interval and writes two pieces
//! of shared state: the `SpotRegistry` (status per spot) and the
//! `FramePublisher` (latest frame plus detections). The reservation scheduler
//! and reservation requests also write the registry. Every HTTP viewer reads
//! both on its own thread. Each shared object has exactly one lock; readers
//! always receive copies.
//!
//! Spot status rules:
//!
//! 1. **Occupied on sight**: any confident vehicle overlapping a spot marks it
//!    Occupied, forfeiting an active reservation.
//! 2. **Debounced release**: Occupied reverts only after the release delay has
//!    passed with no detection.
//! 3. **Check-and-set reservations**: only an Available spot can be reserved,
//!    and concurrent requests for one spot admit exactly one winner.
//! 4. **Timed holds**: a reservation lapses back to Available once its hold
//!    time is over.
//!
//! # Module Structure
//!
//! - `geometry`, `overlap`: rectangles, masks and the configurable overlap metric
//! - `registry`: spot definitions and the status state machine
//! - `detect`: detector backends, detections and the vehicle filter
//! - `ingest`: video sources and the looping wrapper
//! - `engine`, `scheduler`, `task`: the background loops
//! - `frame`, `render`, `encode`, `stream`: publishing and viewer output
//! - `service`, `api`, `config`: the daemon surface

pub mod api;
pub mod config;
pub mod detect;
pub mod encode;
pub mod engine;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod overlap;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod service;
pub mod stream;
pub mod task;

pub use config::{DetectorSettings, SpotwatchConfig};
pub use detect::{
    BackendRegistry, Detection, DetectionBatch, DetectionFilter, DetectorBackend,
    ScriptedBackend, SharedDetector,
};
pub use encode::{EncodedImage, FrameEncoder, JpegEncoder};
pub use engine::{CycleReport, EngineSettings, OccupancyEngine};
pub use frame::{Frame, FramePublisher, PublishedFrame};
pub use geometry::{LineSegment, Point, Rect};
pub use ingest::{open_source, LoopingSource, VideoSource};
pub use overlap::{Mask, OverlapEvaluator, OverlapMetric};
pub use registry::{ReserveOutcome, Spot, SpotDefinition, SpotRegistry, SpotStatus, Transition};
pub use scheduler::ReservationScheduler;
pub use service::{ActionResponse, ParkingService, SetupError, SetupRequest, SetupSummary};
pub use stream::{status_report, SpotStatusView, StatusReport, StreamKind};
pub use task::{StopSignal, TaskHandle};
