use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{DetectionFilter, ScriptedDetection, DEFAULT_MIN_CONFIDENCE, VEHICLE_CLASS_IDS};
use crate::engine::EngineSettings;
use crate::geometry::LineSegment;
use crate::overlap::{OverlapMetric, DEFAULT_IOU_THRESHOLD};
use crate::service::SetupRequest;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_RESERVATION_HOLD_SECS: u64 = 300;
const DEFAULT_RESERVATION_TICK_MS: u64 = 1000;
const DEFAULT_RELEASE_DELAY_SECS: u64 = 3;
const DEFAULT_ANALYSIS_INTERVAL_MS: u64 = 1000;
const DEFAULT_STREAM_INTERVAL_MS: u64 = 100;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_BACKEND: &str = "scripted";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_METRIC: &str = "any_overlap";

#[derive(Debug, Deserialize, Default)]
struct SpotwatchConfigFile {
    api: Option<ApiConfigFile>,
    reservations: Option<ReservationConfigFile>,
    occupancy: Option<OccupancyConfigFile>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
    setup: Option<SetupConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReservationConfigFile {
    hold_secs: Option<u64>,
    tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OccupancyConfigFile {
    release_delay_secs: Option<u64>,
    interval_ms: Option<u64>,
    metric: Option<String>,
    iou_threshold: Option<f32>,
    render_inspection: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    min_confidence: Option<f32>,
    classes: Option<Vec<u32>>,
    script: Option<Vec<Vec<ScriptedDetection>>>,
}

#[derive(Debug, Deserialize)]
struct SetupConfigFile {
    video: String,
    lines: Vec<LineSegment>,
}

#[derive(Debug, Clone)]
pub struct SpotwatchConfig {
    pub api_addr: String,
    pub reservation_hold: Duration,
    pub reservation_tick: Duration,
    pub release_delay: Duration,
    pub analysis_interval: Duration,
    pub metric: OverlapMetric,
    pub render_inspection: bool,
    pub stream: StreamSettings,
    pub detector: DetectorSettings,
    /// Scene to set up at daemon start, before any request arrives.
    pub setup: Option<SetupRequest>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub min_confidence: f32,
    pub allowed_classes: Vec<u32>,
    /// Per-call detection batches for the scripted backend.
    pub script: Vec<Vec<ScriptedDetection>>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            allowed_classes: VEHICLE_CLASS_IDS.to_vec(),
            script: Vec::new(),
        }
    }
}

impl Default for SpotwatchConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            reservation_hold: Duration::from_secs(DEFAULT_RESERVATION_HOLD_SECS),
            reservation_tick: Duration::from_millis(DEFAULT_RESERVATION_TICK_MS),
            release_delay: Duration::from_secs(DEFAULT_RELEASE_DELAY_SECS),
            analysis_interval: Duration::from_millis(DEFAULT_ANALYSIS_INTERVAL_MS),
            metric: OverlapMetric::default(),
            render_inspection: true,
            stream: StreamSettings {
                interval: Duration::from_millis(DEFAULT_STREAM_INTERVAL_MS),
                jpeg_quality: DEFAULT_JPEG_QUALITY,
            },
            detector: DetectorSettings::default(),
            setup: None,
        }
    }
}

impl SpotwatchConfig {
    /// Resolve config from `SPOTWATCH_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SPOTWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file in place of `SPOTWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SpotwatchConfigFile) -> Result<Self> {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let reservations = file.reservations.unwrap_or_default();
        let reservation_hold = Duration::from_secs(
            reservations
                .hold_secs
                .unwrap_or(DEFAULT_RESERVATION_HOLD_SECS),
        );
        let reservation_tick = Duration::from_millis(
            reservations.tick_ms.unwrap_or(DEFAULT_RESERVATION_TICK_MS),
        );

        let occupancy = file.occupancy.unwrap_or_default();
        let release_delay = Duration::from_secs(
            occupancy
                .release_delay_secs
                .unwrap_or(DEFAULT_RELEASE_DELAY_SECS),
        );
        let analysis_interval = Duration::from_millis(
            occupancy
                .interval_ms
                .unwrap_or(DEFAULT_ANALYSIS_INTERVAL_MS),
        );
        let metric = OverlapMetric::from_name(
            occupancy.metric.as_deref().unwrap_or(DEFAULT_METRIC),
            occupancy.iou_threshold,
        )?;
        let render_inspection = occupancy.render_inspection.unwrap_or(true);

        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            interval: Duration::from_millis(
                stream.interval_ms.unwrap_or(DEFAULT_STREAM_INTERVAL_MS),
            ),
            jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let detector_file = file.detector.unwrap_or_default();
        let defaults = DetectorSettings::default();
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(defaults.backend),
            model_path: detector_file.model_path,
            input_size: detector_file.input_size.unwrap_or(defaults.input_size),
            min_confidence: detector_file
                .min_confidence
                .unwrap_or(defaults.min_confidence),
            allowed_classes: detector_file
                .classes
                .unwrap_or(defaults.allowed_classes),
            script: detector_file.script.unwrap_or_default(),
        };

        let setup = file.setup.map(|setup| SetupRequest {
            video: setup.video,
            lines: setup.lines,
        });

        Ok(Self {
            api_addr,
            reservation_hold,
            reservation_tick,
            release_delay,
            analysis_interval,
            metric,
            render_inspection,
            stream,
            detector,
            setup,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SPOTWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Some(secs) = env_u64("SPOTWATCH_RESERVATION_HOLD_SECS")? {
            self.reservation_hold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SPOTWATCH_RELEASE_DELAY_SECS")? {
            self.release_delay = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("SPOTWATCH_ANALYSIS_INTERVAL_MS")? {
            self.analysis_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SPOTWATCH_STREAM_INTERVAL_MS")? {
            self.stream.interval = Duration::from_millis(ms);
        }
        if let Ok(metric) = std::env::var("SPOTWATCH_OVERLAP_METRIC") {
            if !metric.trim().is_empty() {
                let threshold = match std::env::var("SPOTWATCH_IOU_THRESHOLD") {
                    Ok(raw) => Some(raw.trim().parse::<f32>().map_err(|_| {
                        anyhow!("SPOTWATCH_IOU_THRESHOLD must be a number between 0 and 1")
                    })?),
                    Err(_) => match self.metric {
                        OverlapMetric::BoxIou { threshold }
                        | OverlapMetric::MaskIou { threshold } => Some(threshold),
                        OverlapMetric::AnyOverlap => Some(DEFAULT_IOU_THRESHOLD),
                    },
                };
                self.metric = OverlapMetric::from_name(&metric, threshold)?;
            }
        }
        if let Ok(backend) = std::env::var("SPOTWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("SPOTWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(raw) = std::env::var("SPOTWATCH_MIN_CONFIDENCE") {
            self.detector.min_confidence = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("SPOTWATCH_MIN_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(classes) = std::env::var("SPOTWATCH_CLASSES") {
            let parsed = split_csv(&classes)
                .iter()
                .map(|c| {
                    c.parse::<u32>()
                        .map_err(|_| anyhow!("SPOTWATCH_CLASSES entry '{}' is not a class id", c))
                })
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.detector.allowed_classes = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("api addr '{}' is not a socket address: {}", self.api_addr, e))?;
        if self.reservation_hold.is_zero() {
            return Err(anyhow!("reservation hold must be greater than zero"));
        }
        if self.reservation_tick.is_zero() {
            return Err(anyhow!("reservation tick must be greater than zero"));
        }
        if self.analysis_interval.is_zero() {
            return Err(anyhow!("analysis interval must be greater than zero"));
        }
        if self.stream.interval.is_zero() {
            return Err(anyhow!("stream interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        self.metric.validate()?;
        if !(0.0..1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("min confidence must be in [0, 1)"));
        }
        if self.detector.allowed_classes.is_empty() {
            return Err(anyhow!("at least one detector class must be allowed"));
        }
        self.detector.allowed_classes.sort_unstable();
        self.detector.allowed_classes.dedup();
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input size must be greater than zero"));
        }
        if let Some(setup) = &self.setup {
            setup.validate()?;
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            interval: self.analysis_interval,
            filter: DetectionFilter {
                allowed_classes: self.detector.allowed_classes.clone(),
                min_confidence: self.detector.min_confidence,
            },
            metric: self.metric,
            render_inspection: self.render_inspection,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SpotwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", name)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
