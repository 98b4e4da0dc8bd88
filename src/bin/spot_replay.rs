//! spot_replay - run the occupancy engine offline over a video source.
//!
//! Replays a fixed number of cycles against a simulated clock and prints the
//! final status report as JSON. Useful for checking a line layout against a
//! recording before pointing the daemon at it.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use spotwatch::stream::{render_stream_frame, StreamKind};
use spotwatch::{
    open_source, status_report, BackendRegistry, FrameEncoder, FramePublisher, JpegEncoder,
    LineSegment, OccupancyEngine, OverlapMetric, ReservationScheduler, SetupRequest,
    SpotRegistry, SpotwatchConfig,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "spot_replay",
    about = "Replay a video source through the occupancy engine"
)]
struct Args {
    /// Video source: stub://name, an image directory, or a video file
    #[arg(long, value_name = "URI")]
    source: String,

    /// JSON file with the spot lines: a list of {x1,y1,x2,y2} or a setup
    /// object {"video", "lines"}
    #[arg(long, value_name = "PATH")]
    lines: PathBuf,

    /// Number of cycles to run
    #[arg(long, default_value_t = 10)]
    cycles: u64,

    /// Simulated time between cycles, in milliseconds
    #[arg(long, default_value_t = 1000)]
    step_ms: u64,

    /// Overlap metric (any_overlap|box_iou|mask_iou); defaults to the config
    #[arg(long)]
    metric: Option<String>,

    /// IoU threshold for the box_iou and mask_iou metrics
    #[arg(long)]
    iou_threshold: Option<f32>,

    /// Spot ids to reserve before the first cycle
    #[arg(long, value_delimiter = ',')]
    reserve: Vec<String>,

    /// Config file for detector and timing settings
    #[arg(long, env = "SPOTWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the last status frame as JPEG
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn read_lines(path: &PathBuf) -> Result<Vec<LineSegment>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read lines file {}", path.display()))?;
    if let Ok(lines) = serde_json::from_str::<Vec<LineSegment>>(&raw) {
        return Ok(lines);
    }
    let setup: SetupRequest = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid lines file {}: {}", path.display(), e))?;
    Ok(setup.lines)
}

/// Simulated clock for `cycle`: `t0 + step * cycle`.
fn cycle_time(t0: SystemTime, step: Duration, cycle: u64) -> Result<SystemTime> {
    let Some(offset) = u32::try_from(cycle).ok().and_then(|c| step.checked_mul(c)) else {
        bail!("cycle {} with step {:?} overflows the replay clock", cycle, step);
    };
    match t0.checked_add(offset) {
        Some(now) => Ok(now),
        None => bail!("cycle {} is past the end of the replay clock", cycle),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load config");
        SpotwatchConfig::load_from(args.config.as_deref())?
    };
    let mut settings = cfg.engine_settings();
    if let Some(metric) = &args.metric {
        settings.metric = OverlapMetric::from_name(metric, args.iou_threshold)?;
    }

    let registry = Arc::new(SpotRegistry::new(cfg.release_delay));
    {
        let _stage = ui.stage("Define spots");
        let lines = read_lines(&args.lines)?;
        if lines.is_empty() {
            return Err(anyhow!("{} contains no spot lines", args.lines.display()));
        }
        registry.define_from_lines(&lines)?;
    }

    let publisher = Arc::new(FramePublisher::new());
    let mut engine = {
        let _stage = ui.stage("Open source and detector");
        let backends = BackendRegistry::from_settings(&cfg.detector)?;
        let detector = backends
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        OccupancyEngine::start(
            open_source(&args.source)?,
            detector,
            registry.clone(),
            publisher.clone(),
            settings,
        )?
    };

    let t0 = SystemTime::now();
    for id in &args.reserve {
        let outcome = registry.try_set_reserved(id, cfg.reservation_hold, t0);
        if !outcome.is_success() {
            return Err(anyhow!("cannot reserve {}: {:?}", id, outcome));
        }
    }

    let scheduler = ReservationScheduler::new(registry.clone(), cfg.reservation_tick);
    let step = Duration::from_millis(args.step_ms);
    let mut now = t0;
    let mut progress = ui.cycles(args.cycles);
    for cycle in 0..args.cycles {
        now = cycle_time(t0, step, cycle)?;
        scheduler.tick(now);
        let summary = match engine.run_cycle(now) {
            Ok(report) => format!(
                "vehicles={} occupied={}",
                report.detections.vehicles,
                report.occupied.join(",")
            ),
            Err(err) => {
                log::warn!("cycle {} skipped: {:#}", cycle, err);
                "skipped".to_string()
            }
        };
        progress.tick(&summary);
    }
    let cycles_run = progress.done();
    drop(progress);

    if let Some(path) = &args.snapshot {
        let _stage = ui.stage("Write snapshot");
        let published = publisher
            .latest()
            .ok_or_else(|| anyhow!("no frame was published; nothing to snapshot"))?;
        let frame = render_stream_frame(StreamKind::Status, &published, &registry.snapshot());
        let encoded = JpegEncoder::new(cfg.stream.jpeg_quality)?.encode(&frame)?;
        std::fs::write(path, encoded.bytes)
            .with_context(|| format!("write snapshot {}", path.display()))?;
    }

    let stats = engine.source_stats();
    eprintln!(
        "spot_replay: {} cycles over {} ({} frames read, {} loops)",
        cycles_run, args.source, stats.frames_read, stats.loops
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&status_report(&registry, now))?
    );
    Ok(())
}
