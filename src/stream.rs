//! Per-viewer MJPEG streams and the JSON status snapshot.
//!
//! Every viewer runs its own loop against the shared publisher and registry:
//! snapshot, overlay, encode, write one multipart part, sleep. Viewers never
//! wait on each other and a slow or vanished viewer only ends its own loop.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

use crate::encode::{EncodedImage, FrameEncoder};
use crate::frame::{Frame, FramePublisher, PublishedFrame};
use crate::registry::{Spot, SpotRegistry, SpotStatus};
use crate::render::Overlay;
use crate::task::StopSignal;

pub const DEFAULT_STREAM_INTERVAL: Duration = Duration::from_millis(100);
pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// Raw frames with spot rectangles coloured by status.
    Status,
    /// Detection boxes, labels, confidences and batch counts.
    Inspection,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Inspection => "inspection",
        }
    }
}

/// Shared inputs for every viewer loop.
#[derive(Clone)]
pub struct StreamContext {
    pub publisher: Arc<FramePublisher>,
    pub registry: Arc<SpotRegistry>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub interval: Duration,
}

/// Build the image a viewer of `kind` should see for `published`.
pub fn render_stream_frame(kind: StreamKind, published: &PublishedFrame, spots: &[Spot]) -> Frame {
    match kind {
        StreamKind::Status => {
            let mut frame = published.raw.clone();
            Overlay::SpotStatus.apply(&mut frame, spots, &published.detections);
            frame
        }
        StreamKind::Inspection => match &published.inspection {
            Some(frame) => frame.clone(),
            None => {
                let mut frame = published.raw.clone();
                Overlay::Detections.apply(&mut frame, spots, &published.detections);
                frame
            }
        },
    }
}

/// Write one `--frame` part.
pub fn write_part<W: Write>(writer: &mut W, image: &EncodedImage) -> std::io::Result<()> {
    let header = format!(
        "--{}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        image.content_type,
        image.bytes.len()
    );
    writer.write_all(header.as_bytes())?;
    writer.write_all(&image.bytes)?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

/// Stream parts to `writer` until the viewer goes away or `stop` fires.
/// Returns the number of parts written.
///
/// Before the first publish the loop keeps polling and writes nothing.
pub fn serve_stream<W: Write>(
    writer: &mut W,
    kind: StreamKind,
    ctx: &StreamContext,
    stop: &StopSignal,
) -> Result<u64> {
    let mut parts = 0u64;
    while !stop.is_stopped() {
        let Some(published) = ctx.publisher.latest() else {
            if stop.wait_timeout(ctx.interval) {
                break;
            }
            continue;
        };
        let spots = match kind {
            StreamKind::Status => ctx.registry.snapshot(),
            StreamKind::Inspection => Vec::new(),
        };
        let frame = render_stream_frame(kind, &published, &spots);
        let image = ctx.encoder.encode(&frame)?;
        if let Err(err) = write_part(writer, &image) {
            log::debug!("{} stream viewer disconnected: {}", kind.as_str(), err);
            break;
        }
        parts += 1;
        if stop.wait_timeout(ctx.interval) {
            break;
        }
    }
    Ok(parts)
}

/// One spot as reported by the status query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpotStatusView {
    pub status: SpotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupied_since: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

/// Spot id to status, serialized as a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StatusReport(pub BTreeMap<String, SpotStatusView>);

impl StatusReport {
    pub fn get(&self, id: &str) -> Option<&SpotStatusView> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn unix_seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn status_report(registry: &SpotRegistry, now: SystemTime) -> StatusReport {
    StatusReport(
        registry
            .snapshot()
            .into_iter()
            .map(|spot| {
                let view = SpotStatusView {
                    status: spot.status,
                    occupied_since: spot.occupied_since.map(unix_seconds),
                    reserved_until: spot.reserved_until.map(unix_seconds),
                    remaining_seconds: spot.remaining_hold(now),
                };
                (spot.id, view)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, DetectionBatch, DetectionFilter};
    use crate::encode::JpegEncoder;
    use crate::geometry::Rect;
    use crate::registry::SpotDefinition;
    use crate::render::{COLOR_AVAILABLE, COLOR_TEXT, COLOR_VEHICLE};
    use std::sync::Mutex;

    /// Keeps every frame it is asked to encode.
    #[derive(Default)]
    struct RecordingEncoder {
        frames: Mutex<Vec<Frame>>,
    }

    impl FrameEncoder for RecordingEncoder {
        fn content_type(&self) -> &'static str {
            "image/x-test"
        }

        fn encode(&self, frame: &Frame) -> Result<EncodedImage> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(EncodedImage {
                content_type: self.content_type(),
                bytes: vec![0xAB],
            })
        }
    }

    /// Accepts `budget` writes, then fails like a closed socket.
    struct ClosingWriter {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ClosingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "viewer closed",
                ));
            }
            self.budget -= 1;
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn context() -> StreamContext {
        let registry = Arc::new(SpotRegistry::new(Duration::from_secs(3)));
        registry
            .define(vec![SpotDefinition::new("P1", Rect::new(2.0, 2.0, 60.0, 60.0))])
            .unwrap();
        StreamContext {
            publisher: Arc::new(FramePublisher::new()),
            registry,
            encoder: Arc::new(JpegEncoder::default()),
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn part_framing_matches_multipart_layout() {
        let mut out = Vec::new();
        let image = EncodedImage {
            content_type: "image/jpeg",
            bytes: vec![1, 2, 3],
        };
        write_part(&mut out, &image).unwrap();
        assert_eq!(
            out,
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n\x01\x02\x03\r\n"
        );
    }

    #[test]
    fn status_frame_carries_spot_outline() {
        let ctx = context();
        ctx.publisher
            .publish(Frame::blank(64, 64), None, DetectionBatch::default());
        let published = ctx.publisher.latest().unwrap();
        let frame = render_stream_frame(StreamKind::Status, &published, &ctx.registry.snapshot());
        assert_eq!(frame.pixel(30, 60), Some(COLOR_AVAILABLE));
        // Publisher copy stays clean.
        assert_eq!(ctx.publisher.snapshot_raw().unwrap().pixel(30, 60), Some([0, 0, 0]));
    }

    #[test]
    fn loop_ends_when_viewer_disconnects() {
        let ctx = context();
        ctx.publisher
            .publish(Frame::blank(16, 16), None, DetectionBatch::default());
        // Three writes per part, so the third header hits the closed socket.
        let mut writer = ClosingWriter {
            data: Vec::new(),
            budget: 6,
        };
        let parts = serve_stream(&mut writer, StreamKind::Status, &ctx, &StopSignal::new()).unwrap();
        assert_eq!(parts, 2);
        assert!(writer.data.starts_with(b"--frame\r\n"));
    }

    #[test]
    fn inspection_stream_draws_detections_and_counts() {
        let encoder = Arc::new(RecordingEncoder::default());
        let ctx = StreamContext {
            encoder: encoder.clone(),
            ..context()
        };
        let batch = DetectionFilter::default().partition(vec![
            Detection::coco(Rect::new(100.0, 100.0, 180.0, 160.0), 2, 0.9),
            Detection::coco(Rect::new(200.0, 100.0, 220.0, 160.0), 0, 0.8),
        ]);
        ctx.publisher.publish(Frame::blank(320, 240), None, batch);

        let mut writer = ClosingWriter {
            data: Vec::new(),
            budget: 3,
        };
        let parts = serve_stream(&mut writer, StreamKind::Inspection, &ctx, &StopSignal::new()).unwrap();
        assert_eq!(parts, 1);
        assert!(writer
            .data
            .starts_with(b"--frame\r\nContent-Type: image/x-test\r\nContent-Length: 1\r\n\r\n"));

        let frames = encoder.frames.lock().unwrap();
        let frame = &frames[0];
        assert_eq!(frame.pixel(140, 160), Some(COLOR_VEHICLE));
        // Header band carries white text in the top-left corner.
        let header_text = (0..20)
            .flat_map(|y| (0..200).map(move |x| (x, y)))
            .filter(|&(x, y)| {
                frame
                    .pixel(x, y)
                    .is_some_and(|p| p.iter().zip(COLOR_TEXT).all(|(&c, t)| c > t / 2))
            })
            .count();
        assert!(header_text > 0);
    }

    #[test]
    fn no_part_is_written_before_first_frame() {
        let ctx = context();
        let stop = StopSignal::new();
        let remote = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.stop();
        });
        let mut out = Vec::new();
        let parts = serve_stream(&mut out, StreamKind::Inspection, &ctx, &stop).unwrap();
        stopper.join().unwrap();
        assert_eq!(parts, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn report_includes_remaining_hold_only_for_reservations() {
        let ctx = context();
        let t0 = UNIX_EPOCH + Duration::from_secs(10_000);
        let report = status_report(&ctx.registry, t0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["P1"]["status"], "available");
        assert!(json["P1"].get("remaining_seconds").is_none());

        assert!(ctx
            .registry
            .try_set_reserved("P1", Duration::from_secs(300), t0)
            .is_success());
        let report = status_report(&ctx.registry, t0 + Duration::from_secs(10));
        let p1 = report.get("P1").unwrap();
        assert_eq!(p1.status, SpotStatus::Reserved);
        assert_eq!(p1.remaining_seconds, Some(290));
        assert_eq!(p1.reserved_until, Some(10_300.0));

        let late = status_report(&ctx.registry, t0 + Duration::from_secs(400));
        assert_eq!(late.get("P1").unwrap().remaining_seconds, Some(0));
    }
}
