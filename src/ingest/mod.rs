//! Frame sources.
//!
//! - Synthetic scenes (`stub://`) for tests and demos
//! - Directories of still images (JPEG/PNG), played in file-name order
//! - Video files and streams via FFmpeg (feature: ingest-file-ffmpeg)
//!
//! Every source is finite from the engine's point of view: `next_frame`
//! returns `Ok(None)` at the end and `rewind` seeks back to the first frame.
//! `LoopingSource` turns that into the endless stream the engine consumes.

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod images;
pub mod looping;
pub mod synthetic;

use std::path::Path;

use anyhow::Result;

use crate::frame::Frame;

pub use images::ImageSequenceSource;
pub use looping::{LoopStats, LoopingSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Sequential frame source with seek-to-start.
pub trait VideoSource: Send {
    /// Open the underlying stream. Failure here is fatal to the engine.
    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Pick a source implementation for a setup URI.
///
/// `stub://` selects the synthetic source and a directory selects the image
/// sequence source. Anything else is handed to FFmpeg.
pub fn open_source(uri: &str) -> Result<Box<dyn VideoSource>> {
    let uri = uri.trim();
    if uri.is_empty() {
        anyhow::bail!("video source must not be empty");
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig::from_uri(uri)?)));
    }
    if Path::new(uri).is_dir() {
        return Ok(Box::new(ImageSequenceSource::new(uri)));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegFileSource::new(uri)))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        anyhow::bail!(
            "video source '{}' requires the ingest-file-ffmpeg feature (only stub:// and image directories are built in)",
            uri
        )
    }
}
