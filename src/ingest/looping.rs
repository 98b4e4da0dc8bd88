use anyhow::{anyhow, Context, Result};

use super::VideoSource;
use crate::frame::Frame;

/// Counters for a looping source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_read: u64,
    pub loops: u64,
    pub read_errors: u64,
}

/// Endless view over a finite source.
///
/// End of stream and mid-run read errors both restart from the first frame.
/// Only a source that cannot produce a single frame right after a rewind
/// surfaces an error, so a broken source cannot spin the caller.
pub struct LoopingSource {
    inner: Box<dyn VideoSource>,
    stats: LoopStats,
}

impl LoopingSource {
    pub fn new(inner: Box<dyn VideoSource>) -> Self {
        Self {
            inner,
            stats: LoopStats::default(),
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.inner
            .connect()
            .with_context(|| format!("failed to open video source {}", self.inner.describe()))
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        match self.inner.next_frame() {
            Ok(Some(frame)) => {
                self.stats.frames_read += 1;
                return Ok(frame);
            }
            Ok(None) => {
                log::debug!("{}: end of stream, looping", self.inner.describe());
            }
            Err(err) => {
                self.stats.read_errors += 1;
                log::warn!(
                    "{}: read failed ({:#}), treating as end of stream",
                    self.inner.describe(),
                    err
                );
            }
        }

        self.inner.rewind()?;
        self.stats.loops += 1;
        match self.inner.next_frame()? {
            Some(frame) => {
                self.stats.frames_read += 1;
                Ok(frame)
            }
            None => Err(anyhow!(
                "{} produced no frames after rewind",
                self.inner.describe()
            )),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.clone()
    }

    pub fn describe(&self) -> String {
        self.inner.describe()
    }
}
