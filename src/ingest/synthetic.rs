//! Synthetic frame source (`stub://`) for tests and demos.
//!
//! URI form: `stub://name?frames=N&width=W&height=H&fail_at=K`.
//! The source yields `frames` frames per pass and then reports exhaustion.
//! `fail_at` makes the K-th read of each pass return an error, which is how
//! tests exercise mid-run read failures.

use std::time::SystemTime;

use anyhow::{anyhow, Result};

use super::VideoSource;
use crate::frame::Frame;

/// Largest frame the source will generate, in pixels.
pub const MAX_PIXELS: u64 = 4096 * 4096;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fail_at: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "lot".to_string(),
            frames: 300,
            width: 640,
            height: 480,
            fail_at: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source URI must start with stub://"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut cfg = Self {
            name: name.to_string(),
            ..Self::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed query parameter '{}'", pair))?;
            let parse = |v: &str| -> Result<u64> {
                v.parse()
                    .map_err(|_| anyhow!("{} must be an integer, got '{}'", key, v))
            };
            match key {
                "frames" => cfg.frames = parse(value)?,
                "width" | "height" => {
                    let parsed = parse(value)?;
                    let dim = u32::try_from(parsed)
                        .map_err(|_| anyhow!("{} {} is out of range", key, parsed))?;
                    if key == "width" {
                        cfg.width = dim;
                    } else {
                        cfg.height = dim;
                    }
                }
                "fail_at" => cfg.fail_at = Some(parse(value)?),
                other => return Err(anyhow!("unknown synthetic source option '{}'", other)),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames == 0 || self.width == 0 || self.height == 0 {
            return Err(anyhow!("synthetic source needs non-zero frames, width and height"));
        }
        let pixels = u64::from(self.width) * u64::from(self.height);
        if pixels > MAX_PIXELS {
            return Err(anyhow!(
                "synthetic frame {}x{} exceeds {} pixels",
                self.width,
                self.height,
                MAX_PIXELS
            ));
        }
        Ok(())
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    position: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            position: 0,
            connected: false,
        }
    }

    /// Diagonal gradient that drifts with the frame position, plus a little
    /// sensor noise so consecutive frames never encode identically.
    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as u64, self.config.height as u64);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let base = (x + y + self.position) % 256;
                let noise = rand::random::<u8>() % 8;
                pixels.push((base as u8).wrapping_add(noise));
                pixels.push(((y * 255) / h.max(1)) as u8);
                pixels.push(96);
            }
        }
        pixels
    }
}

impl VideoSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.config.validate()?;
        self.connected = true;
        log::info!("SyntheticSource: connected to stub://{}", self.config.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic source read before connect"));
        }
        if self.position >= self.config.frames {
            return Ok(None);
        }
        self.position += 1;
        if self.config.fail_at == Some(self.position) {
            return Err(anyhow!("synthetic read failure at frame {}", self.position));
        }
        let frame = Frame::new(
            self.generate_pixels(),
            self.config.width,
            self.config.height,
            SystemTime::now(),
        )?;
        Ok(Some(frame.with_index(self.position - 1)))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }
}
