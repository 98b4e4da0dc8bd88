//! Video file/stream source using FFmpeg.
//!
//! Frames are decoded in-memory and converted to RGB24. Rewinding seeks the
//! demuxer back to the start and flushes the decoder.

use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::VideoSource;
use crate::frame::Frame;

struct Opened {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

pub(crate) struct FfmpegFileSource {
    path: String,
    opened: Option<Opened>,
    position: u64,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            opened: None,
            position: 0,
            eof_sent: false,
        }
    }
}

impl VideoSource for FfmpegFileSource {
    fn connect(&mut self) -> Result<()> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&self.path)
            .with_context(|| format!("failed to open video input '{}' with ffmpeg", self.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", self.path))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegFileSource: connected to {} ({}x{})",
            self.path,
            decoder.width(),
            decoder.height()
        );
        self.opened = Some(Opened {
            input,
            stream_index,
            decoder,
            scaler,
        });
        self.position = 0;
        self.eof_sent = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let opened = self
            .opened
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source read before connect"))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        loop {
            if opened.decoder.receive_frame(&mut decoded).is_ok() {
                opened
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                let frame = Frame::new(pixels, width, height, SystemTime::now())?
                    .with_index(self.position);
                self.position += 1;
                return Ok(Some(frame));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut fed = false;
            for (stream, packet) in opened.input.packets() {
                if stream.index() != opened.stream_index {
                    continue;
                }
                opened
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                fed = true;
                break;
            }
            if !fed {
                opened.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        let opened = self
            .opened
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source rewound before connect"))?;
        opened
            .input
            .seek(0, ..)
            .with_context(|| format!("seek '{}' to start", self.path))?;
        opened.decoder.flush();
        self.position = 0;
        self.eof_sent = false;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
