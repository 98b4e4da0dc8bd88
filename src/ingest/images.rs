//! Image-sequence source: a directory of JPEG/PNG stills played in file-name
//! order, e.g. frames exported from a recording.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use super::VideoSource;
use crate::frame::Frame;

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
}

impl ImageSequenceSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn decode(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .into_rgb8())
}

impl VideoSource for ImageSequenceSource {
    fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to open image directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no JPEG/PNG frames in {}", self.dir.display()));
        }
        files.sort();
        let (width, height) = decode(&files[0])?.dimensions();
        log::info!(
            "ImageSequenceSource: connected to {} ({} frames, {}x{})",
            self.dir.display(),
            files.len(),
            width,
            height
        );
        self.files = files;
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.position) else {
            return Ok(None);
        };
        let index = self.position as u64;
        self.position += 1;
        let image = decode(path)?;
        let (width, height) = image.dimensions();
        let frame = Frame::new(image.into_raw(), width, height, SystemTime::now())?;
        Ok(Some(frame.with_index(index)))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 200u8), ("a.png", 10u8)] {
            RgbImage::from_pixel(4, 3, image::Rgb([shade, shade, shade]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::new(dir.path());
        source.connect().unwrap();
        assert_eq!(source.len(), 2);
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (4, 3));
        assert_eq!(first.pixel(0, 0), Some([10, 10, 10]));
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_directory_fails_to_connect() {
        let mut source = ImageSequenceSource::new("/nonexistent/spotwatch/frames");
        assert!(source.connect().is_err());
    }

    #[test]
    fn undecodable_first_frame_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("000.jpg"), b"not a jpeg").unwrap();
        RgbImage::from_pixel(4, 3, image::Rgb([1, 2, 3]))
            .save(dir.path().join("001.png"))
            .unwrap();

        let mut source = ImageSequenceSource::new(dir.path());
        let err = source.connect().unwrap_err();
        assert!(format!("{:#}", err).contains("000.jpg"), "{:#}", err);
        assert!(source.is_empty());
    }
}
