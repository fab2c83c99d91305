//! Frame sources: something that can be opened into a stream of frames.
//!
//! Release is scoped: a stream holds its underlying resource until it is
//! dropped, so every exit path of a capture loop gives the device back.

use crate::camera::{Camera, CameraError, CameraStream};
use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "pgm"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("no frames available in {0}")]
    Empty(String),
}

/// Something that can be opened into a [`FrameStream`].
pub trait FrameSource {
    type Stream: FrameStream;

    /// Acquire the underlying resource and start producing frames.
    fn open(&mut self) -> Result<Self::Stream, SourceError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// An acquired frame producer. Dropping it releases the resource.
pub trait FrameStream {
    /// Next frame, or `Ok(None)` once the source has no more frames.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Live V4L2 camera.
pub struct CameraSource {
    device_path: String,
    warmup_frames: usize,
}

impl CameraSource {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
        }
    }
}

impl FrameSource for CameraSource {
    type Stream = CameraStream;

    fn open(&mut self) -> Result<CameraStream, SourceError> {
        let mut stream = Camera::open(&self.device_path)?.into_stream()?;

        // Discard warmup frames for exposure/gain stabilization
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                stream.capture()?;
            }
        }
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("camera {}", self.device_path)
    }
}

impl FrameStream for CameraStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Ok(Some(self.capture()?))
    }
}

/// A directory of still images replayed in file-name order.
pub struct ImageSequenceSource {
    dir: PathBuf,
}

impl ImageSequenceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FrameSource for ImageSequenceSource {
    type Stream = ImageSequenceStream;

    fn open(&mut self) -> Result<ImageSequenceStream, SourceError> {
        let paths = list_images(&self.dir)?;
        if paths.is_empty() {
            return Err(SourceError::Empty(self.dir.display().to_string()));
        }
        tracing::info!(dir = %self.dir.display(), frames = paths.len(), "image sequence opened");
        Ok(ImageSequenceStream {
            paths: paths.into_iter(),
            sequence: 0,
        })
    }

    fn describe(&self) -> String {
        format!("images in {}", self.dir.display())
    }
}

pub struct ImageSequenceStream {
    paths: std::vec::IntoIter<PathBuf>,
    sequence: u32,
}

impl FrameStream for ImageSequenceStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.next() else {
            return Ok(None);
        };
        let img = image::open(&path).map_err(|source| SourceError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        let frame = Frame::from_gray_image(img.to_luma8(), self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let io_err = |source| SourceError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
