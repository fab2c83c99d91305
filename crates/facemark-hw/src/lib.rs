//! facemark-hw: frame acquisition for the attendance recorder.
//!
//! Provides V4L2 webcam capture, an image-sequence replay source, and the
//! grayscale [`Frame`] type shared by the rest of the workspace.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CameraSource, FrameSource, FrameStream, ImageSequenceSource, SourceError};
