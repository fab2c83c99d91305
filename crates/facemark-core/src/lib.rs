//! facemark-core: attendance recording driven by face presence.
//!
//! A session takes a self-reported name, watches frames until a face has
//! been present for a sustained run, then appends one attendance row per
//! name per day to a CSV table.

pub mod clock;
pub mod debounce;
pub mod detector;
pub mod render;
pub mod runner;
pub mod session;
pub mod store;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use debounce::{PresenceDebouncer, DEFAULT_CONFIRM_FRAMES};
pub use detector::{shared_detector, DetectorError, FaceDetector, ScrfdDetector, SharedDetector};
pub use render::{Renderer, Severity};
pub use runner::{SessionReport, SessionRunner, DEFAULT_FRAME_INTERVAL};
pub use session::{Phase, SessionController, SessionError, SessionState, StopReason, SubjectName};
pub use store::{AttendanceStore, StoreError};
pub use types::{AppendOutcome, AttendanceRecord, BoundingBox};

use std::path::PathBuf;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/facemark`, falling back to
/// `~/.local/share/facemark`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facemark")
}

/// Default directory holding the ONNX models.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
