use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved configuration: defaults, then the TOML file, then `FACEMARK_*`
/// environment variables. CLI flags are applied on top by `main`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX detector model.
    pub model_dir: PathBuf,
    /// Path to the attendance CSV table.
    pub store_path: PathBuf,
    /// Consecutive face frames needed to confirm presence.
    pub confirm_frames: u32,
    /// Pause between frames, in milliseconds.
    pub frame_interval_ms: u64,
    /// Frames discarded after opening the camera (exposure stabilization).
    pub warmup_frames: usize,
}

/// On-disk config file; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    confirm_frames: Option<u32>,
    frame_interval_ms: Option<u64>,
    warmup_frames: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: facemark_core::default_model_dir(),
            store_path: facemark_core::default_data_dir().join("attendance.csv"),
            confirm_frames: facemark_core::DEFAULT_CONFIRM_FRAMES,
            frame_interval_ms: facemark_core::DEFAULT_FRAME_INTERVAL.as_millis() as u64,
            warmup_frames: 4,
        }
    }
}

impl Config {
    /// Load from the config file (if present) and the process environment.
    pub fn load() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = Self::default();
        if let Some(path) = config_file_path(lookup) {
            if path.exists() {
                config.apply_file(&path)?;
            }
        }
        config.apply_env(lookup);
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let file: FileConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");

        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.store_path {
            self.store_path = v;
        }
        if let Some(v) = file.confirm_frames {
            self.confirm_frames = v;
        }
        if let Some(v) = file.frame_interval_ms {
            self.frame_interval_ms = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        Ok(())
    }

    /// Unparseable numeric values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEMARK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEMARK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEMARK_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = parse_env(&lookup, "FACEMARK_CONFIRM_FRAMES") {
            self.confirm_frames = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEMARK_FRAME_INTERVAL_MS") {
            self.frame_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "FACEMARK_WARMUP_FRAMES") {
            self.warmup_frames = v;
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(facemark_core::DETECTOR_MODEL_FILE)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// `$FACEMARK_CONFIG`, else `$XDG_CONFIG_HOME/facemark/config.toml`, else
/// `~/.config/facemark/config.toml`.
fn config_file_path(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(explicit) = lookup("FACEMARK_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let base = lookup("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("facemark").join("config.toml"))
}

fn parse_env<T: std::str::FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
