//! Terminal output plus an optional PNG preview of the latest frame.

use facemark_core::{Renderer, Severity};
use facemark_hw::Frame;
use std::path::PathBuf;

pub struct TerminalRenderer {
    preview: Option<PathBuf>,
    preview_failed: bool,
}

impl TerminalRenderer {
    pub fn new(preview: Option<PathBuf>) -> Self {
        Self {
            preview,
            preview_failed: false,
        }
    }

    fn write_preview(&mut self, frame: &Frame) {
        let Some(path) = &self.preview else {
            return;
        };
        if self.preview_failed {
            return;
        }
        let result = frame
            .to_gray_image()
            .map_err(|e| e.to_string())
            .and_then(|img| img.save(path).map_err(|e| e.to_string()));
        if let Err(error) = result {
            // warn once, then stop trying for the rest of the session
            tracing::warn!(path = %path.display(), %error, "preview write failed");
            self.preview_failed = true;
        }
    }
}

impl Renderer for TerminalRenderer {
    fn show_frame(&mut self, frame: &Frame) {
        self.write_preview(frame);
    }

    fn show_status(&mut self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => println!("{message}"),
            Severity::Success => println!("[ok] {message}"),
            Severity::Warning => eprintln!("[warn] {message}"),
            Severity::Error => eprintln!("[error] {message}"),
        }
    }
}
