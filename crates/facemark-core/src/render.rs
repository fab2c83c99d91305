use crate::types::BoundingBox;
use facemark_hw::Frame;

/// Luma used for face outlines drawn onto frames.
pub const OVERLAY_LUMA: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One-way output for a running session.
pub trait Renderer {
    /// Present a frame, already annotated with detections.
    fn show_frame(&mut self, frame: &Frame);

    fn show_status(&mut self, message: &str, severity: Severity);
}

/// Copy of `frame` with every face outlined. Boxes with non-finite
/// coordinates are not drawn.
pub fn annotate(frame: &Frame, faces: &[BoundingBox]) -> Frame {
    let mut out = frame.clone();
    let drawable = faces.iter().filter(|f| {
        [f.x, f.y, f.width, f.height]
            .iter()
            .all(|v| v.is_finite())
    });
    for face in drawable {
        out.draw_rect(
            face.x.round() as i64,
            face.y.round() as i64,
            face.width.round() as i64,
            face.height.round() as i64,
            OVERLAY_LUMA,
        );
    }
    out
}
