//! Face detection.
//!
//! [`FaceDetector`] is the narrow seam the session runner consumes. The
//! bundled implementation is SCRFD via ONNX Runtime: letterbox the frame to
//! 640x640, decode the score/box heads of the three strides, then NMS.
//! Landmark heads, if the model has them, are ignored.

use crate::types::BoundingBox;
use facemark_hw::Frame;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("shared detector unavailable: {0}")]
    Shared(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Reduces a frame to the faces it contains.
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Letterbox geometry, for mapping model coordinates back to the frame.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        // 6 outputs without landmark heads, 9 with
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            mapping = ?stride_indices,
            "SCRFD detector loaded"
        );

        Ok(Self {
            session,
            stride_indices,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    /// Faces sorted by descending confidence.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox(frame, SCRFD_INPUT_SIZE)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                SCRFD_INPUT_SIZE,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

static SHARED_DETECTOR: OnceLock<Mutex<ScrfdDetector>> = OnceLock::new();

/// Handle to the process-wide detector.
///
/// The model is loaded on first use and lives for the rest of the process.
/// Inference needs exclusive access to the ONNX session, so calls are
/// serialized through a mutex.
#[derive(Clone, Copy)]
pub struct SharedDetector {
    inner: &'static Mutex<ScrfdDetector>,
}

/// Get the shared detector, loading the model from `model_path` on first
/// call. Later calls return the already-loaded instance and ignore the path.
pub fn shared_detector(model_path: &Path) -> Result<SharedDetector, DetectorError> {
    if SHARED_DETECTOR.get().is_none() {
        let detector = ScrfdDetector::load(model_path)?;
        // A concurrent first call may have won the race; either instance is fine.
        let _ = SHARED_DETECTOR.set(Mutex::new(detector));
    }
    let inner = SHARED_DETECTOR
        .get()
        .ok_or_else(|| DetectorError::Shared("not initialized".into()))?;
    Ok(SharedDetector { inner })
}

impl FaceDetector for SharedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut detector = self
            .inner
            .lock()
            .map_err(|_| DetectorError::Shared("lock poisoned".into()))?;
        detector.detect(frame)
    }
}

/// Scale the frame into a square NCHW tensor, centered, preserving aspect.
///
/// Padding is left at 0.0, which is where the mean pixel normalizes to.
fn letterbox(frame: &Frame, size: usize) -> Result<(Array4<f32>, LetterboxInfo), DetectorError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(DetectorError::InvalidFrame("empty frame".into()));
    }
    let img = frame
        .to_gray_image()
        .map_err(|e| DetectorError::InvalidFrame(e.to_string()))?;

    let scale = (size as f32 / frame.width as f32).min(size as f32 / frame.height as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, size as u32);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, size as u32);
    let resized = imageops::resize(&img, new_w, new_h, FilterType::Triangle);

    let pad_x = (size - new_w as usize) / 2;
    let pad_y = (size - new_h as usize) / 2;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (ty, tx) = (y as usize + pad_y, x as usize + pad_x);
        // Grayscale → 3-channel
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalized;
        }
    }

    Ok((
        tensor,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    ))
}

/// Map each stride to its (score, bbox) output tensors.
///
/// Exports named `score_8`, `bbox_16`, ... are matched by name. Anything
/// else uses the standard positional layout: [0-2] scores, [3-5] boxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => named[slot] = (score, bbox),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

/// Decode detections above `threshold` for one stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut detections = Vec::new();
    for (idx, &score) in scores.iter().take(num_anchors).enumerate() {
        if score <= threshold {
            continue;
        }
        let Some(dist) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * step;
        let anchor_y = (cell / grid) as f32 * step;

        // distances to the left/top/right/bottom edges, in stride units
        let x1 = (anchor_x - dist[0] * step - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_y - dist[1] * step - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_x + dist[2] * step - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_y + dist[3] * step - letterbox.pad_y) / letterbox.scale;

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
    detections
}

/// Non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
