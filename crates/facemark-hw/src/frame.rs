//! Frame type and pixel helpers: YUYV conversion, dark detection, box overlay.

use image::GrayImage;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a decoded luma image as a frame.
    pub fn from_gray_image(img: GrayImage, sequence: u32) -> Self {
        let (width, height) = img.dimensions();
        let data = img.into_raw();
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }

    /// Copy the pixels into an `image` buffer, e.g. for PNG export.
    pub fn to_gray_image(&self) -> Result<GrayImage, FrameError> {
        let expected = (self.width * self.height) as usize;
        GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            },
        )
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Draw a one-pixel rectangle outline. Coordinates outside the frame are
    /// clamped to its border; a box entirely outside is skipped.
    pub fn draw_rect(&mut self, x: i64, y: i64, width: i64, height: i64, luma: u8) {
        let w = self.width as i64;
        let h = self.height as i64;
        if width <= 0 || height <= 0 || w == 0 || h == 0 {
            return;
        }
        let right = x.saturating_add(width);
        let bottom = y.saturating_add(height);
        if x >= w || y >= h || right <= 0 || bottom <= 0 {
            return;
        }
        if self.data.len() < (w * h) as usize {
            return;
        }

        let x0 = x.clamp(0, w - 1);
        let y0 = y.clamp(0, h - 1);
        let x1 = (right - 1).clamp(0, w - 1);
        let y1 = (bottom - 1).clamp(0, h - 1);

        for col in x0..=x1 {
            self.data[(y0 * w + col) as usize] = luma;
            self.data[(y1 * w + col) as usize] = luma;
        }
        for row in y0..=y1 {
            self.data[(row * w + x0) as usize] = luma;
            self.data[(row * w + x1) as usize] = luma;
        }
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Returns true if more than `threshold_pct` of pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: u32, height: u32, luma: u8) -> Frame {
        Frame::from_gray_image(GrayImage::from_pixel(width, height, image::Luma([luma])), 0)
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_from_gray_image_marks_dark() {
        assert!(blank(8, 8, 0).is_dark);
        assert!(!blank(8, 8, 200).is_dark);
        assert_eq!(blank(8, 4, 200).data.len(), 32);
    }

    #[test]
    fn test_draw_rect_outline() {
        let mut frame = blank(6, 6, 0);
        frame.draw_rect(1, 1, 4, 4, 255);
        let at = |x: usize, y: usize| frame.data[y * 6 + x];
        // corners and edges painted
        assert_eq!(at(1, 1), 255);
        assert_eq!(at(4, 4), 255);
        assert_eq!(at(2, 1), 255);
        assert_eq!(at(1, 3), 255);
        // interior and outside untouched
        assert_eq!(at(2, 2), 0);
        assert_eq!(at(0, 0), 0);
        assert_eq!(at(5, 5), 0);
    }

    #[test]
    fn test_draw_rect_clamps_and_skips() {
        let mut frame = blank(4, 4, 0);
        frame.draw_rect(-10, -10, 100, 100, 9);
        assert_eq!(frame.data[0], 9);
        assert_eq!(frame.data[15], 9);
        assert_eq!(frame.data[5], 0);

        let mut untouched = blank(4, 4, 0);
        untouched.draw_rect(10, 10, 5, 5, 9);
        untouched.draw_rect(0, 0, 0, 3, 9);
        assert!(untouched.data.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_draw_rect_huge_extent_clamps() {
        let mut frame = blank(8, 8, 0);
        frame.draw_rect(3, 3, f32::INFINITY.round() as i64, 4, 255);
        assert_eq!(frame.data[3 * 8 + 3], 255);
        assert_eq!(frame.data[3 * 8 + 7], 255);
        assert_eq!(frame.data[6 * 8 + 7], 255);

        let mut far = blank(8, 8, 0);
        far.draw_rect(i64::MAX, i64::MAX, i64::MAX, i64::MAX, 255);
        far.draw_rect(i64::MIN, 0, 4, 4, 255);
        assert!(far.data.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_to_gray_image_roundtrip_dimensions() {
        let frame = blank(5, 3, 77);
        let img = frame.to_gray_image().unwrap();
        assert_eq!(img.dimensions(), (5, 3));
        assert!((frame.avg_brightness() - 77.0).abs() < 1e-6);
    }
}
