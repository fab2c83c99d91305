//! The capture loop: frame → detect → debounce → render, until the session
//! reaches a terminal state.
//!
//! Single-threaded and synchronous. The stop flag is sampled once per
//! iteration, so a blocked frame read delays cancellation until it returns.
//! The frame stream is owned by [`SessionRunner::run`] and dropped on every
//! exit path, which releases the device.

use crate::clock::Clock;
use crate::detector::FaceDetector;
use crate::render::{annotate, Renderer, Severity};
use crate::session::{
    Phase, SessionController, SessionError, SessionState, StopReason, SubjectName,
};
use crate::types::{AppendOutcome, AttendanceRecord};
use facemark_hw::{FrameSource, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default pause between frames (~10 fps).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Terminal summary of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub subject: String,
    pub phase: Phase,
    /// Record submitted to the store, if presence was confirmed.
    pub record: Option<AttendanceRecord>,
    pub frames: u64,
}

impl SessionReport {
    fn from_state(state: &SessionState) -> Self {
        Self {
            subject: state.subject().unwrap_or_default().to_string(),
            phase: state.phase().clone(),
            record: state.record().cloned(),
            frames: state.frames(),
        }
    }

    /// User-facing outcome line.
    pub fn message(&self) -> String {
        match &self.phase {
            Phase::Finalized(AppendOutcome::Appended) => "marked successfully".into(),
            Phase::Finalized(AppendOutcome::AlreadyPresent) => "already marked today".into(),
            Phase::Finalized(AppendOutcome::Failed(reason)) => format!("error: {reason}"),
            Phase::Stopped(StopReason::Cancelled) => "stopped before attendance was marked".into(),
            Phase::Stopped(StopReason::SourceUnavailable(reason)) => {
                format!("error: camera unavailable: {reason}")
            }
            Phase::Stopped(StopReason::SourceFailed(reason)) => {
                format!("error: camera failed: {reason}")
            }
            Phase::Stopped(StopReason::DetectorFailed(reason)) => {
                format!("error: face detection failed: {reason}")
            }
            other => format!("session {}", other.name()),
        }
    }

    pub fn severity(&self) -> Severity {
        match &self.phase {
            Phase::Finalized(AppendOutcome::Appended) => Severity::Success,
            Phase::Finalized(AppendOutcome::AlreadyPresent) => Severity::Info,
            Phase::Stopped(StopReason::Cancelled) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Attendance is on record (now or from earlier today).
    pub fn is_success(&self) -> bool {
        matches!(
            self.phase,
            Phase::Finalized(AppendOutcome::Appended | AppendOutcome::AlreadyPresent)
        )
    }
}

/// Runs sessions with a fixed detector and renderer.
pub struct SessionRunner<'a, C, D, R> {
    controller: &'a SessionController<C>,
    detector: D,
    renderer: R,
    frame_interval: Duration,
}

impl<'a, C: Clock, D: FaceDetector, R: Renderer> SessionRunner<'a, C, D, R> {
    pub fn new(controller: &'a SessionController<C>, detector: D, renderer: R) -> Self {
        Self {
            controller,
            detector,
            renderer,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Run one session for `name` against `source` until it is marked,
    /// rejected, fails, or `stop` is raised.
    ///
    /// Only name validation is returned as `Err`; it happens before the
    /// source is touched. Everything else ends in a [`SessionReport`].
    pub fn run<S: FrameSource>(
        &mut self,
        name: &str,
        source: &mut S,
        stop: &AtomicBool,
    ) -> Result<SessionReport, SessionError> {
        let subject = match SubjectName::parse(name) {
            Ok(subject) => subject,
            Err(e) => {
                self.renderer.show_status(&e.to_string(), Severity::Warning);
                return Err(e);
            }
        };
        let ctl = self.controller;
        let state = ctl.submit_name(ctl.begin(), subject)?;

        let mut stream = match source.open() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(source = %source.describe(), error = %e, "frame source unavailable");
                let state = ctl.abort(state, StopReason::SourceUnavailable(e.to_string()));
                return Ok(self.finish(&state));
            }
        };
        let mut state = ctl.start(state)?;
        self.renderer.show_status(
            &format!(
                "{}: look at the camera ({})",
                state.subject().unwrap_or_default(),
                source.describe()
            ),
            Severity::Info,
        );

        loop {
            if stop.load(Ordering::Relaxed) {
                state = ctl.stop(state);
                break;
            }
            state = self.step(state, &mut stream);
            if state.phase().is_terminal() {
                break;
            }
            if !self.frame_interval.is_zero() {
                std::thread::sleep(self.frame_interval);
            }
        }

        drop(stream);
        Ok(self.finish(&state))
    }

    /// One produce-detect-decide-render iteration.
    fn step<T: FrameStream>(&mut self, state: SessionState, stream: &mut T) -> SessionState {
        let ctl = self.controller;
        let frame = match stream.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return ctl.abort(
                    state,
                    StopReason::SourceFailed("frame source stopped producing frames".into()),
                )
            }
            Err(e) => return ctl.abort(state, StopReason::SourceFailed(e.to_string())),
        };

        // Dark frames cannot contain a usable face; skip inference.
        let faces = if frame.is_dark {
            Vec::new()
        } else {
            match self.detector.detect(&frame) {
                Ok(faces) => faces,
                Err(e) => return ctl.abort(state, StopReason::DetectorFailed(e.to_string())),
            }
        };
        tracing::debug!(
            seq = frame.sequence,
            dark = frame.is_dark,
            faces = faces.len(),
            "frame"
        );

        let state = ctl.on_frame(state, faces.len());
        self.renderer.show_frame(&annotate(&frame, &faces));
        state
    }

    fn finish(&mut self, state: &SessionState) -> SessionReport {
        let report = SessionReport::from_state(state);
        self.renderer
            .show_status(&report.message(), report.severity());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::detector::DetectorError;
    use crate::render::OVERLAY_LUMA;
    use crate::store::AttendanceStore;
    use crate::types::BoundingBox;
    use chrono::NaiveDate;
    use facemark_hw::{Frame, SourceError};
    use image::{GrayImage, Luma};
    use std::sync::Arc;

    const FACE: u8 = 200;
    const EMPTY: u8 = 100;
    const DARK: u8 = 0;

    /// Frames scripted by luma; flags record open/release and can raise stop.
    struct ScriptedSource {
        frames: Vec<u8>,
        fail_open: bool,
        fail_at: Option<usize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        opened: Arc<AtomicBool>,
        released: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<u8>) -> Self {
            Self {
                frames,
                fail_open: false,
                fail_at: None,
                stop_after: None,
                opened: Arc::new(AtomicBool::new(false)),
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct ScriptedStream {
        frames: std::vec::IntoIter<u8>,
        served: usize,
        fail_at: Option<usize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        type Stream = ScriptedStream;

        fn open(&mut self) -> Result<ScriptedStream, SourceError> {
            if self.fail_open {
                return Err(SourceError::Empty("scripted".into()));
            }
            self.opened.store(true, Ordering::SeqCst);
            Ok(ScriptedStream {
                frames: self.frames.clone().into_iter(),
                served: 0,
                fail_at: self.fail_at,
                stop_after: self.stop_after.clone(),
                released: self.released.clone(),
            })
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    impl FrameStream for ScriptedStream {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.fail_at == Some(self.served) {
                return Err(SourceError::Empty("scripted failure".into()));
            }
            let Some(luma) = self.frames.next() else {
                return Ok(None);
            };
            self.served += 1;
            if let Some((after, flag)) = &self.stop_after {
                if self.served >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            let img = GrayImage::from_pixel(16, 16, Luma([luma]));
            Ok(Some(Frame::from_gray_image(img, self.served as u32)))
        }
    }

    impl Drop for ScriptedStream {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Sees a face wherever the frame is bright.
    #[derive(Default)]
    struct BrightnessDetector {
        calls: usize,
        fail: bool,
    }

    impl FaceDetector for BrightnessDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls += 1;
            if self.fail {
                return Err(DetectorError::InferenceFailed("scripted".into()));
            }
            if frame.data[0] < FACE {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox {
                x: 2.0,
                y: 2.0,
                width: 8.0,
                height: 8.0,
                confidence: 0.9,
            }])
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        frames: Vec<Frame>,
        statuses: Vec<(String, Severity)>,
    }

    impl Renderer for RecordingRenderer {
        fn show_frame(&mut self, frame: &Frame) {
            self.frames.push(frame.clone());
        }

        fn show_status(&mut self, message: &str, severity: Severity) {
            self.statuses.push((message.to_string(), severity));
        }
    }

    fn controller(dir: &tempfile::TempDir) -> SessionController<FixedClock> {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        SessionController::with_clock(
            AttendanceStore::new(dir.path().join("attendance.csv")),
            10,
            FixedClock(at),
        )
    }

    fn runner(
        ctl: &SessionController<FixedClock>,
    ) -> SessionRunner<'_, FixedClock, BrightnessDetector, RecordingRenderer> {
        SessionRunner::new(ctl, BrightnessDetector::default(), RecordingRenderer::default())
            .with_frame_interval(Duration::ZERO)
    }

    fn no_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_marks_after_sustained_presence() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 15]);

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert_eq!(report.phase, Phase::Finalized(AppendOutcome::Appended));
        assert_eq!(report.message(), "marked successfully");
        assert_eq!(report.severity(), Severity::Success);
        assert!(report.is_success());
        assert_eq!(report.frames, 10);
        assert_eq!(report.record.as_ref().unwrap().name, "Alice");
        assert!(source.released.load(Ordering::SeqCst));

        // every processed frame was rendered with its overlay
        let rendered = &runner.renderer().frames;
        assert_eq!(rendered.len(), 10);
        assert_eq!(rendered[0].data[2 * 16 + 2], OVERLAY_LUMA);
        assert_eq!(rendered[0].data[5 * 16 + 5], FACE);

        let (last, severity) = runner.renderer().statuses.last().unwrap();
        assert_eq!(last, "marked successfully");
        assert_eq!(*severity, Severity::Success);
    }

    #[test]
    fn test_second_session_already_marked() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);

        runner
            .run("Alice", &mut ScriptedSource::new(vec![FACE; 10]), &no_stop())
            .unwrap();
        let report = runner
            .run("Alice", &mut ScriptedSource::new(vec![FACE; 10]), &no_stop())
            .unwrap();

        assert_eq!(report.phase, Phase::Finalized(AppendOutcome::AlreadyPresent));
        assert_eq!(report.message(), "already marked today");
        assert!(report.is_success());
        assert_eq!(ctl.store().query_all().unwrap().len(), 1);
    }

    #[test]
    fn test_blank_name_never_opens_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 10]);

        let err = runner.run("   ", &mut source, &no_stop()).unwrap_err();

        assert_eq!(err, SessionError::EmptyName);
        assert!(!source.opened.load(Ordering::SeqCst));
        assert_eq!(
            runner.renderer().statuses,
            vec![("please enter your name".to_string(), Severity::Warning)]
        );
        assert!(!ctl.store().path().exists());
    }

    #[test]
    fn test_unavailable_source_stops() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 10]);
        source.fail_open = true;

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert!(matches!(
            report.phase,
            Phase::Stopped(StopReason::SourceUnavailable(_))
        ));
        assert!(report.message().starts_with("error: camera unavailable"));
        assert_eq!(report.frames, 0);
        assert!(runner.renderer().frames.is_empty());
    }

    #[test]
    fn test_source_running_dry_is_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 5]);

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert!(matches!(report.phase, Phase::Stopped(StopReason::SourceFailed(_))));
        assert_eq!(report.severity(), Severity::Error);
        assert!(!report.is_success());
        assert_eq!(report.frames, 5);
        assert!(source.released.load(Ordering::SeqCst));
        assert!(ctl.store().query_all().unwrap().is_empty());
    }

    #[test]
    fn test_source_error_mid_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 10]);
        source.fail_at = Some(3);

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert_eq!(report.frames, 3);
        assert!(report.message().contains("scripted failure"));
        assert!(source.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_signal_releases_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let stop = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(vec![FACE; 20]);
        source.stop_after = Some((4, stop.clone()));

        let report = runner.run("Alice", &mut source, &stop).unwrap();

        assert_eq!(report.phase, Phase::Stopped(StopReason::Cancelled));
        assert_eq!(report.frames, 4);
        assert_eq!(report.severity(), Severity::Warning);
        assert!(source.released.load(Ordering::SeqCst));
        assert!(ctl.store().query_all().unwrap().is_empty());
    }

    #[test]
    fn test_stop_already_raised() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);
        let mut source = ScriptedSource::new(vec![FACE; 20]);

        let report = runner
            .run("Alice", &mut source, &AtomicBool::new(true))
            .unwrap();

        assert_eq!(report.phase, Phase::Stopped(StopReason::Cancelled));
        assert_eq!(report.frames, 0);
        assert!(source.opened.load(Ordering::SeqCst));
        assert!(source.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missed_frames_and_dark_frames_reset_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = runner(&ctl);

        let mut frames = vec![FACE; 9];
        frames.push(EMPTY);
        frames.extend([FACE; 9]);
        frames.push(DARK);
        frames.extend([FACE; 10]);
        frames.extend([FACE; 5]);
        let mut source = ScriptedSource::new(frames);

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert_eq!(report.phase, Phase::Finalized(AppendOutcome::Appended));
        assert_eq!(report.frames, 30);
        // the dark frame never reached the detector
        assert_eq!(runner.detector.calls, 29);
    }

    #[test]
    fn test_detector_failure_stops() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(&dir);
        let mut runner = SessionRunner::new(
            &ctl,
            BrightnessDetector {
                calls: 0,
                fail: true,
            },
            RecordingRenderer::default(),
        )
        .with_frame_interval(Duration::ZERO);
        let mut source = ScriptedSource::new(vec![FACE; 10]);

        let report = runner.run("Alice", &mut source, &no_stop()).unwrap();

        assert!(matches!(report.phase, Phase::Stopped(StopReason::DetectorFailed(_))));
        assert!(report.message().starts_with("error: face detection failed"));
        assert!(source.released.load(Ordering::SeqCst));
    }
}
