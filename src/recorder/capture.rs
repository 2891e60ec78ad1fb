//! Capture pipeline: grab the primary display, persist numbered still frames,
//! and enforce the frame-count policy
//!
//! The pipeline runs on one dedicated thread per session. Each tick produces at
//! most one frame; a failed grab costs that frame and nothing else.

use image::{DynamicImage, ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::protocol::Response;
use crate::transport::ResponseSink;

use super::SessionEvent;

pub const FRAME_PREFIX: &str = "screenshot_";
pub const FRAME_EXTENSION: &str = "jpg";
const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no primary display found")]
    NoPrimaryDisplay,

    #[error("screen grab failed: {0}")]
    Grab(String),

    #[error("failed to write frame {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to move frame into place at {path:?}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of full-resolution screen images
pub trait ScreenGrabber: Send + Sync {
    fn grab(&self) -> Result<RgbaImage, CaptureError>;
}

/// Grabs the primary monitor through xcap
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryDisplayGrabber;

impl ScreenGrabber for PrimaryDisplayGrabber {
    fn grab(&self) -> Result<RgbaImage, CaptureError> {
        let monitors = xcap::Monitor::all().map_err(|e| CaptureError::Grab(e.to_string()))?;

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .or_else(|| monitors.first())
            .ok_or(CaptureError::NoPrimaryDisplay)?;

        monitor
            .capture_image()
            .map_err(|e| CaptureError::Grab(e.to_string()))
    }
}

/// File name of frame `index`
pub fn frame_file_name(index: u64) -> String {
    format!("{FRAME_PREFIX}{index}.{FRAME_EXTENSION}")
}

/// Index encoded in a frame file name, if the name matches the frame pattern
pub fn parse_frame_index(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(FRAME_PREFIX)?
        .strip_suffix(FRAME_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The on-disk frame sequence of one session.
///
/// Writing a frame and advancing the index happen under one lock, so indices
/// stay gap-free no matter which thread persists.
#[derive(Debug)]
pub struct FrameStore {
    directory: PathBuf,
    next_index: Mutex<u64>,
}

impl FrameStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            next_index: Mutex::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of frames persisted so far
    pub fn frame_count(&self) -> u64 {
        *self.next_index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `frame` under the next index and return the new frame count.
    ///
    /// The JPEG is written beside its final name and renamed into place, so a
    /// failure never leaves a half-written `screenshot_<i>.jpg` behind.
    pub fn persist(&self, frame: RgbaImage) -> Result<u64, CaptureError> {
        let mut next_index = self.next_index.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.directory.join(frame_file_name(*next_index));
        let partial = self
            .directory
            .join(format!("{}{}", frame_file_name(*next_index), PARTIAL_SUFFIX));

        // JPEG has no alpha channel
        let rgb = DynamicImage::ImageRgba8(frame).into_rgb8();
        if let Err(source) = rgb.save_with_format(&partial, ImageFormat::Jpeg) {
            let _ = std::fs::remove_file(&partial);
            return Err(CaptureError::Write { path, source });
        }
        if let Err(source) = std::fs::rename(&partial, &path) {
            let _ = std::fs::remove_file(&partial);
            return Err(CaptureError::Rename { path, source });
        }

        *next_index += 1;
        Ok(*next_index)
    }
}

/// Soft/hard frame-count thresholds with one-shot reporting
#[derive(Debug, Clone)]
pub struct FramePolicy {
    soft_limit: u64,
    hard_limit: u64,
    soft_reported: bool,
    hard_reported: bool,
}

/// Thresholds newly crossed by one check
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LimitCheck {
    pub soft_crossed: bool,
    pub hard_crossed: bool,
}

impl FramePolicy {
    pub fn new(soft_limit: u64, hard_limit: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
            soft_reported: false,
            hard_reported: false,
        }
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    /// Each threshold is reported the first time `frame_count` exceeds it and never again
    pub fn check(&mut self, frame_count: u64) -> LimitCheck {
        let mut check = LimitCheck::default();

        if frame_count > self.soft_limit && !self.soft_reported {
            self.soft_reported = true;
            check.soft_crossed = true;
        }
        if frame_count > self.hard_limit && !self.hard_reported {
            self.hard_reported = true;
            check.hard_crossed = true;
        }

        check
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was persisted; carries the new frame count
    Captured(u64),
    /// The grab or the write failed; no frame was added
    Failed,
    /// The hard limit was crossed; the loop must not tick again
    HardLimitReached,
}

/// Totals reported when the capture thread exits
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub failures: u64,
}

pub struct CapturePipeline {
    grabber: Arc<dyn ScreenGrabber>,
    frames: Arc<FrameStore>,
    policy: FramePolicy,
    interval: Duration,
    responses: Arc<dyn ResponseSink>,
    events: mpsc::Sender<SessionEvent>,
    failures: u64,
}

impl CapturePipeline {
    pub fn new(
        grabber: Arc<dyn ScreenGrabber>,
        frames: Arc<FrameStore>,
        policy: FramePolicy,
        interval: Duration,
        responses: Arc<dyn ResponseSink>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            grabber,
            frames,
            policy,
            interval,
            responses,
            events,
            failures: 0,
        }
    }

    /// Capture, persist and check limits once
    pub fn tick(&mut self) -> TickOutcome {
        let persisted = self
            .grabber
            .grab()
            .and_then(|frame| self.frames.persist(frame));

        let frame_count = match persisted {
            Ok(count) => count,
            Err(e) => {
                self.failures += 1;
                warn!("Frame capture failed: {}", e);
                self.responses.respond(Response::status(format!(
                    "An error occured while capturing the screen: {}",
                    e
                )));
                return TickOutcome::Failed;
            }
        };

        let check = self.policy.check(frame_count);
        if check.soft_crossed {
            self.responses.respond(Response::status(format!(
                "Number of frames exceeds {}. After {} recording will be stopped.",
                self.policy.soft_limit(),
                self.policy.hard_limit()
            )));
        }
        if check.hard_crossed {
            warn!("Hard frame limit {} exceeded", self.policy.hard_limit());
            self.responses.respond(Response::status(format!(
                "Number of frames exceeds {}. Pausing the recorder...",
                self.policy.hard_limit()
            )));
            self.responses.respond(Response::EmergencyStop);
            let _ = self.events.send(SessionEvent::HardLimitReached);
            return TickOutcome::HardLimitReached;
        }

        TickOutcome::Captured(frame_count)
    }

    /// Tick until cancelled or the hard limit is reached.
    ///
    /// Cancellation is checked before every tick and interrupts the inter-tick
    /// sleep, so no capture starts after it has been observed.
    pub fn run(mut self, cancel: CancelToken) -> CaptureSummary {
        info!(
            "Capture loop started (interval {:?}, directory {:?})",
            self.interval,
            self.frames.directory()
        );

        while !cancel.is_cancelled() {
            match self.tick() {
                TickOutcome::HardLimitReached => break,
                TickOutcome::Captured(count) => debug!("Captured frame {}", count),
                TickOutcome::Failed => {}
            }

            if cancel.wait_timeout(self.interval) {
                break;
            }
        }

        let summary = CaptureSummary {
            frames: self.frames.frame_count(),
            failures: self.failures,
        };
        info!(
            "Capture loop exited after {} frames ({} failed ticks)",
            summary.frames, summary.failures
        );
        summary
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::Response;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Responses captured in memory
    #[derive(Default)]
    pub(crate) struct CollectedResponses(pub Mutex<Vec<Response>>);

    impl CollectedResponses {
        pub(crate) fn snapshot(&self) -> Vec<Response> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ResponseSink for CollectedResponses {
        fn respond(&self, response: Response) {
            self.0.lock().unwrap().push(response);
        }
    }

    /// Solid-color frames; grabs listed in `fail_on` (1-based) fail
    pub(crate) struct FakeGrabber {
        pub grabs: AtomicU64,
        pub fail_on: Vec<u64>,
    }

    impl FakeGrabber {
        pub(crate) fn new() -> Self {
            Self {
                grabs: AtomicU64::new(0),
                fail_on: Vec::new(),
            }
        }
    }

    impl ScreenGrabber for FakeGrabber {
        fn grab(&self) -> Result<RgbaImage, CaptureError> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(CaptureError::Grab(format!("simulated failure on grab {}", n)));
            }
            Ok(RgbaImage::from_pixel(8, 6, image::Rgba([n as u8, 40, 200, 255])))
        }
    }

    fn pipeline(
        grabber: FakeGrabber,
        dir: &Path,
        policy: FramePolicy,
    ) -> (CapturePipeline, Arc<CollectedResponses>, mpsc::Receiver<SessionEvent>) {
        let responses = Arc::new(CollectedResponses::default());
        let (tx, rx) = mpsc::channel();
        let pipeline = CapturePipeline::new(
            Arc::new(grabber),
            Arc::new(FrameStore::new(dir)),
            policy,
            Duration::ZERO,
            responses.clone(),
            tx,
        );
        (pipeline, responses, rx)
    }

    fn status_count(responses: &[Response], needle: &str) -> usize {
        responses
            .iter()
            .filter(|r| matches!(r, Response::Status(s) if s.contains(needle)))
            .count()
    }

    #[test]
    fn test_frame_names() {
        assert_eq!(frame_file_name(12), "screenshot_12.jpg");
        assert_eq!(parse_frame_index("screenshot_12.jpg"), Some(12));
        assert_eq!(parse_frame_index("screenshot_.jpg"), None);
        assert_eq!(parse_frame_index("screenshot_1.jpg.part"), None);
        assert_eq!(parse_frame_index("screenshot_-1.jpg"), None);
        assert_eq!(parse_frame_index("output_video.mp4"), None);
    }

    #[test]
    fn test_frame_count_equals_successful_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, _, _) = pipeline(FakeGrabber::new(), dir.path(), FramePolicy::new(100, 200));

        for expected in 1..=5 {
            assert_eq!(pipeline.tick(), TickOutcome::Captured(expected));
        }
        assert_eq!(pipeline.frames.frame_count(), 5);
        for i in 0..5 {
            assert!(dir.path().join(frame_file_name(i)).is_file());
        }
    }

    #[test]
    fn test_failed_grab_costs_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut grabber = FakeGrabber::new();
        grabber.fail_on = vec![3];
        let (mut pipeline, responses, _) = pipeline(grabber, dir.path(), FramePolicy::new(100, 200));

        let outcomes: Vec<TickOutcome> = (0..6).map(|_| pipeline.tick()).collect();

        assert_eq!(outcomes.iter().filter(|o| **o == TickOutcome::Failed).count(), 1);
        assert_eq!(pipeline.frames.frame_count(), 5);
        // Indices stay gap-free across the failure
        for i in 0..5 {
            assert!(dir.path().join(frame_file_name(i)).is_file());
        }
        assert_eq!(
            status_count(&responses.snapshot(), "An error occured while capturing the screen"),
            1
        );
    }

    #[test]
    fn test_soft_warning_emitted_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, responses, _) = pipeline(FakeGrabber::new(), dir.path(), FramePolicy::new(2, 100));

        for _ in 0..20 {
            pipeline.tick();
        }

        let responses = responses.snapshot();
        assert_eq!(
            status_count(&responses, "Number of frames exceeds 2. After 100 recording will be stopped."),
            1
        );
        assert!(!responses.contains(&Response::EmergencyStop));
    }

    #[test]
    fn test_hard_limit_signals_emergency_once_and_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, responses, events) = pipeline(FakeGrabber::new(), dir.path(), FramePolicy::new(1, 3));

        let summary = pipeline.run(CancelToken::new());

        // Frame 4 crosses the limit of 3 and is the last one captured
        assert_eq!(summary.frames, 4);
        let responses = responses.snapshot();
        assert_eq!(responses.iter().filter(|r| **r == Response::EmergencyStop).count(), 1);
        assert_eq!(status_count(&responses, "Pausing the recorder"), 1);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::HardLimitReached)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_cancelled_pipeline_never_captures() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _, _) = pipeline(FakeGrabber::new(), dir.path(), FramePolicy::new(10, 20));
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = pipeline.run(cancel);
        assert_eq!(summary, CaptureSummary::default());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_failure_leaves_no_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let store = FrameStore::new(&missing);

        let frame = RgbaImage::from_pixel(4, 4, image::Rgba([0, 0, 0, 255]));
        assert!(matches!(store.persist(frame), Err(CaptureError::Write { .. })));
        assert_eq!(store.frame_count(), 0);
    }
}
