//! Recorder-side session state machine
//!
//! All lifecycle decisions happen on the thread that owns [`RecorderSession`].
//! Commands, the capture thread's hard-limit signal and the peer monitor all
//! arrive as [`SessionEvent`]s on one queue, so "who stops first" is decided by
//! the state field alone.

use chrono::{DateTime, Local};
use std::fmt;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::liveness::{spawn_peer_monitor, PeerEvent};
use crate::notice::Notifier;
use crate::protocol::{Command, Response, StartParams};
use crate::transport::ResponseSink;

use super::capture::{CapturePipeline, CaptureSummary, FramePolicy, FrameStore, ScreenGrabber};
use super::finalize::{FinalizeError, Finalizer};
use super::{RecorderSettings, SessionEvent};

const PEER_LOST_NOTICE: &str = "Screen recorder has lost a connection with the controller. \
    The recording will be stopped. You may see messages with many errors. \
    Do not kill the screen recorder process, it should finish its work despite the errors.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Recording,
    Stopping,
    Finalizing,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Finalizing => "finalizing",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What pushed the session out of `Recording`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    HardLimit,
    PeerLost,
}

/// Threads and shared state of a running capture
struct ActiveCapture {
    cancel: CancelToken,
    capture: JoinHandle<CaptureSummary>,
    monitor: Option<JoinHandle<()>>,
    frames: Arc<FrameStore>,
    started_at: DateTime<Local>,
}

pub struct RecorderSession {
    id: Uuid,
    state: SessionState,
    params: StartParams,
    peer_pid: Option<u32>,
    settings: RecorderSettings,
    grabber: Arc<dyn ScreenGrabber>,
    finalizer: Finalizer,
    responses: Arc<dyn ResponseSink>,
    notifier: Arc<dyn Notifier>,
    events: mpsc::Sender<SessionEvent>,
    active: Option<ActiveCapture>,
}

impl RecorderSession {
    pub fn new(
        settings: RecorderSettings,
        grabber: Arc<dyn ScreenGrabber>,
        finalizer: Finalizer,
        responses: Arc<dyn ResponseSink>,
        notifier: Arc<dyn Notifier>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            params: StartParams::default(),
            peer_pid: None,
            settings,
            grabber,
            finalizer,
            responses,
            notifier,
            events,
            active: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process events until the session terminates or every sender is gone
    pub fn run(&mut self, events: mpsc::Receiver<SessionEvent>) -> SessionState {
        let span = tracing::info_span!("session", id = %self.id);
        let _enter = span.enter();
        info!("Recorder session ready");

        while self.state != SessionState::Terminated {
            let Ok(event) = events.recv() else {
                warn!("Event queue closed while {}", self.state);
                break;
            };
            self.handle(event);
        }

        self.state
    }

    /// Apply one event and return the resulting state
    pub fn handle(&mut self, event: SessionEvent) -> SessionState {
        debug!("Event {:?} while {}", event, self.state);

        match event {
            SessionEvent::Command(Command::SetPeerId(pid)) => {
                info!("Peer process id set to {}", pid);
                self.peer_pid = Some(pid);
            }
            SessionEvent::Command(Command::Start(params)) => {
                if self.state == SessionState::Idle {
                    self.start(params);
                } else {
                    warn!("Start received while {}", self.state);
                    self.responses.respond(Response::status(format!(
                        "Protocol violation: start received while the recorder is {}. \
                         The current recording continues.",
                        self.state
                    )));
                }
            }
            SessionEvent::Command(Command::Stop) => match self.state {
                SessionState::Recording => self.stop(StopReason::Requested),
                SessionState::Idle => {
                    self.responses
                        .respond(Response::status("The recorder is not recording. Nothing to stop."));
                }
                other => debug!("Stop ignored while {}", other),
            },
            SessionEvent::Malformed(e) => {
                warn!("Rejected command: {}", e);
                self.responses
                    .respond(Response::status(format!("Command ignored: {}", e)));
            }
            SessionEvent::HardLimitReached => {
                if self.state == SessionState::Recording {
                    self.stop(StopReason::HardLimit);
                }
            }
            SessionEvent::Peer(PeerEvent::NotFound(pid)) => {
                self.responses.respond(Response::status(format!(
                    "Error monitoring controller process: process {} is not running",
                    pid
                )));
            }
            SessionEvent::Peer(PeerEvent::Exited(pid)) => {
                if self.state == SessionState::Recording {
                    warn!("Controller process {} exited during recording", pid);
                    self.notifier.blocking_notice(PEER_LOST_NOTICE);
                    self.responses.detach();
                    self.stop(StopReason::PeerLost);
                }
            }
        }

        self.state
    }

    fn transition(&mut self, next: SessionState) {
        info!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    fn start(&mut self, params: StartParams) {
        self.responses
            .respond(Response::status("Turning on the recorder..."));
        self.transition(SessionState::Starting);
        info!(
            "Starting capture: frame limit {}, frame rate {}, directory {:?}",
            params.frame_limit, params.frame_rate, params.directory_path
        );

        if let Err(e) = prepare_directory(&params.directory_path) {
            error!("Failed to prepare {:?}: {}", params.directory_path, e);
            self.responses.respond(Response::status(format!(
                "An error occured while preparing the directory {}: {}",
                params.directory_path.display(),
                e
            )));
            self.transition(SessionState::Idle);
            return;
        }

        let frames = Arc::new(FrameStore::new(&params.directory_path));
        let pipeline = CapturePipeline::new(
            self.grabber.clone(),
            frames.clone(),
            FramePolicy::new(self.settings.soft_frame_limit, params.frame_limit),
            self.settings.capture_interval(params.frame_rate),
            self.responses.clone(),
            self.events.clone(),
        );

        let cancel = CancelToken::new();
        let capture_cancel = cancel.clone();
        let span = tracing::Span::current();
        let capture = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let _enter = span.enter();
                pipeline.run(capture_cancel)
            });
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn capture thread: {}", e);
                self.responses.respond(Response::status(format!(
                    "An error occured while starting the capture: {}",
                    e
                )));
                self.transition(SessionState::Idle);
                return;
            }
        };

        let monitor = self.peer_pid.and_then(|pid| {
            match spawn_peer_monitor(
                pid,
                self.settings.peer_poll_interval,
                cancel.clone(),
                self.events.clone(),
                SessionEvent::Peer,
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    self.responses.respond(Response::status(format!(
                        "Error monitoring controller process: {}",
                        e
                    )));
                    None
                }
            }
        });
        if self.peer_pid.is_none() {
            warn!("No peer process id received; controller liveness is not monitored");
        }

        self.active = Some(ActiveCapture {
            cancel,
            capture,
            monitor,
            frames,
            started_at: Local::now(),
        });
        self.params = params;
        self.responses.respond(Response::status("Recording..."));
        self.transition(SessionState::Recording);
    }

    fn stop(&mut self, reason: StopReason) {
        info!("Stopping ({:?})", reason);
        self.transition(SessionState::Stopping);
        self.responses
            .respond(Response::status("Turning off the recorder..."));

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let summary = active.capture.join().unwrap_or_else(|_| {
                error!("Capture thread panicked");
                CaptureSummary {
                    frames: active.frames.frame_count(),
                    failures: 0,
                }
            });
            if let Some(monitor) = active.monitor {
                if monitor.join().is_err() {
                    error!("Peer monitor thread panicked");
                }
            }

            let elapsed = Local::now().signed_duration_since(active.started_at);
            info!(
                "Recorded {} frames ({} failed ticks) between {} and now ({}s)",
                summary.frames,
                summary.failures,
                active.started_at.format("%Y-%m-%d %H:%M:%S"),
                elapsed.num_seconds()
            );
        }

        self.transition(SessionState::Finalizing);
        self.responses.respond(Response::status(
            "Recorder is off. Creating the video... It may take some time.",
        ));
        self.finalize();

        self.responses.respond(Response::End);
        self.transition(SessionState::Terminated);
    }

    fn finalize(&self) {
        let directory = self.params.directory_path.as_path();

        let video = match self.finalizer.encode(directory, self.params.frame_rate) {
            Ok(video) => video,
            Err(FinalizeError::NoFrames(_)) => {
                warn!("No frames in {:?}", directory);
                self.responses
                    .respond(Response::status("ERROR: No frames to merge."));
                return;
            }
            Err(e) => {
                error!("Video encoding failed, keeping frames: {}", e);
                self.responses.respond(Response::status(format!(
                    "An error occured while creating the video: {}",
                    e
                )));
                return;
            }
        };

        self.responses
            .respond(Response::status("Cleaning temporary files."));
        match Finalizer::remove_frames(directory) {
            Ok(removed) => debug!("Removed {} frames", removed),
            Err(e) => self.responses.respond(Response::status(format!(
                "An error occurred while deleting JPEG files: {}",
                e
            ))),
        }

        info!(
            "Video {:?}: {} frames at {}x{}",
            video.path, video.frames, video.width, video.height
        );
        self.responses.respond(Response::status(format!(
            "Video created and saved as {}.",
            video.path.display()
        )));
    }
}

/// Create `directory` and delete every file already in it
fn prepare_directory(directory: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(directory)?;
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notice::CollectingNotifier;
    use crate::recorder::capture::tests::{CollectedResponses, FakeGrabber};
    use crate::recorder::finalize::tests::RecordingEncoder;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    struct Harness {
        session: RecorderSession,
        events: mpsc::Receiver<SessionEvent>,
        responses: Arc<CollectedResponses>,
        notifier: Arc<CollectingNotifier>,
        grabber: Arc<FakeGrabber>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(grabber: FakeGrabber, encoder: RecordingEncoder) -> Self {
            let responses = Arc::new(CollectedResponses::default());
            let notifier = Arc::new(CollectingNotifier::default());
            let grabber = Arc::new(grabber);
            let (tx, rx) = mpsc::channel();
            let settings = RecorderSettings {
                soft_frame_limit: 50_000,
                capture_interval: Some(Duration::from_millis(5)),
                peer_poll_interval: Duration::from_millis(20),
            };
            let session = RecorderSession::new(
                settings,
                grabber.clone(),
                Finalizer::new(Arc::new(encoder), "output_video.mp4"),
                responses.clone(),
                notifier.clone(),
                tx,
            );
            Self {
                session,
                events: rx,
                responses,
                notifier,
                grabber,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn output_dir(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn start(&mut self, frame_limit: u64) -> SessionState {
            let params = StartParams {
                frame_limit,
                frame_rate: 14,
                directory_path: self.output_dir(),
            };
            self.session.handle(SessionEvent::Command(Command::Start(params)))
        }

        fn next_event(&self) -> SessionEvent {
            self.events.recv_timeout(Duration::from_secs(5)).unwrap()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn has_status(responses: &[Response], needle: &str) -> bool {
        responses
            .iter()
            .any(|r| matches!(r, Response::Status(s) if s.contains(needle)))
    }

    #[test]
    fn test_explicit_stop_finalizes_and_ends_once() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        std::fs::create_dir_all(h.output_dir()).unwrap();
        std::fs::write(h.output_dir().join("stale.txt"), b"old").unwrap();

        assert_eq!(h.start(60_000), SessionState::Recording);
        assert!(!h.output_dir().join("stale.txt").exists());
        let grabber = h.grabber.clone();
        wait_until(|| grabber.grabs.load(Ordering::SeqCst) >= 3);

        assert_eq!(
            h.session.handle(SessionEvent::Command(Command::Stop)),
            SessionState::Terminated
        );
        let grabs_at_stop = h.grabber.grabs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(h.grabber.grabs.load(Ordering::SeqCst), grabs_at_stop);

        let responses = h.responses.snapshot();
        assert_eq!(responses.first(), Some(&Response::status("Turning on the recorder...")));
        assert_eq!(responses.last(), Some(&Response::End));
        assert_eq!(responses.iter().filter(|r| **r == Response::End).count(), 1);
        assert!(has_status(&responses, "Recording..."));
        assert!(has_status(&responses, "Cleaning temporary files."));
        assert!(has_status(&responses, "output_video.mp4"));

        assert!(h.output_dir().join("output_video.mp4").is_file());
        assert!(Finalizer::collect_frames(&h.output_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_hard_limit_stops_session() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        h.start(3);

        let event = h.next_event();
        assert!(matches!(event, SessionEvent::HardLimitReached));
        assert_eq!(h.session.handle(event), SessionState::Terminated);

        let responses = h.responses.snapshot();
        assert_eq!(responses.iter().filter(|r| **r == Response::EmergencyStop).count(), 1);
        assert_eq!(responses.iter().filter(|r| **r == Response::End).count(), 1);
        // The capture loop ends itself on the frame that crossed the limit
        assert_eq!(h.grabber.grabs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_start_while_recording_is_rejected() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        h.start(60_000);
        assert_eq!(h.start(60_000), SessionState::Recording);
        assert!(has_status(&h.responses.snapshot(), "Protocol violation"));

        h.session.handle(SessionEvent::Command(Command::Stop));
        let starts = h
            .responses
            .snapshot()
            .iter()
            .filter(|r| **r == Response::status("Recording..."))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_stop_while_idle_keeps_session_idle() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        assert_eq!(
            h.session.handle(SessionEvent::Command(Command::Stop)),
            SessionState::Idle
        );
        let responses = h.responses.snapshot();
        assert_eq!(responses.len(), 1);
        assert!(!responses.contains(&Response::End));
    }

    #[test]
    fn test_no_frames_reports_error_and_creates_no_video() {
        let mut grabber = FakeGrabber::new();
        grabber.fail_on = (1..=10_000).collect();
        let mut h = Harness::new(grabber, RecordingEncoder::default());
        h.start(60_000);
        let grabber = h.grabber.clone();
        wait_until(|| grabber.grabs.load(Ordering::SeqCst) >= 2);

        h.session.handle(SessionEvent::Command(Command::Stop));

        let responses = h.responses.snapshot();
        assert!(has_status(&responses, "ERROR: No frames to merge."));
        assert!(has_status(&responses, "An error occured while capturing the screen"));
        assert_eq!(responses.last(), Some(&Response::End));
        assert!(!h.output_dir().join("output_video.mp4").exists());
    }

    #[test]
    fn test_encoder_failure_keeps_frames() {
        let encoder = RecordingEncoder {
            fail_on_append: Some(1),
            ..RecordingEncoder::default()
        };
        let mut h = Harness::new(FakeGrabber::new(), encoder);
        h.start(60_000);
        let grabber = h.grabber.clone();
        wait_until(|| grabber.grabs.load(Ordering::SeqCst) >= 2);

        h.session.handle(SessionEvent::Command(Command::Stop));

        let responses = h.responses.snapshot();
        assert!(has_status(&responses, "An error occured while creating the video"));
        assert!(!has_status(&responses, "Cleaning temporary files."));
        assert_eq!(responses.last(), Some(&Response::End));
        assert!(!Finalizer::collect_frames(&h.output_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_command_is_reported() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        let err = Command::parse("@PAUSE@").unwrap_err();
        assert_eq!(h.session.handle(SessionEvent::Malformed(err)), SessionState::Idle);
        assert!(has_status(&h.responses.snapshot(), "Command ignored"));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_peer_is_reported_without_stopping() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        h.session.handle(SessionEvent::Command(Command::SetPeerId(pid)));
        h.start(60_000);

        let event = h.next_event();
        assert!(matches!(event, SessionEvent::Peer(PeerEvent::NotFound(p)) if p == pid));
        assert_eq!(h.session.handle(event), SessionState::Recording);
        assert!(has_status(&h.responses.snapshot(), "Error monitoring controller process"));

        h.session.handle(SessionEvent::Command(Command::Stop));
    }

    #[cfg(unix)]
    #[test]
    fn test_peer_exit_forces_stop_with_blocking_notice() {
        let mut h = Harness::new(FakeGrabber::new(), RecordingEncoder::default());
        let mut child = std::process::Command::new("sleep").arg("0.3").spawn().unwrap();
        h.session.handle(SessionEvent::Command(Command::SetPeerId(child.id())));
        h.start(60_000);

        // Reap the child so its pid disappears once it exits
        let reaper = std::thread::spawn(move || child.wait());

        let event = h.next_event();
        assert!(matches!(event, SessionEvent::Peer(PeerEvent::Exited(_))));
        reaper.join().unwrap().unwrap();

        assert_eq!(h.session.handle(event), SessionState::Terminated);
        assert_eq!(h.notifier.blocking_notices(), vec![PEER_LOST_NOTICE.to_string()]);
        assert_eq!(h.responses.snapshot().last(), Some(&Response::End));
    }
}
