//! Recorder process: serves the command pipe, runs the capture session and
//! reports back over the response pipe

pub mod capture;
pub mod finalize;
pub mod session;

use anyhow::{Context, Result};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::liveness::PeerEvent;
use crate::notice::{LogNotifier, Notifier};
use crate::protocol::{Command, ProtocolError};
use crate::transport::{CommandServer, ResponseChannel, TransportError};

use capture::{PrimaryDisplayGrabber, ScreenGrabber};
use finalize::{FfmpegEncoder, Finalizer, VideoEncoder};
use session::{RecorderSession, SessionState};

/// Everything the session control loop reacts to
#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    /// A command line that failed to parse
    Malformed(ProtocolError),
    /// The capture loop crossed the hard frame limit and stopped itself
    HardLimitReached,
    Peer(PeerEvent),
}

/// Recorder tunables that are not part of the start command
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub soft_frame_limit: u64,
    /// Fixed pause between captures; derived from the frame rate when `None`
    pub capture_interval: Option<Duration>,
    pub peer_poll_interval: Duration,
}

impl RecorderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            soft_frame_limit: config.recorder.soft_frame_limit,
            capture_interval: config.recorder.capture_interval_ms.map(Duration::from_millis),
            peer_poll_interval: Duration::from_millis(config.recorder.peer_poll_interval_ms),
        }
    }

    /// Pause between captures; zero means as fast as possible
    pub fn capture_interval(&self, frame_rate: u32) -> Duration {
        match self.capture_interval {
            Some(interval) => interval,
            None if frame_rate == 0 => Duration::ZERO,
            None => Duration::from_millis(1000 / u64::from(frame_rate)),
        }
    }
}

/// Forward every command line from every controller connection into the session queue
fn spawn_command_listener(
    server: Arc<CommandServer>,
    events: mpsc::Sender<SessionEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("command-listener".to_string())
        .spawn(move || {
            while !server.is_closed() {
                let lines = match server.accept() {
                    Ok(lines) => lines,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        warn!("Failed to accept command connection: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                };

                for line in lines {
                    let event = match Command::parse(&line) {
                        Ok(command) => SessionEvent::Command(command),
                        Err(e) => SessionEvent::Malformed(e),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                debug!("Command connection closed; waiting for a new one");
            }
            debug!("Command listener exiting");
        })
}

/// Run the recorder role until its session terminates
pub fn run_recorder(config: &Config) -> Result<()> {
    // Sessions end through the command pipe only
    if let Err(e) = ctrlc::set_handler(|| info!("Ignoring Ctrl+C; the controller stops the recording")) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let state = serve(
        config,
        Arc::new(PrimaryDisplayGrabber),
        Arc::new(FfmpegEncoder::new(&config.recorder.ffmpeg_path)),
        Arc::new(LogNotifier),
    )?;

    if state != SessionState::Terminated {
        warn!("Recorder exiting while {}", state);
    }
    info!("Recorder finished");
    Ok(())
}

/// Serve one session over the configured channels with the given capture and encoding backends
pub(crate) fn serve(
    config: &Config,
    grabber: Arc<dyn ScreenGrabber>,
    encoder: Arc<dyn VideoEncoder>,
    notifier: Arc<dyn Notifier>,
) -> Result<SessionState> {
    let (command_endpoint, response_endpoint) = config.channels.endpoints()?;

    let server = Arc::new(
        CommandServer::bind(command_endpoint).context("Failed to open the command channel")?,
    );
    let responses = Arc::new(ResponseChannel::new(response_endpoint, notifier.clone()));

    let (events_tx, events_rx) = mpsc::channel();
    let listener = spawn_command_listener(server.clone(), events_tx.clone())
        .context("Failed to spawn command listener")?;

    let mut session = RecorderSession::new(
        RecorderSettings::from_config(config),
        grabber,
        Finalizer::new(encoder, config.recorder.output_file_name.clone()),
        responses.clone(),
        notifier,
        events_tx,
    );
    info!("Recorder session {} waiting for commands", session.id());

    let state = session.run(events_rx);

    server.close();
    responses.close();
    if listener.join().is_err() {
        warn!("Command listener panicked");
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_interval_derivation() {
        let mut settings = RecorderSettings::from_config(&Config::default());
        assert_eq!(settings.capture_interval(14), Duration::from_millis(71));
        assert_eq!(settings.capture_interval(0), Duration::ZERO);
        assert_eq!(settings.soft_frame_limit, 50_000);

        settings.capture_interval = Some(Duration::ZERO);
        assert_eq!(settings.capture_interval(14), Duration::ZERO);
    }

    #[cfg(unix)]
    #[test]
    fn test_listener_forwards_parsed_and_malformed_lines() {
        use crate::protocol::StartParams;
        use crate::transport::{CommandSender, Endpoint};

        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("cmd.sock"));
        let server = Arc::new(CommandServer::bind(endpoint.clone()).unwrap());
        let (tx, rx) = mpsc::channel();
        let listener = spawn_command_listener(server.clone(), tx).unwrap();

        let mut sender = CommandSender::new(endpoint.clone(), Duration::from_secs(5));
        sender.send(&Command::SetPeerId(11)).unwrap();
        sender.send(&Command::Start(StartParams::default())).unwrap();
        sender.close();

        // A second connection is served after the first one ends
        let mut raw = endpoint.connect_with_retry(Duration::from_secs(5)).unwrap();
        std::io::Write::write_all(&mut raw, b"@PAUSE@\n@STOP@\n").unwrap();
        drop(raw);

        let timeout = Duration::from_secs(5);
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), SessionEvent::Command(Command::SetPeerId(11))));
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), SessionEvent::Command(Command::Start(_))));
        assert!(matches!(
            rx.recv_timeout(timeout).unwrap(),
            SessionEvent::Malformed(ProtocolError::UnrecognizedCommand(_))
        ));
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), SessionEvent::Command(Command::Stop)));

        server.close();
        listener.join().unwrap();
    }
}
