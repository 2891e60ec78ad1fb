//! Controller side: launches the recorder, drives it over the command pipe and
//! mirrors its responses into a status string for the host
//!
//! One worker thread owns each recording session from launch to reaping. The
//! host only ever talks to [`ControllerSession`], whose start/stop entry points
//! are serialized by the worker slot lock.

pub mod launcher;

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::protocol::{Command, Response, StartParams};
use crate::transport::{CommandSender, Endpoint, ResponseReceiver, Stream, TransportError};

use launcher::{wait_for_exit, RecorderLauncher};

pub const IDLE_MESSAGE: &str = "The recorder is off";
pub const TEARDOWN_MESSAGE: &str = "Turning off the previous process... Wait a moment.";
pub const ALREADY_RUNNING_MESSAGE: &str =
    "The recorder is on. You have to stop the previous recording to start a new process.";
pub const HOST_NOT_RUNNING_MESSAGE: &str = "Run the host application before the recorder.";
const SEND_FAILED_MESSAGE: &str = "Error sending command to the recorder";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub command_endpoint: Endpoint,
    pub response_endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// How often the host flag and the recorder process are checked
    pub host_poll_interval: Duration,
    /// How long a stopping recorder may take to finish its video
    pub shutdown_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let (command_endpoint, response_endpoint) = config
            .channels
            .endpoints()
            .context("Invalid channel configuration")?;
        Ok(Self {
            command_endpoint,
            response_endpoint,
            connect_timeout: config.connect_timeout(),
            host_poll_interval: Duration::from_millis(config.controller.host_poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.controller.shutdown_timeout_secs),
        })
    }
}

/// Last known status plus the message shown once no session is running
struct StatusBoard {
    status: Mutex<String>,
    idle_message: Mutex<String>,
    updates: Mutex<Option<mpsc::Sender<String>>>,
}

impl StatusBoard {
    fn new() -> Self {
        Self {
            status: Mutex::new(String::new()),
            idle_message: Mutex::new(IDLE_MESSAGE.to_string()),
            updates: Mutex::new(None),
        }
    }

    fn status(&self) -> String {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("Status: {}", message);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = message.clone();

        let mut updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = updates.as_ref() {
            if tx.send(message).is_err() {
                *updates = None;
            }
        }
    }

    fn set_idle_message(&self, message: &str) {
        *self.idle_message.lock().unwrap_or_else(PoisonError::into_inner) = message.to_string();
    }

    fn show_idle(&self) {
        let idle = self.idle_message.lock().unwrap_or_else(PoisonError::into_inner).clone();
        self.set(idle);
    }
}

struct Worker {
    id: Uuid,
    stop: CancelToken,
    thread: JoinHandle<()>,
}

struct Inner {
    settings: ControllerSettings,
    launcher: Arc<dyn RecorderLauncher>,
    host_alive: Arc<AtomicBool>,
    board: Arc<StatusBoard>,
    worker: Mutex<Option<Worker>>,
}

/// Host-facing handle on the recorder.
///
/// `host_alive` is owned by the host: while it is true recordings may start;
/// once it turns false an active recording is stopped.
#[derive(Clone)]
pub struct ControllerSession {
    inner: Arc<Inner>,
}

impl ControllerSession {
    pub fn new(
        settings: ControllerSettings,
        launcher: Arc<dyn RecorderLauncher>,
        host_alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                launcher,
                host_alive,
                board: Arc::new(StatusBoard::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Every status change is also sent to `updates`
    pub fn with_status_updates(self, updates: mpsc::Sender<String>) -> Self {
        *self
            .inner
            .board
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(updates);
        self
    }

    pub fn status(&self) -> String {
        self.inner.board.status()
    }

    /// Whether a recording session is running or tearing down
    pub fn is_active(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    /// Start a recording unless the host is not running or one is already active
    pub fn request_start(&self, params: StartParams) {
        Inner::request_start(&self.inner, params);
    }

    /// Stop the active recording and wait for its session to wind down.
    /// Without an active recording this only refreshes the status.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }
}

impl Inner {
    fn request_start(this: &Arc<Self>, params: StartParams) {
        if !this.host_alive.load(Ordering::SeqCst) {
            this.board.set(HOST_NOT_RUNNING_MESSAGE);
            return;
        }

        let mut slot = this.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|worker| !worker.thread.is_finished()) {
            this.board.set(ALREADY_RUNNING_MESSAGE);
            return;
        }
        if let Some(finished) = slot.take() {
            if finished.thread.join().is_err() {
                error!("Session {} worker panicked", finished.id);
            }
        }
        if let Err(e) = params.validate() {
            warn!("Refusing to start the recorder: {}", e);
            this.board.set(format!("Cannot start the recorder: {}", e));
            return;
        }

        let id = Uuid::new_v4();
        let stop = CancelToken::new();
        let finished = CancelToken::new();
        let session = SessionWorker {
            id,
            settings: this.settings.clone(),
            launcher: this.launcher.clone(),
            board: this.board.clone(),
            stop: stop.clone(),
            finished: finished.clone(),
            params,
        };

        let thread = match std::thread::Builder::new()
            .name("controller-session".to_string())
            .spawn(move || session.run())
        {
            Ok(thread) => thread,
            Err(e) => {
                error!("Failed to spawn session worker: {}", e);
                this.board.set(format!("Failed to start the recorder: {}", e));
                return;
            }
        };
        *slot = Some(Worker { id, stop, thread });
        drop(slot);

        if let Err(e) = spawn_host_monitor(this.clone(), finished) {
            warn!("Host liveness is not monitored: {}", e);
        }
    }

    fn request_stop(&self) {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(worker) = slot.take() else {
            self.board.show_idle();
            return;
        };

        if worker.thread.is_finished() {
            if worker.thread.join().is_err() {
                error!("Session {} worker panicked", worker.id);
            }
            self.board.show_idle();
            return;
        }

        info!("Stopping session {}", worker.id);
        self.board.set_idle_message(TEARDOWN_MESSAGE);
        self.board.set(TEARDOWN_MESSAGE);
        worker.stop.cancel();
        if worker.thread.join().is_err() {
            error!("Session {} worker panicked", worker.id);
        }
        self.board.set_idle_message(IDLE_MESSAGE);
        info!("Session {} stopped", worker.id);
    }
}

/// Stop the active session once the host reports it is shutting down
fn spawn_host_monitor(inner: Arc<Inner>, finished: CancelToken) -> std::io::Result<JoinHandle<()>> {
    let interval = inner.settings.host_poll_interval;
    std::thread::Builder::new()
        .name("host-monitor".to_string())
        .spawn(move || loop {
            if finished.wait_timeout(interval) {
                return;
            }
            if !inner.host_alive.load(Ordering::SeqCst) {
                info!("Host is shutting down; stopping the recorder");
                inner.request_stop();
                return;
            }
        })
}

/// Flags shared between a session worker and its response listener
#[derive(Default)]
struct ListenerFlags {
    /// The recorder halted itself; it must not be sent a stop
    halted: AtomicBool,
    /// The recorder reported the end of its session
    ended: AtomicBool,
}

/// Apply one recorder response to the controller state
fn apply_response(response: Response, board: &StatusBoard, stop: &CancelToken, flags: &ListenerFlags) {
    match response {
        Response::EmergencyStop => {
            if !flags.halted.swap(true, Ordering::SeqCst) {
                warn!("Recorder reported an emergency stop");
                stop.cancel();
            }
        }
        Response::End => {
            flags.ended.store(true, Ordering::SeqCst);
            board.set_idle_message(IDLE_MESSAGE);
            board.set(IDLE_MESSAGE);
        }
        Response::Status(message) => board.set(message),
    }
}

struct ResponseListener {
    thread: JoinHandle<()>,
    handle: Arc<Mutex<Option<Stream>>>,
    abort: CancelToken,
}

impl ResponseListener {
    fn spawn(
        endpoint: Endpoint,
        connect_timeout: Duration,
        board: Arc<StatusBoard>,
        stop: CancelToken,
        flags: Arc<ListenerFlags>,
    ) -> std::io::Result<Self> {
        let handle = Arc::new(Mutex::new(None));
        let slot = handle.clone();
        let abort = CancelToken::new();
        let connecting = abort.clone();

        let thread = std::thread::Builder::new()
            .name("response-listener".to_string())
            .spawn(move || {
                let receiver = match ResponseReceiver::connect_until(&endpoint, connect_timeout, &connecting) {
                    Ok(receiver) => receiver,
                    Err(TransportError::Closed) => {
                        debug!("Response channel abandoned before the recorder opened it");
                        return;
                    }
                    Err(e) => {
                        error!("Response channel unavailable: {}", e);
                        board.set(format!("Could not read the recorder's responses: {}", e));
                        return;
                    }
                };
                match receiver.shutdown_handle() {
                    Ok(stream) => *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream),
                    Err(e) => warn!("Response channel cannot be interrupted: {}", e),
                }

                for response in receiver.responses() {
                    apply_response(response, &board, &stop, &flags);
                }
                debug!("Response channel closed");
            })?;

        Ok(Self { thread, handle, abort })
    }

    /// End the response stream and wait for the listener to exit
    fn finish(self) {
        self.abort.cancel();
        if let Some(stream) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            stream.shutdown();
        }
        if self.thread.join().is_err() {
            error!("Response listener panicked");
        }
    }
}

/// Everything one session worker thread owns
struct SessionWorker {
    id: Uuid,
    settings: ControllerSettings,
    launcher: Arc<dyn RecorderLauncher>,
    board: Arc<StatusBoard>,
    stop: CancelToken,
    finished: CancelToken,
    params: StartParams,
}

impl SessionWorker {
    fn run(self) {
        let span = tracing::info_span!("controller_session", id = %self.id);
        let _enter = span.enter();
        let started_at = Local::now();

        if let Err(e) = self.drive() {
            error!("Recording session failed: {:#}", e);
            self.board.set(format!("The recorder failed: {:#}", e));
        }

        let elapsed = Local::now().signed_duration_since(started_at);
        info!(
            "Session started at {} finished after {}s",
            started_at.format("%Y-%m-%d %H:%M:%S"),
            elapsed.num_seconds()
        );
        self.finished.cancel();
    }

    fn drive(&self) -> Result<()> {
        let mut recorder = self
            .launcher
            .launch()
            .context("Failed to start the recorder process")?;
        info!("Recorder process {} started", recorder.id());

        let flags = Arc::new(ListenerFlags::default());
        let listener = ResponseListener::spawn(
            self.settings.response_endpoint.clone(),
            self.settings.connect_timeout,
            self.board.clone(),
            self.stop.clone(),
            flags.clone(),
        );
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                let _ = recorder.kill();
                return Err(e).context("Failed to spawn response listener");
            }
        };

        let mut commands = CommandSender::new(
            self.settings.command_endpoint.clone(),
            self.settings.connect_timeout,
        );
        let _ = self.send(&mut commands, &Command::SetPeerId(std::process::id()));
        if let Err(e) = self.send(&mut commands, &Command::Start(self.params.clone())) {
            // The recorder never left Idle, so a stop would not end it
            if let Err(kill_error) = recorder.kill() {
                warn!("Failed to kill recorder {}: {}", recorder.id(), kill_error);
            }
            commands.close();
            listener.finish();
            self.board.set(format!("{}: {}", SEND_FAILED_MESSAGE, e));
            return Ok(());
        }

        let mut exited = false;
        while !self.stop.wait_timeout(self.settings.host_poll_interval) {
            match recorder.try_wait() {
                Ok(true) => {
                    warn!("Recorder process {} exited during the session", recorder.id());
                    exited = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to query recorder process: {}", e),
            }
        }

        if !exited && !flags.halted.load(Ordering::SeqCst) {
            let _ = self.send(&mut commands, &Command::Stop);
        }

        if !exited {
            wait_for_exit(recorder.as_mut(), self.settings.shutdown_timeout, EXIT_POLL_INTERVAL);
        }
        commands.close();
        listener.finish();

        if !flags.ended.load(Ordering::SeqCst) {
            warn!("Recorder exited without ending its session");
            self.board.set(IDLE_MESSAGE);
        }
        Ok(())
    }

    /// Send one command; a failure is logged and published as the status
    fn send(&self, commands: &mut CommandSender, command: &Command) -> Result<(), TransportError> {
        commands.send(command).inspect_err(|e| {
            error!(
                "Error sending command {:?}: {}. This error is related to problems in the \
                 communication between the controller and the screen recorder process.",
                command, e
            );
            self.board.set(format!("{}: {}", SEND_FAILED_MESSAGE, e));
        })
    }
}
