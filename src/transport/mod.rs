//! Line-oriented local transport between controller and recorder
//!
//! Two unidirectional pipes: the command pipe (controller -> recorder) and the
//! response pipe (recorder -> controller). The recorder listens on both; the
//! controller connects. Each pipe carries one connection at a time and frames
//! messages with a single `\n`.

mod endpoint;

pub use endpoint::{Endpoint, Listener, Stream};

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::notice::Notifier;
use crate::protocol::{Command, ProtocolError, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not reach {endpoint} within {timeout:?}: {source}")]
    Unreachable {
        endpoint: String,
        timeout: Duration,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("response channel is detached from its reader")]
    Detached,

    #[error("channel closed")]
    Closed,
}

impl TransportError {
    fn io(endpoint: &Endpoint, source: io::Error) -> Self {
        TransportError::Io {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

/// Destination for recorder responses.
///
/// Sending never fails from the caller's point of view: delivery problems are
/// reported by the implementation and the caller carries on.
pub trait ResponseSink: Send + Sync {
    fn respond(&self, response: Response);

    /// Stop waiting for a reader; later responses are dropped after logging
    fn detach(&self) {}
}

fn write_line(writer: &mut BufWriter<Stream>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Lazy sequence of lines read from one accepted connection.
///
/// Blocks between lines and ends when the peer closes the connection.
pub struct LineReader {
    endpoint: String,
    lines: io::Lines<BufReader<Stream>>,
}

impl LineReader {
    fn new(endpoint: &Endpoint, stream: Stream) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            lines: BufReader::new(stream).lines(),
        }
    }
}

impl Iterator for LineReader {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        match self.lines.next()? {
            Ok(line) => {
                debug!("<- [{}] {}", self.endpoint, line);
                Some(line.trim_end_matches('\r').to_string())
            }
            Err(e) => {
                debug!("Read on {} ended: {}", self.endpoint, e);
                None
            }
        }
    }
}

/// Controller-side writer for the command pipe
pub struct CommandSender {
    endpoint: Endpoint,
    connect_timeout: Duration,
    writer: Option<BufWriter<Stream>>,
}

impl CommandSender {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            writer: None,
        }
    }

    /// Send one command, connecting first if needed. Commands are not retried.
    pub fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        let line = command.encode()?;

        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let stream = self.endpoint.connect_with_retry(self.connect_timeout)?;
                info!("Connected command channel {}", self.endpoint);
                BufWriter::new(stream)
            }
        };

        write_line(&mut writer, &line).map_err(|e| TransportError::io(&self.endpoint, e))?;
        debug!("-> [{}] {}", self.endpoint, line);
        self.writer = Some(writer);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.get_ref().shutdown();
        }
    }
}

/// Recorder-side listener for the command pipe
pub struct CommandServer {
    endpoint: Endpoint,
    listener: Listener,
    closed: AtomicBool,
    active: Mutex<Option<Stream>>,
}

impl CommandServer {
    pub fn bind(endpoint: Endpoint) -> Result<Self, TransportError> {
        let listener = endpoint.bind().map_err(|e| TransportError::io(&endpoint, e))?;
        info!("Listening for commands on {}", endpoint);
        Ok(Self {
            endpoint,
            listener,
            closed: AtomicBool::new(false),
            active: Mutex::new(None),
        })
    }

    /// Wait for the controller to connect and return its command lines
    pub fn accept(&self) -> Result<LineReader, TransportError> {
        let stream = self
            .listener
            .accept()
            .map_err(|e| TransportError::io(&self.endpoint, e))?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let handle = stream
            .try_clone()
            .map_err(|e| TransportError::io(&self.endpoint, e))?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!("Command connection accepted on {}", self.endpoint);
        Ok(LineReader::new(&self.endpoint, stream))
    }

    /// Stop serving: end the current connection and wake a pending accept
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            stream.shutdown();
        }
        let _ = self.endpoint.connect();
        self.endpoint.cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ResponsePipe {
    listener: Option<Listener>,
    writer: Option<BufWriter<Stream>>,
}

/// Recorder-side writer for the response pipe.
///
/// The pipe is created lazily: the first response binds the listener and blocks
/// until the controller connects. All writers go through one lock so lines from
/// the capture thread and the session thread never interleave or race the
/// reconnect.
pub struct ResponseChannel {
    endpoint: Endpoint,
    notifier: Arc<dyn Notifier>,
    pipe: Mutex<ResponsePipe>,
    detached: AtomicBool,
}

impl ResponseChannel {
    pub fn new(endpoint: Endpoint, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            endpoint,
            notifier,
            pipe: Mutex::new(ResponsePipe::default()),
            detached: AtomicBool::new(false),
        }
    }

    pub fn send(&self, response: &Response) -> Result<(), TransportError> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(TransportError::Detached);
        }

        let mut pipe = self.pipe.lock().unwrap_or_else(PoisonError::into_inner);

        let mut writer = match pipe.writer.take() {
            Some(writer) => writer,
            None => {
                let listener = match pipe.listener.take() {
                    Some(listener) => listener,
                    None => self
                        .endpoint
                        .bind()
                        .map_err(|e| TransportError::io(&self.endpoint, e))?,
                };
                if self.detached.load(Ordering::SeqCst) {
                    pipe.listener = Some(listener);
                    return Err(TransportError::Detached);
                }
                debug!("Waiting for a reader on {}", self.endpoint);
                let accepted = listener.accept();
                pipe.listener = Some(listener);
                let stream = accepted.map_err(|e| TransportError::io(&self.endpoint, e))?;

                if self.detached.load(Ordering::SeqCst) {
                    return Err(TransportError::Detached);
                }
                info!("Response reader connected on {}", self.endpoint);
                BufWriter::new(stream)
            }
        };

        let line = response.encode();
        write_line(&mut writer, &line).map_err(|e| TransportError::io(&self.endpoint, e))?;
        debug!("-> [{}] {}", self.endpoint, line);
        pipe.writer = Some(writer);
        Ok(())
    }

    /// Give up on the reader: later responses are only logged.
    ///
    /// A sender blocked waiting for a reader is released by a throwaway connection.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Response channel {} detached", self.endpoint);
        let _ = self.endpoint.connect();
    }

    pub fn close(&self) {
        self.detached.store(true, Ordering::SeqCst);
        let mut pipe = self.pipe.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = pipe.writer.take() {
            writer.get_ref().shutdown();
        }
        pipe.listener = None;
        self.endpoint.cleanup();
    }
}

impl ResponseSink for ResponseChannel {
    fn respond(&self, response: Response) {
        match self.send(&response) {
            Ok(()) => {}
            Err(TransportError::Detached) => {
                info!("(detached) {}", response);
            }
            Err(e) => {
                self.notifier.notice(&format!(
                    "Failed to send response: {} Error message: {}. This error is related to problems \
                     in the communication between the controller and the screen recorder process.",
                    response, e
                ));
            }
        }
    }

    fn detach(&self) {
        ResponseChannel::detach(self);
    }
}

/// Controller-side reader for the response pipe
pub struct ResponseReceiver {
    reader: LineReader,
    handle: Stream,
}

impl ResponseReceiver {
    /// Connect unless `abort` is cancelled first
    pub fn connect_until(
        endpoint: &Endpoint,
        timeout: Duration,
        abort: &CancelToken,
    ) -> Result<Self, TransportError> {
        let stream = endpoint.connect_until(timeout, abort)?;
        let handle = stream
            .try_clone()
            .map_err(|e| TransportError::io(endpoint, e))?;
        info!("Connected response channel {}", endpoint);
        Ok(Self {
            reader: LineReader::new(endpoint, stream),
            handle,
        })
    }

    /// Handle that can end the stream from another thread
    pub fn shutdown_handle(&self) -> Result<Stream, TransportError> {
        self.handle.try_clone().map_err(|e| TransportError::Io {
            endpoint: self.reader.endpoint.clone(),
            source: e,
        })
    }

    pub fn responses(self) -> impl Iterator<Item = Response> {
        self.reader.map(|line| Response::parse(&line))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notice::{CollectingNotifier, LogNotifier};
    use crate::protocol::StartParams;
    use std::thread;

    fn endpoints(dir: &tempfile::TempDir) -> (Endpoint, Endpoint) {
        (
            Endpoint::Unix(dir.path().join("cmd.sock")),
            Endpoint::Unix(dir.path().join("resp.sock")),
        )
    }

    #[test]
    fn test_commands_arrive_in_send_order() {
        let dir = tempfile::tempdir().unwrap();
        let (cmd, _) = endpoints(&dir);
        let server = CommandServer::bind(cmd.clone()).unwrap();

        let sender = thread::spawn(move || {
            let mut sender = CommandSender::new(cmd, Duration::from_secs(5));
            sender.send(&Command::SetPeerId(7)).unwrap();
            sender.send(&Command::Start(StartParams::default())).unwrap();
            sender.send(&Command::Stop).unwrap();
            sender.close();
        });

        let lines: Vec<String> = server.accept().unwrap().collect();
        sender.join().unwrap();

        let commands: Vec<Command> = lines.iter().map(|l| Command::parse(l).unwrap()).collect();
        assert_eq!(
            commands,
            vec![
                Command::SetPeerId(7),
                Command::Start(StartParams::default()),
                Command::Stop
            ]
        );
    }

    #[test]
    fn test_unreachable_command_channel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (cmd, _) = endpoints(&dir);
        let mut sender = CommandSender::new(cmd, Duration::from_millis(100));
        assert!(matches!(
            sender.send(&Command::Stop),
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_first_response_waits_for_reader() {
        let dir = tempfile::tempdir().unwrap();
        let (_, resp) = endpoints(&dir);
        let channel = Arc::new(ResponseChannel::new(resp.clone(), Arc::new(LogNotifier)));

        let writer = {
            let channel = channel.clone();
            thread::spawn(move || {
                channel.respond(Response::status("Recording..."));
                channel.respond(Response::EmergencyStop);
                channel.respond(Response::End);
                channel.close();
            })
        };

        let receiver = ResponseReceiver::connect_until(&resp, Duration::from_secs(5), &CancelToken::new()).unwrap();
        let responses: Vec<Response> = receiver.responses().collect();
        writer.join().unwrap();

        assert_eq!(
            responses,
            vec![Response::status("Recording..."), Response::EmergencyStop, Response::End]
        );
    }

    #[test]
    fn test_detach_releases_blocked_sender() {
        let dir = tempfile::tempdir().unwrap();
        let (_, resp) = endpoints(&dir);
        let channel = Arc::new(ResponseChannel::new(resp, Arc::new(LogNotifier)));

        let writer = {
            let channel = channel.clone();
            thread::spawn(move || channel.send(&Response::End))
        };

        // Let the sender bind and block in accept before detaching
        thread::sleep(Duration::from_millis(100));
        channel.detach();

        assert!(matches!(writer.join().unwrap(), Err(TransportError::Detached)));
        assert!(matches!(channel.send(&Response::End), Err(TransportError::Detached)));
    }

    #[test]
    fn test_close_wakes_pending_accept() {
        let dir = tempfile::tempdir().unwrap();
        let (cmd, _) = endpoints(&dir);
        let server = Arc::new(CommandServer::bind(cmd).unwrap());

        let acceptor = {
            let server = server.clone();
            thread::spawn(move || server.accept().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        server.close();

        assert!(matches!(acceptor.join().unwrap(), Err(TransportError::Closed)));
        assert!(server.is_closed());
    }

    #[test]
    fn test_failed_response_raises_notice() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let notifier = Arc::new(CollectingNotifier::default());
        let channel = ResponseChannel::new(Endpoint::Unix(blocker.join("resp.sock")), notifier.clone());

        channel.respond(Response::status("Recording..."));

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Failed to send response: Recording..."));
        assert!(notifier.blocking_notices().is_empty());
    }

    #[test]
    fn test_aborted_connect_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let (_, resp) = endpoints(&dir);
        let abort = CancelToken::new();

        let connector = {
            let abort = abort.clone();
            thread::spawn(move || ResponseReceiver::connect_until(&resp, Duration::MAX, &abort).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(100));
        abort.cancel();

        assert!(matches!(connector.join().unwrap(), Err(TransportError::Closed)));
    }
}
