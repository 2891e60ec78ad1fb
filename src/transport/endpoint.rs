//! Local socket endpoints backing the two logical pipes
//!
//! Unix domain sockets are used where available; loopback TCP is the portable
//! fallback. Both flavors expose the same blocking listener/stream API.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

use super::TransportError;
use crate::cancel::CancelToken;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Address of one logical pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl Endpoint {
    /// Bind a listener, replacing a stale socket file left by a previous run
    pub fn bind(&self) -> io::Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("Removed stale socket {:?}", path),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                UnixListener::bind(path).map(Listener::Unix)
            }
            Endpoint::Tcp(addr) => TcpListener::bind(addr).map(Listener::Tcp),
        }
    }

    pub fn connect(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixStream::connect(path).map(Stream::Unix),
            Endpoint::Tcp(addr) => TcpStream::connect(addr).map(Stream::Tcp),
        }
    }

    /// Keep trying to connect until the peer starts listening or `timeout` elapses
    pub fn connect_with_retry(&self, timeout: Duration) -> Result<Stream, TransportError> {
        self.connect_until(timeout, &CancelToken::new())
    }

    /// Like [`Endpoint::connect_with_retry`], but gives up with
    /// [`TransportError::Closed`] once `abort` is cancelled
    pub fn connect_until(&self, timeout: Duration, abort: &CancelToken) -> Result<Stream, TransportError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(e) if deadline.is_some_and(|deadline| Instant::now() >= deadline) => {
                    return Err(TransportError::Unreachable {
                        endpoint: self.to_string(),
                        timeout,
                        source: e,
                    });
                }
                Err(_) => {
                    if abort.wait_timeout(CONNECT_RETRY_INTERVAL) {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    /// Remove the socket file, if this endpoint has one
    pub fn cleanup(&self) {
        #[cfg(unix)]
        {
            if let Endpoint::Unix(path) = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

pub enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Block until one peer connects
    pub fn accept(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener) => listener.accept().map(|(stream, _)| Stream::Unix(stream)),
            Listener::Tcp(listener) => listener.accept().map(|(stream, _)| Stream::Tcp(stream)),
        }
    }
}

pub enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            #[cfg(unix)]
            Stream::Unix(stream) => stream.try_clone().map(Stream::Unix),
            Stream::Tcp(stream) => stream.try_clone().map(Stream::Tcp),
        }
    }

    /// Close both directions; wakes any thread blocked reading the stream
    pub fn shutdown(&self) {
        let _ = match self {
            #[cfg(unix)]
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
            Stream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
            Stream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
            Stream::Tcp(stream) => stream.flush(),
        }
    }
}
