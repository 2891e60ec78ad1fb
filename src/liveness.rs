//! Process liveness probing
//!
//! Each side watches its peer by process id. Ids can be recycled by the OS, so
//! a positive answer is approximate; a negative one is reliable.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

/// Check whether a process with this id currently exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // Signal 0 performs the permission and existence checks without delivering anything
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }

    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut code).is_ok() && code == STILL_ACTIVE.0 as u32;
        let _ = CloseHandle(handle);
        alive
    }
}

#[cfg(not(any(unix, windows)))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Outcome reported by a peer monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The watched process was not running when monitoring began
    NotFound(u32),
    /// The watched process exited while being monitored
    Exited(u32),
}

/// Watch `pid` every `interval` until it exits or `cancel` fires.
///
/// At most one event is sent, mapped into the caller's event type by `into_event`.
pub fn spawn_peer_monitor<E, F>(
    pid: u32,
    interval: Duration,
    cancel: CancelToken,
    events: mpsc::Sender<E>,
    into_event: F,
) -> std::io::Result<JoinHandle<()>>
where
    E: Send + 'static,
    F: Fn(PeerEvent) -> E + Send + 'static,
{
    std::thread::Builder::new()
        .name("peer-monitor".to_string())
        .spawn(move || {
            if !process_alive(pid) {
                warn!("Peer process {} is not running", pid);
                let _ = events.send(into_event(PeerEvent::NotFound(pid)));
                return;
            }

            info!("Monitoring peer process {}", pid);
            loop {
                if cancel.wait_timeout(interval) {
                    debug!("Peer monitor for {} cancelled", pid);
                    return;
                }
                if !process_alive(pid) {
                    warn!("Peer process {} has exited", pid);
                    let _ = events.send(into_event(PeerEvent::Exited(pid)));
                    return;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_detected() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }

    #[test]
    fn test_monitor_reports_missing_peer() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_peer_monitor(
            u32::MAX,
            Duration::from_millis(10),
            CancelToken::new(),
            tx,
            |event| event,
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(rx.recv().unwrap(), PeerEvent::NotFound(u32::MAX));
    }

    #[test]
    fn test_monitor_stops_on_cancel() {
        let (tx, rx) = mpsc::channel::<PeerEvent>();
        let cancel = CancelToken::new();
        let handle = spawn_peer_monitor(
            std::process::id(),
            Duration::from_secs(30),
            cancel.clone(),
            tx,
            |event| event,
        )
        .unwrap();
        cancel.cancel();
        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
