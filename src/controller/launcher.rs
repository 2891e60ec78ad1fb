//! Starting and reaping the recorder process

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::Config;

/// Argument that puts the binary into recorder mode
pub const RECORD_ARG: &str = "record";

/// A running recorder
pub trait RecorderHandle: Send {
    fn id(&self) -> u32;

    /// Whether the recorder has exited, without blocking
    fn try_wait(&mut self) -> io::Result<bool>;

    /// Terminate the recorder and reap it
    fn kill(&mut self) -> io::Result<()>;
}

pub trait RecorderLauncher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn RecorderHandle>>;
}

/// Launches the recorder as a child process
#[derive(Debug, Clone)]
pub struct ChildLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The configured recorder executable, or this binary, in recorder mode with the same config file
    pub fn from_config(config: &Config) -> Result<Self> {
        let program = match &config.controller.recorder_executable {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("Failed to locate the current executable")?,
        };

        let mut args = vec![OsString::from(RECORD_ARG)];
        match config.config_path() {
            Ok(path) => {
                args.push(OsString::from("--config"));
                args.push(path.into_os_string());
            }
            Err(e) => warn!("Recorder will use its default config: {}", e),
        }

        Ok(Self::new(program, args))
    }
}

/// Put the recorder in its own process group so a terminal Ctrl+C only reaches
/// the controller, which then stops the recording itself
#[cfg(unix)]
fn detach_from_console_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach_from_console_group(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    use windows::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP.0);
}

#[cfg(not(any(unix, windows)))]
fn detach_from_console_group(_command: &mut Command) {}

impl RecorderLauncher for ChildLauncher {
    fn launch(&self) -> io::Result<Box<dyn RecorderHandle>> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null()).stdout(Stdio::null());
        detach_from_console_group(&mut command);
        let child = command.spawn()?;
        info!("Launched {:?} as process {}", self.program, child.id());
        Ok(Box::new(ChildRecorder(child)))
    }
}

struct ChildRecorder(Child);

impl RecorderHandle for ChildRecorder {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.0.try_wait()?.is_some())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kill()?;
        self.0.wait().map(|_| ())
    }
}

/// Wait up to `timeout` for the recorder to exit, then kill it.
///
/// Returns `true` if the recorder exited on its own. A timeout too large to
/// represent as a deadline never kills.
pub fn wait_for_exit(recorder: &mut dyn RecorderHandle, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match recorder.try_wait() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!("Failed to query recorder {}: {}", recorder.id(), e),
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        std::thread::sleep(poll);
    }

    warn!("Recorder {} still running after {:?}; killing it", recorder.id(), timeout);
    if let Err(e) = recorder.kill() {
        warn!("Failed to kill recorder {}: {}", recorder.id(), e);
    }
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_exited_recorder_is_reaped_without_kill() {
        let launcher = ChildLauncher::new("true", Vec::new());
        let mut recorder = launcher.launch().unwrap();
        assert!(wait_for_exit(recorder.as_mut(), Duration::from_secs(5), Duration::from_millis(10)));
    }

    #[test]
    fn test_unbounded_wait_returns_when_recorder_exits() {
        let launcher = ChildLauncher::new("sleep", vec![OsString::from("0.1")]);
        let mut recorder = launcher.launch().unwrap();
        assert!(wait_for_exit(recorder.as_mut(), Duration::MAX, Duration::from_millis(10)));
    }

    #[test]
    fn test_recorder_survives_interrupt_to_controller_group() {
        let launcher = ChildLauncher::new("sleep", vec![OsString::from("30")]);
        let mut recorder = launcher.launch().unwrap();
        let pid = recorder.id() as libc::pid_t;

        // SAFETY: plain process-group queries on our own child
        let (child_group, own_group) = unsafe { (libc::getpgid(pid), libc::getpgrp()) };
        assert_eq!(child_group, pid);
        assert_ne!(child_group, own_group);

        // The terminal signals the foreground group; the recorder leads its own
        assert_eq!(unsafe { libc::kill(-child_group, 0) }, 0);
        assert!(!recorder.try_wait().unwrap());

        recorder.kill().unwrap();
    }

    #[test]
    fn test_hung_recorder_is_killed() {
        let launcher = ChildLauncher::new("sleep", vec![OsString::from("30")]);
        let mut recorder = launcher.launch().unwrap();
        let started = Instant::now();

        assert!(!wait_for_exit(recorder.as_mut(), Duration::from_millis(100), Duration::from_millis(10)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(recorder.try_wait().unwrap());
    }

    #[test]
    fn test_launcher_passes_record_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::load_from(&path).unwrap();
        config.controller.recorder_executable = Some(PathBuf::from("/opt/recorder"));

        let launcher = ChildLauncher::from_config(&config).unwrap();
        assert_eq!(launcher.program, PathBuf::from("/opt/recorder"));
        assert_eq!(
            launcher.args,
            vec![
                OsString::from("record"),
                OsString::from("--config"),
                path.into_os_string()
            ]
        );
    }
}
