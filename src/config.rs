//! Configuration management for the screen recorder

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{StartParams, DEFAULT_DIRECTORY, DEFAULT_FRAME_LIMIT, DEFAULT_FRAME_RATE};
use crate::transport::Endpoint;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Parameters sent with every start request
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Recorder process behavior
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Controller behavior
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Where the command and response pipes live
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Hard frame limit; the recorder stops itself after this many frames
    #[serde(default = "default_frame_limit")]
    pub frame_limit: u64,

    /// Frame rate of the output video
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Directory for frames and the output video, relative to the working directory
    #[serde(default = "default_directory_path")]
    pub directory_path: PathBuf,

    /// Start recording as soon as the host starts
    #[serde(default)]
    pub record_on_launch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Frame count that triggers the one-time warning
    #[serde(default = "default_soft_frame_limit")]
    pub soft_frame_limit: u64,

    /// Delay between captures (ms). Derived from the frame rate when unset; 0 = as fast as possible
    #[serde(default)]
    pub capture_interval_ms: Option<u64>,

    /// Controller liveness polling interval (ms)
    #[serde(default = "default_poll_interval")]
    pub peer_poll_interval_ms: u64,

    #[serde(default = "default_output_file_name")]
    pub output_file_name: String,

    /// ffmpeg executable used to encode the video
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Recorder executable; defaults to this binary in recorder mode
    #[serde(default)]
    pub recorder_executable: Option<PathBuf>,

    /// Host liveness polling interval (ms)
    #[serde(default = "default_poll_interval")]
    pub host_poll_interval_ms: u64,

    /// How long to keep retrying a connection to the recorder (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Grace period for the recorder to finish the video before it is killed
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix domain sockets in `socket_dir`
    Unix,
    /// Loopback TCP on `tcp_base_port` and the port after it
    Tcp,
}

impl Default for TransportKind {
    fn default() -> Self {
        if cfg!(unix) {
            TransportKind::Unix
        } else {
            TransportKind::Tcp
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub transport: TransportKind,

    /// Directory holding the socket files; the system temp dir when unset
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,

    #[serde(default = "default_command_name")]
    pub command_name: String,

    #[serde(default = "default_response_name")]
    pub response_name: String,

    /// Command port; responses use the next one
    #[serde(default = "default_tcp_base_port")]
    pub tcp_base_port: u16,
}

// Default value functions
fn default_frame_limit() -> u64 {
    DEFAULT_FRAME_LIMIT
}

fn default_frame_rate() -> u32 {
    DEFAULT_FRAME_RATE
}

fn default_directory_path() -> PathBuf {
    PathBuf::from(DEFAULT_DIRECTORY)
}

fn default_soft_frame_limit() -> u64 {
    50_000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_output_file_name() -> String {
    "output_video.mp4".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    300
}

fn default_command_name() -> String {
    "ScreenRecorderPipe".to_string()
}

fn default_response_name() -> String {
    "ScreenRecorderResponsePipe".to_string()
}

fn default_tcp_base_port() -> u16 {
    47630
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            frame_limit: default_frame_limit(),
            frame_rate: default_frame_rate(),
            directory_path: default_directory_path(),
            record_on_launch: false,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            soft_frame_limit: default_soft_frame_limit(),
            capture_interval_ms: None,
            peer_poll_interval_ms: default_poll_interval(),
            output_file_name: default_output_file_name(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recorder_executable: None,
            host_poll_interval_ms: default_poll_interval(),
            connect_timeout_ms: default_connect_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            socket_dir: None,
            command_name: default_command_name(),
            response_name: default_response_name(),
            tcp_base_port: default_tcp_base_port(),
        }
    }
}

impl RecordingConfig {
    /// Parameters for a `Start` command
    pub fn start_params(&self) -> StartParams {
        StartParams {
            frame_limit: self.frame_limit,
            frame_rate: self.frame_rate,
            directory_path: self.directory_path.clone(),
        }
    }
}

impl ChannelsConfig {
    /// Command and response endpoints, in that order
    pub fn endpoints(&self) -> Result<(Endpoint, Endpoint)> {
        match self.transport {
            TransportKind::Unix => self.unix_endpoints(),
            TransportKind::Tcp => {
                let response_port = self
                    .tcp_base_port
                    .checked_add(1)
                    .context("tcp_base_port leaves no room for the response port")?;
                Ok((
                    Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, self.tcp_base_port))),
                    Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, response_port))),
                ))
            }
        }
    }

    #[cfg(unix)]
    fn unix_endpoints(&self) -> Result<(Endpoint, Endpoint)> {
        if self.command_name == self.response_name {
            bail!("command_name and response_name must differ");
        }
        let dir = self.socket_dir.clone().unwrap_or_else(std::env::temp_dir);
        Ok((
            Endpoint::Unix(dir.join(format!("{}.sock", self.command_name))),
            Endpoint::Unix(dir.join(format!("{}.sock", self.response_name))),
        ))
    }

    #[cfg(not(unix))]
    fn unix_endpoints(&self) -> Result<(Endpoint, Endpoint)> {
        bail!("unix transport is not available on this platform; use transport = \"tcp\"")
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path()?)
    }

    /// Load configuration from `config_path`, writing defaults there if it does not exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(config_path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "screen-recorder", "screen-recorder")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.connect_timeout_ms)
    }
}
