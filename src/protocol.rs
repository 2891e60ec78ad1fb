//! Line protocol spoken between the controller and the recorder
//!
//! Commands travel controller -> recorder, responses travel recorder -> controller.
//! Every message is exactly one line of UTF-8 text. Commands are tagged with a
//! sentinel prefix; responses are either a sentinel control signal or an opaque
//! status string meant for display.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Sets the process id the recorder should watch for liveness
pub const SET_PEER_PID_PREFIX: &str = "@SET_UNITY_PID@";
/// Starts a recording; followed by `!key=value_key=value...`
pub const START_PREFIX: &str = "@START@";
/// Requests a graceful stop (exact match)
pub const STOP: &str = "@STOP@";

/// Recorder halted on its own (hard frame limit)
pub const EMERGENCY_STOP: &str = "@EMERGENCY_STOP@";
/// Recorder finished finalizing and is about to exit
pub const END: &str = "@END@";

const PARAMS_MARKER: char = '!';
const PARAM_SEPARATOR: char = '_';
const KEY_VALUE_SEPARATOR: char = '=';

pub const DEFAULT_FRAME_LIMIT: u64 = 60_000;
pub const DEFAULT_FRAME_RATE: u32 = 14;
pub const DEFAULT_DIRECTORY: &str = "Recording";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized command: {0:?}")]
    UnrecognizedCommand(String),

    #[error("invalid peer process id: {0:?}")]
    InvalidPeerId(String),

    #[error("value for {key} cannot be sent over the command channel: {value:?}")]
    UnencodableValue { key: &'static str, value: String },
}

/// Parameters carried by a `Start` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParams {
    /// Hard frame limit; crossing it forces an emergency stop
    pub frame_limit: u64,
    /// Frame rate of the output video
    pub frame_rate: u32,
    /// Directory receiving the intermediate frames and the output video
    pub directory_path: PathBuf,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            frame_limit: DEFAULT_FRAME_LIMIT,
            frame_rate: DEFAULT_FRAME_RATE,
            directory_path: PathBuf::from(DEFAULT_DIRECTORY),
        }
    }
}

impl StartParams {
    /// Apply a `key=value_key=value` payload on top of the current values.
    ///
    /// Unknown keys and fragments without exactly one `=` are ignored. A numeric
    /// value that does not parse leaves the current value untouched.
    pub fn apply_payload(&mut self, payload: &str) {
        for parameter in payload.split(PARAM_SEPARATOR) {
            let mut parts = parameter.split(KEY_VALUE_SEPARATOR);
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };

            match key {
                "frameLimit" => {
                    if let Ok(limit) = value.parse() {
                        self.frame_limit = limit;
                    }
                }
                "frameRate" => {
                    if let Ok(rate) = value.parse() {
                        self.frame_rate = rate;
                    }
                }
                "directoryPath" => self.directory_path = PathBuf::from(value),
                _ => {}
            }
        }
    }

    /// Check that every value survives the trip over the command channel
    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_encodable("directoryPath", &self.directory_path.to_string_lossy())
    }

    fn encode(&self) -> Result<String, ProtocolError> {
        self.validate()?;
        let directory = self.directory_path.to_string_lossy();

        Ok(format!(
            "{START_PREFIX}{PARAMS_MARKER}frameLimit={}_frameRate={}_directoryPath={}",
            self.frame_limit, self.frame_rate, directory
        ))
    }
}

fn check_encodable(key: &'static str, value: &str) -> Result<(), ProtocolError> {
    let forbidden = |c: char| c == PARAM_SEPARATOR || c == KEY_VALUE_SEPARATOR || c == '\n' || c == '\r';
    if value.is_empty() || value.contains(forbidden) {
        return Err(ProtocolError::UnencodableValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Commands sent from the controller to the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetPeerId(u32),
    Start(StartParams),
    Stop,
}

impl Command {
    /// Parse one command line. Trailing `\r` from CRLF peers is tolerated.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches('\r');

        if line == STOP {
            return Ok(Command::Stop);
        }

        if let Some(pid) = line.strip_prefix(SET_PEER_PID_PREFIX) {
            return pid
                .trim()
                .parse()
                .map(Command::SetPeerId)
                .map_err(|_| ProtocolError::InvalidPeerId(pid.to_string()));
        }

        if let Some(rest) = line.strip_prefix(START_PREFIX) {
            let payload = rest.strip_prefix(PARAMS_MARKER).unwrap_or(rest);
            let mut params = StartParams::default();
            params.apply_payload(payload);
            return Ok(Command::Start(params));
        }

        Err(ProtocolError::UnrecognizedCommand(line.to_string()))
    }

    /// Encode the command as a single line (without the terminator)
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            Command::SetPeerId(pid) => Ok(format!("{SET_PEER_PID_PREFIX}{pid}")),
            Command::Start(params) => params.encode(),
            Command::Stop => Ok(STOP.to_string()),
        }
    }
}

/// Messages sent from the recorder back to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Human-readable status line
    Status(String),
    EmergencyStop,
    End,
}

impl Response {
    pub fn status(message: impl Into<String>) -> Self {
        Response::Status(message.into())
    }

    /// Every line that is not a sentinel is a status string
    pub fn parse(line: &str) -> Self {
        match line.trim_end_matches('\r') {
            EMERGENCY_STOP => Response::EmergencyStop,
            END => Response::End,
            other => Response::Status(other.to_string()),
        }
    }

    /// Encode as a single line; embedded line breaks are flattened to spaces
    pub fn encode(&self) -> String {
        match self {
            Response::Status(message) => message.replace(['\r', '\n'], " "),
            Response::EmergencyStop => EMERGENCY_STOP.to_string(),
            Response::End => END.to_string(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
