//! Error types for the device session layer.
//!
//! Every fallible operation in dronelink returns [`SessionError`]. Errors carry
//! enough structured context to decide whether a retry makes sense and to
//! produce a human-readable message for the UI bridge.
//!
//! ## Error Categories
//!
//! - **Protocol Errors**: no reply, an explicit device rejection, or a reply
//!   that could not be classified
//! - **Process Errors**: transcoder spawn failures and unsolicited exits
//! - **Resource Errors**: a video port that stays occupied, unwritable media paths
//! - **Precondition Errors**: operations requested in the wrong session state
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use dronelink::SessionError;
//! use std::time::Duration;
//!
//! let error = SessionError::protocol_timeout("takeoff", 3, Duration::from_secs(3));
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Main error type for session operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    #[error("No valid reply to '{command}' after {attempts} attempt(s) ({elapsed:?})")]
    ProtocolTimeout { command: String, attempts: u32, elapsed: Duration },

    #[error("Device rejected '{command}': {response}")]
    ProtocolRejected { command: String, response: String },

    #[error("Invalid reply to '{command}' after {attempts} attempt(s): {response:?}")]
    MalformedResponse { command: String, response: String, attempts: u32 },

    #[error("Failed to spawn {program}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{process} process exited unexpectedly ({status})")]
    ProcessCrash { process: String, status: String },

    #[error("UDP port {port} is still in use after {attempts} attempt(s)")]
    PortUnavailable { port: u16, attempts: u32 },

    #[error("Cannot {operation}: {reason}")]
    PreconditionFailed { operation: String, reason: String },

    #[error("Timed out waiting to {operation} ({duration:?})")]
    Timeout { operation: String, duration: Duration },

    #[error("File operation failed: {path}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {context}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command: {details}")]
    InvalidCommand { details: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Session has been shut down")]
    Shutdown,
}

impl SessionError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Transport-level failures are already retried inside the command
    /// transport; a caller seeing one may still retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::ProtocolTimeout { .. } => true,
            SessionError::MalformedResponse { .. } => true,
            SessionError::PortUnavailable { .. } => true,
            SessionError::ProcessCrash { .. } => true,
            SessionError::Transport { .. } => true,
            SessionError::Timeout { .. } => true,
            SessionError::ProtocolRejected { .. } => false,
            SessionError::ProcessSpawn { .. } => false,
            SessionError::PreconditionFailed { .. } => false,
            SessionError::FileIo { .. } => false,
            SessionError::InvalidCommand { .. } => false,
            SessionError::Config { .. } => false,
            SessionError::Shutdown => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            SessionError::ProtocolTimeout { .. } => vec![
                "Check that this computer is joined to the drone's Wi-Fi network",
                "Make sure the drone is powered on and not in sleep mode",
                "Send 'command' again to re-enter SDK mode",
            ],
            SessionError::ProtocolRejected { .. } => vec![
                "Check the battery level; many commands are refused below 10%",
                "Make sure the drone is in the right flight state for this command",
                "Connect first so the drone is in SDK mode",
            ],
            SessionError::MalformedResponse { .. } => vec![
                "Retry the command",
                "Check for other applications talking to the drone",
            ],
            SessionError::ProcessSpawn { .. } => vec![
                "Install ffmpeg and make sure it is on PATH",
                "Set transcoder.program in the configuration to the ffmpeg path",
            ],
            SessionError::ProcessCrash { .. } => vec![
                "Restart the video stream",
                "Check the transcoder log output for codec errors",
            ],
            SessionError::PortUnavailable { .. } => vec![
                "Close other applications receiving drone video",
                "Terminate leftover ffmpeg processes",
                "Wait a few seconds and start the stream again",
            ],
            SessionError::PreconditionFailed { .. } => vec![
                "Start the video stream before recording or capturing photos",
                "Wait for the current operation to finish",
            ],
            SessionError::Timeout { .. } => vec![
                "Wait for the video feed to produce frames and try again",
                "Check the transcoder log output",
            ],
            SessionError::FileIo { .. } => vec![
                "Check that the media folder exists and is writable",
                "Ensure sufficient disk space",
            ],
            SessionError::Transport { .. } => vec![
                "Check that the configured ports are not used by another program",
                "Check network interface status",
            ],
            SessionError::InvalidCommand { .. } => vec![
                "Check the command argument ranges",
            ],
            SessionError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Remove the offending key to fall back to its default",
            ],
            SessionError::Shutdown => vec!["Create a new session"],
        }
    }

    /// Helper constructor for command timeouts.
    pub fn protocol_timeout(command: impl Into<String>, attempts: u32, elapsed: Duration) -> Self {
        SessionError::ProtocolTimeout { command: command.into(), attempts, elapsed }
    }

    /// Helper constructor for explicit device rejections.
    pub fn rejected(command: impl Into<String>, response: impl Into<String>) -> Self {
        SessionError::ProtocolRejected { command: command.into(), response: response.into() }
    }

    /// Helper constructor for precondition failures.
    pub fn precondition(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::PreconditionFailed { operation: operation.into(), reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::FileIo { path: path.into(), source }
    }

    /// Helper constructor for socket errors.
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        SessionError::Transport { context: context.into(), source }
    }

    /// Helper constructor for process spawn failures.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        SessionError::ProcessSpawn { program: program.into(), source }
    }

    /// Helper constructor for invalid command arguments.
    pub fn invalid_command(details: impl Into<String>) -> Self {
        SessionError::InvalidCommand { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        SessionError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::FileIo { path: PathBuf::from("<unknown>"), source: err }
    }
}
