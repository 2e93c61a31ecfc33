//! Messages exchanged with the UI bridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::TelemetrySnapshot;
use crate::SessionError;

/// Event published by the session to the UI bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// The drone acknowledged SDK mode, or telemetry resumed after a loss
    Connected,
    /// Telemetry stopped arriving
    Disconnected,
    Telemetry(Arc<TelemetrySnapshot>),
    StreamStatus { live: bool },
    /// `path` is the finished artifact when `recording` turns false
    RecordingStatus { recording: bool, path: Option<PathBuf> },
    PhotoCaptured { path: PathBuf },
    Fault { reason: String },
}

impl SessionEvent {
    /// Bridge channel this event is delivered on.
    pub fn channel(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "drone:connected",
            SessionEvent::Disconnected => "drone:disconnected",
            SessionEvent::Telemetry(_) => "drone:state-update",
            SessionEvent::StreamStatus { .. } => "drone:stream-status",
            SessionEvent::RecordingStatus { recording: true, .. } => "drone:recording-status",
            SessionEvent::RecordingStatus { recording: false, .. } => "drone:recording-stopped",
            SessionEvent::PhotoCaptured { .. } => "drone:photo-captured",
            SessionEvent::Fault { .. } => "drone:error",
        }
    }

    pub fn fault(error: &SessionError) -> Self {
        SessionEvent::Fault { reason: error.to_string() }
    }
}

/// Command accepted from the UI bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum BridgeCommand {
    Connect,
    SendRawCommand { text: String },
    ToggleStream,
    ToggleRecording,
    CapturePhoto,
    Shutdown,
}

/// Reply to a [`BridgeCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgeReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeReply {
    pub fn ok() -> Self {
        Self { success: true, ..Self::default() }
    }

    pub fn with_data(data: impl Into<String>) -> Self {
        Self { success: true, data: Some(data.into()), ..Self::default() }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { success: true, path: Some(path), ..Self::default() }
    }

    pub fn failure(error: &SessionError) -> Self {
        Self { success: false, error: Some(error.to_string()), ..Self::default() }
    }
}
