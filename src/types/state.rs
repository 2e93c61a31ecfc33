//! Lifecycle states of the media sessions

use serde::{Deserialize, Serialize};

/// State of the live video pipeline.
///
/// ```text
/// Idle ──start──▶ Starting ──spawned──▶ Live ──stop──▶ Stopping ──exited──▶ Idle
///   ▲                 │                   │
///   │              failure           unsolicited exit
///   │                 ▼                   ▼
///   └────stop/start── Failed ◀────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Live,
    Stopping,
    Failed,
}

impl StreamState {
    pub fn is_live(&self) -> bool {
        matches!(self, StreamState::Live)
    }

    /// Whether `start_stream` may leave this state.
    pub fn can_start(&self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Failed)
    }
}

/// State of the recording branch. Anything but `Idle` implies a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Stopping,
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecordingState::Recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_and_failed_can_start() {
        assert!(StreamState::Idle.can_start());
        assert!(StreamState::Failed.can_start());
        assert!(!StreamState::Starting.can_start());
        assert!(!StreamState::Live.can_start());
        assert!(!StreamState::Stopping.can_start());
    }
}
