//! Core types shared across the session layer.
//!
//! - [`TelemetrySnapshot`] is the typed view of the drone's state datagram
//! - [`UpdateRate`] controls how often telemetry subscribers are woken
//! - [`StreamState`] and [`RecordingState`] are the media state machines' states
//! - [`SessionEvent`], [`BridgeCommand`] and [`BridgeReply`] form the UI bridge contract

mod event;
mod state;
mod telemetry;
mod update_rate;

pub use event::{BridgeCommand, BridgeReply, SessionEvent};
pub use state::{RecordingState, StreamState};
pub use telemetry::{FieldKind, TELEMETRY_FIELDS, TelemetrySnapshot, field_kind};
pub use update_rate::UpdateRate;
