//! Device session layer for small Wi-Fi quadcopters.
//!
//! dronelink talks to a drone over its three UDP channels and turns them into
//! something a UI can drive safely:
//!
//! - **Commands**: a half-duplex text protocol made into a retryable,
//!   timeout-bounded call ([`CommandTransport`])
//! - **Telemetry**: the pushed state datagram decoded into typed, rate-limited
//!   snapshots ([`TelemetryDecoder`])
//! - **Video**: raw H.264 ingested, transcoded for local viewers, optionally
//!   recorded and captured as photos, with the transcoder processes supervised
//!   ([`StreamSupervisor`])
//!
//! A [`Session`] owns all of it and reports state changes as
//! [`SessionEvent`]s.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dronelink::{Session, SessionConfig, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::start(SessionConfig::default()).await?;
//!     session.connect().await?;
//!
//!     let mut telemetry = session.telemetry(UpdateRate::Max(5));
//!     while let Some(snapshot) = telemetry.next().await {
//!         println!("battery {}% height {}cm", snapshot.bat, snapshot.h);
//!     }
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
mod error;
pub mod media;
mod session;
pub mod stream;
pub mod telemetry;
pub mod types;

pub use command::{CommandTransport, DroneCommand, Reply};
pub use config::SessionConfig;
pub use error::*;
pub use media::{MediaStore, StreamSupervisor};
pub use session::{Session, SessionBuilder};
pub use telemetry::TelemetryDecoder;
pub use types::*;
