//! Telemetry ingestion: datagram sources, the decoder and the driver task.

mod decoder;
mod driver;
mod source;

pub use decoder::TelemetryDecoder;
pub use driver::{TelemetryChannels, TelemetryDriver};
pub use source::{TelemetrySource, UdpTelemetrySource};
