//! Sources of raw telemetry datagrams

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::{Result, SessionError};

const DATAGRAM_BUFFER: usize = 2048;

/// Trait for telemetry datagram sources
///
/// The driver owns the source and pulls datagrams one at a time. Returning
/// `Ok(None)` ends the telemetry stream; errors are counted and backed off.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Wait for the next raw state datagram.
    async fn next_datagram(&mut self) -> Result<Option<Bytes>>;
}

/// State datagrams pushed by the drone to a local UDP port
pub struct UdpTelemetrySource {
    socket: UdpSocket,
    buf: Box<[u8]>,
}

impl UdpTelemetrySource {
    /// Bind the telemetry port on all interfaces. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| SessionError::transport(format!("bind telemetry port {port}"), e))?;
        let source = Self::from_socket(socket);
        info!(addr = %source.local_addr()?, "Listening for telemetry");
        Ok(source)
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket, buf: vec![0u8; DATAGRAM_BUFFER].into_boxed_slice() }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|e| SessionError::transport("telemetry socket address", e))
    }
}

#[async_trait::async_trait]
impl TelemetrySource for UdpTelemetrySource {
    async fn next_datagram(&mut self) -> Result<Option<Bytes>> {
        let (len, from) = self
            .socket
            .recv_from(&mut self.buf)
            .await
            .map_err(|e| SessionError::transport("receive telemetry", e))?;
        trace!(%from, len, "Telemetry datagram");
        Ok(Some(Bytes::copy_from_slice(&self.buf[..len])))
    }
}
