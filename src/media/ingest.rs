//! Raw H.264 ingest from the drone's video port

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::fanout::{FanOut, MemberId};
use super::hygiene::{self, PortInspector};
use crate::config::VideoConfig;
use crate::{Result, SessionError};

/// Largest datagram the drone sends, with headroom.
const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Owns the bound video socket and forwards every datagram to the
/// registered consumers.
///
/// Consumers come and go while the feed runs; a consumer that falls behind
/// loses datagrams without stalling the others. The socket is released when
/// the ingest is shut down or dropped.
#[derive(Debug)]
pub struct VideoIngest {
    consumers: Arc<FanOut>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl VideoIngest {
    /// Bind `port` (reclaiming it if a stale transcoder holds it) and start forwarding.
    pub async fn start(
        port: u16,
        config: &VideoConfig,
        program: &str,
        inspector: &dyn PortInspector,
    ) -> Result<Self> {
        let socket = hygiene::bind_video_socket(
            port,
            program,
            inspector,
            config.bind_attempts,
            config.bind_backoff(),
        )
        .await?;
        let local_addr =
            socket.local_addr().map_err(|e| SessionError::transport("video socket address", e))?;

        let consumers = Arc::new(FanOut::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(socket, Arc::clone(&consumers), cancel.clone()));

        info!(%local_addr, "Video ingest started");
        Ok(Self { consumers, local_addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a consumer with room for `capacity` queued datagrams.
    pub fn register(&self, capacity: usize) -> (MemberId, mpsc::Receiver<Bytes>) {
        self.consumers.join(capacity)
    }

    pub(crate) fn consumers(&self) -> Arc<FanOut> {
        Arc::clone(&self.consumers)
    }

    /// Remove a consumer; its receiver ends once drained.
    pub fn deregister(&self, id: MemberId) -> bool {
        self.consumers.leave(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Stop forwarding and release the port.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.consumers.clear();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Video ingest task ended abnormally");
        }
        info!(local_addr = %self.local_addr, "Video ingest released");
    }
}

impl Drop for VideoIngest {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward(socket: UdpSocket, consumers: Arc<FanOut>, cancel: CancellationToken) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    let mut datagrams: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, _)) => {
                datagrams += 1;
                if consumers.is_empty() {
                    continue;
                }
                let delivery = consumers.send(&Bytes::copy_from_slice(&buf[..len]));
                if delivery.skipped > 0 {
                    skipped += delivery.skipped as u64;
                    trace!(skipped = delivery.skipped, "Slow video consumer missed a datagram");
                }
            }
            // ICMP port-unreachable surfaces here on some platforms
            Err(e) => warn!(error = %e, "Video receive failed"),
        }
    }

    consumers.clear();
    info!(datagrams, skipped, "Video ingest stopped");
}
