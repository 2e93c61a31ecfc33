//! Live stream fan-out to local viewers over WebSocket
//!
//! Browser players (JSMpeg) connect to `ws://<viewer bind>/` and receive the
//! MPEG-TS output as binary frames.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::serve::ListenerExt;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::fanout::{Delivery, FanOut};
use crate::{Result, SessionError};

/// Sends every transcoded chunk to all connected viewers.
///
/// Each viewer has its own bounded queue and writer task; a viewer that
/// cannot keep up misses chunks, and a viewer whose socket fails is dropped.
/// Neither affects the other viewers or the transcoder.
#[derive(Debug)]
pub struct Broadcaster {
    viewers: FanOut,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self { viewers: FanOut::new(), buffer }
    }

    /// Bind the viewer listener.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::transport(format!("bind viewer server on {addr}"), e))
    }

    /// Serve WebSocket viewers on `listener` until `cancel` fires.
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let app = Router::new()
            .route("/", get(upgrade_viewer))
            .fallback(upgrade_viewer)
            .with_state(Arc::clone(self));
        let listener = listener.tap_io(|tcp| {
            if let Err(e) = tcp.set_nodelay(true) {
                debug!(error = %e, "Could not disable Nagle for viewer");
            }
        });

        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = {
                let broadcaster = Arc::clone(&broadcaster);
                async move {
                    cancel.cancelled().await;
                    broadcaster.disconnect_all();
                }
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!(error = %e, "Viewer server failed");
            }
            broadcaster.disconnect_all();
            info!("Viewer server stopped");
        })
    }

    /// Offer a chunk to every viewer.
    pub fn broadcast(&self, chunk: &Bytes) -> Delivery {
        self.viewers.send(chunk)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Drop every viewer; their connections close once queued chunks are written.
    pub fn disconnect_all(&self) {
        self.viewers.clear();
    }
}

async fn upgrade_viewer(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_viewer(broadcaster, socket))
}

/// Forward queued chunks as binary frames until either side goes away.
async fn serve_viewer(broadcaster: Arc<Broadcaster>, socket: WebSocket) {
    let (id, mut chunks) = broadcaster.viewers.join(broadcaster.buffer);
    info!(viewer = ?id, viewers = broadcaster.viewer_count(), "Viewer connected");

    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send(Message::Binary(chunk)).await {
                        debug!(viewer = ?id, error = %e, "Viewer write failed");
                        break;
                    }
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(viewer = ?id, error = %e, "Viewer read failed");
                    break;
                }
                // Viewers only listen; pings are answered by the protocol layer
                Some(Ok(_)) => {}
            },
        }
    }

    broadcaster.viewers.leave(id);
    let _ = sink.close().await;
    info!(viewer = ?id, "Viewer disconnected");
}
