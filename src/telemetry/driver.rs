//! Driver spawns and manages the telemetry task

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::decoder::TelemetryDecoder;
use super::source::TelemetrySource;
use crate::types::{SessionEvent, TelemetrySnapshot};

const MAX_ERRORS: u32 = 10;

/// Result of spawning the telemetry driver
pub struct TelemetryChannels {
    /// Latest accepted snapshot
    pub snapshots: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

/// Runs the telemetry pipeline independently of commands and video.
///
/// Decoding failures never leave this task: the worst outcome of bad input is
/// a stale snapshot. A silent link is reported through `Disconnected`.
pub struct TelemetryDriver;

impl TelemetryDriver {
    pub fn spawn<S>(
        source: S,
        decoder: TelemetryDecoder,
        events: broadcast::Sender<SessionEvent>,
        link_timeout: Duration,
    ) -> TelemetryChannels
    where
        S: TelemetrySource,
    {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            Self::run(source, decoder, snapshot_tx, events, link_timeout, cancel_task).await;
        });

        TelemetryChannels { snapshots: snapshot_rx, cancel }
    }

    async fn run<S>(
        mut source: S,
        mut decoder: TelemetryDecoder,
        snapshot_tx: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
        events: broadcast::Sender<SessionEvent>,
        link_timeout: Duration,
        cancel: CancellationToken,
    ) where
        S: TelemetrySource,
    {
        info!("Telemetry driver started");
        let mut datagrams = 0u64;
        let mut published = 0u64;
        let mut error_count = 0u32;
        let mut link_alive = false;
        let mut link_lost = false;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Telemetry driver cancelled");
                    break;
                }
                result = tokio::time::timeout(link_timeout, source.next_datagram()) => result,
            };

            match result {
                Err(_) => {
                    if link_alive {
                        warn!(?link_timeout, "No telemetry received, link lost");
                        link_alive = false;
                        link_lost = true;
                        let _ = events.send(SessionEvent::Disconnected);
                    }
                }
                Ok(Ok(Some(datagram))) => {
                    datagrams += 1;
                    error_count = 0;

                    if !link_alive {
                        link_alive = true;
                        if link_lost {
                            info!("Telemetry resumed");
                            link_lost = false;
                            let _ = events.send(SessionEvent::Connected);
                        } else {
                            debug!("First telemetry datagram received");
                        }
                    }

                    if let Some(snapshot) = decoder.decode(&datagram) {
                        published += 1;
                        snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
                        let _ = events.send(SessionEvent::Telemetry(snapshot));
                    }
                }
                Ok(Ok(None)) => {
                    info!("Telemetry source ended after {} datagrams", datagrams);
                    break;
                }
                Ok(Err(e)) => {
                    error_count += 1;
                    error!("Telemetry source error ({}/{}): {}", error_count, MAX_ERRORS, e);

                    if error_count >= MAX_ERRORS {
                        error!("Too many telemetry errors, stopping driver");
                        break;
                    }

                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(datagrams, published, "Telemetry driver ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct ChannelSource(mpsc::Receiver<Bytes>);

    #[async_trait::async_trait]
    impl TelemetrySource for ChannelSource {
        async fn next_datagram(&mut self) -> Result<Option<Bytes>> {
            Ok(self.0.recv().await)
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn publishes_decoded_snapshots() {
        let (tx, rx) = mpsc::channel(8);
        let (events, mut event_rx) = broadcast::channel(16);
        let channels = TelemetryDriver::spawn(
            ChannelSource(rx),
            TelemetryDecoder::new(Duration::from_millis(100)),
            events,
            Duration::from_secs(5),
        );

        tx.send(Bytes::from_static(b"bat:85;h:120;time:42;")).await.unwrap();

        match next_event(&mut event_rx).await {
            SessionEvent::Telemetry(snapshot) => {
                assert_eq!(snapshot.bat, 85);
                assert_eq!(snapshot.h, 120);
                assert_eq!(snapshot.time, 42);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let latest = channels.snapshots.borrow().clone().expect("snapshot stored");
        assert_eq!(latest.bat, 85);
        channels.cancel.cancel();
    }

    #[tokio::test]
    async fn silent_link_is_reported_and_recovers() {
        let (tx, rx) = mpsc::channel(8);
        let (events, mut event_rx) = broadcast::channel(16);
        let channels = TelemetryDriver::spawn(
            ChannelSource(rx),
            TelemetryDecoder::new(Duration::from_millis(1)),
            events,
            Duration::from_millis(50),
        );

        tx.send(Bytes::from_static(b"bat:80;")).await.unwrap();
        assert!(matches!(next_event(&mut event_rx).await, SessionEvent::Telemetry(_)));
        assert_eq!(next_event(&mut event_rx).await, SessionEvent::Disconnected);

        tx.send(Bytes::from_static(b"bat:79;")).await.unwrap();
        assert_eq!(next_event(&mut event_rx).await, SessionEvent::Connected);
        assert!(matches!(next_event(&mut event_rx).await, SessionEvent::Telemetry(_)));
        channels.cancel.cancel();
    }

    #[tokio::test]
    async fn garbage_is_never_published() {
        let (tx, rx) = mpsc::channel(8);
        let (events, mut event_rx) = broadcast::channel(16);
        let channels = TelemetryDriver::spawn(
            ChannelSource(rx),
            TelemetryDecoder::new(Duration::from_millis(100)),
            events,
            Duration::from_secs(5),
        );

        tx.send(Bytes::from_static(b"\xff\xfe;;")).await.unwrap();
        tx.send(Bytes::from_static(b"bat:50;")).await.unwrap();

        match next_event(&mut event_rx).await {
            SessionEvent::Telemetry(snapshot) => assert_eq!(snapshot.bat, 50),
            other => panic!("unexpected event {other:?}"),
        }
        channels.cancel.cancel();
    }
}
