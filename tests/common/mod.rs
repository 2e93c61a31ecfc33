//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use dronelink::SessionEvent;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Loopback stand-in for the drone's command port.
///
/// Every datagram is logged and answered with whatever `respond` returns for
/// it, given the text and how many datagrams have arrived so far.
pub struct FakeDevice {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeDevice {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&str, usize) -> Option<String> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else { break };
                let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                let count = {
                    let mut log = log.lock().unwrap();
                    log.push(text.clone());
                    log.len()
                };
                if let Some(reply) = respond(&text, count) {
                    let _ = socket.send_to(reply.as_bytes(), from).await;
                }
            }
        });

        Self { addr, received }
    }

    /// A device that accepts everything.
    pub async fn agreeable() -> Self {
        Self::start(|_, _| Some("ok".to_string())).await
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Next non-telemetry event, failing the test after five seconds.
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed");
        if !matches!(event, SessionEvent::Telemetry(_)) {
            return event;
        }
    }
}
