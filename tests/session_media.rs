//! Session-level media behaviour with shell stand-ins for the transcoder.

#![cfg(unix)]

mod common;

use common::{FakeDevice, init_tracing, next_event};
use dronelink::media::{PortHolder, PortInspector, TranscoderLauncher};
use dronelink::{
    BridgeCommand, RecordingState, Session, SessionConfig, SessionError, SessionEvent, StreamState,
    UpdateRate,
};
use futures::StreamExt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Runs `sh -c <script> sh <path>` for both transcoder roles and counts spawns.
struct ShellLauncher {
    live: &'static str,
    recording: &'static str,
    spawned: Arc<AtomicUsize>,
}

impl ShellLauncher {
    fn new(live: &'static str) -> (Self, Arc<AtomicUsize>) {
        let spawned = Arc::new(AtomicUsize::new(0));
        let launcher =
            Self { live, recording: r#"exec cat > "$1""#, spawned: Arc::clone(&spawned) };
        (launcher, spawned)
    }

    fn command(&self, script: &str, path: &Path) -> Command {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).arg("sh").arg(path);
        command
    }
}

impl TranscoderLauncher for ShellLauncher {
    fn program(&self) -> &str {
        "sh"
    }

    fn live(&self, still_frame: &Path) -> Command {
        self.command(self.live, still_frame)
    }

    fn recording(&self, destination: &Path) -> Command {
        self.command(self.recording, destination)
    }
}

struct NoHolders;

#[async_trait::async_trait]
impl PortInspector for NoHolders {
    async fn udp_holders(&self, _port: u16) -> io::Result<Vec<PortHolder>> {
        Ok(Vec::new())
    }

    async fn terminate(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Echoes the feed to viewers and keeps a populated still frame.
const ECHO_WITH_STILL: &str = r#"printf 'jpeg' > "$1"; exec cat"#;

fn test_config(device: &FakeDevice, media: &TempDir) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.device.address = device.addr.ip();
    config.device.command_port = device.addr.port();
    config.device.telemetry_port = 0;
    config.device.video_port = 0;
    config.command.retry_delay_ms = 200;
    config.viewer.bind = "127.0.0.1:0".parse().unwrap();
    config.photo.poll_attempts = 5;
    config.photo.poll_interval_ms = 20;
    config.transcoder.stop_grace_ms = 2000;
    config.recording.stop_grace_ms = 2000;
    config.media_root = media.path().join("media");
    config
}

async fn start_session(device: &FakeDevice, media: &TempDir, live: &'static str) -> (Session, Arc<AtomicUsize>) {
    init_tracing();
    let (launcher, spawned) = ShellLauncher::new(live);
    let session = Session::builder(test_config(device, media))
        .launcher(launcher)
        .inspector(NoHolders)
        .start()
        .await
        .expect("session starts");
    (session, spawned)
}

async fn send_video(session: &Session, payload: &[u8]) {
    let port = session.video_addr().await.expect("stream is live").port();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(payload, ("127.0.0.1", port)).await.unwrap();
}

async fn wait_for_state(session: &Session, wanted: StreamState) {
    let mut states = session.watch_stream_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| *state == wanted))
        .await
        .expect("timed out waiting for stream state")
        .expect("state channel closed");
}

#[tokio::test]
async fn recording_without_live_stream_fails_and_spawns_nothing() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, spawned) = start_session(&device, &media, ECHO_WITH_STILL).await;
    let mut events = session.events();

    let err = session.start_recording().await.unwrap_err();

    assert!(matches!(err, SessionError::PreconditionFailed { .. }), "{err}");
    assert_eq!(spawned.load(Ordering::SeqCst), 0);
    assert_eq!(session.recording_state(), RecordingState::Idle);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Fault { .. }));
}

#[tokio::test]
async fn stream_toggle_drives_device_and_viewers() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;

    assert!(session.toggle_stream().await.expect("stream on"));
    assert_eq!(session.stream_state(), StreamState::Live);
    assert!(device.received().contains(&"streamon".to_string()));

    let (mut viewer, _) = connect_async(format!("ws://{}/", session.viewer_addr())).await.unwrap();
    for _ in 0..100 {
        if session.viewer_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.viewer_count(), 1);

    send_video(&session, b"h264-nal").await;
    let frame = tokio::time::timeout(Duration::from_secs(5), viewer.next())
        .await
        .expect("viewer received the stream")
        .expect("viewer socket open")
        .unwrap();
    assert!(matches!(frame, Message::Binary(_)), "{frame:?}");
    assert_eq!(&frame.into_data()[..], b"h264-nal");

    assert!(!session.toggle_stream().await.expect("stream off"));
    assert_eq!(session.stream_state(), StreamState::Idle);
    assert_eq!(device.received().last().map(String::as_str), Some("streamoff"));
    assert!(session.video_addr().await.is_none());
}

#[tokio::test]
async fn stopping_stream_finishes_recording_first() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, spawned) = start_session(&device, &media, ECHO_WITH_STILL).await;

    session.start_stream().await.unwrap();
    let path = session.start_recording().await.expect("recording starts");
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
    assert_eq!(session.recording_state(), RecordingState::Recording);
    assert!(path.starts_with(session.media().recordings_dir()));

    send_video(&session, b"frame-data").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut events = session.events();
    session.stop_stream().await.unwrap();

    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    assert_eq!(first, SessionEvent::RecordingStatus { recording: false, path: Some(path.clone()) });
    assert_eq!(second, SessionEvent::StreamStatus { live: false });

    assert_eq!(session.recording_state(), RecordingState::Idle);
    assert_eq!(std::fs::read(&path).unwrap(), b"frame-data");
}

#[tokio::test]
async fn recording_toggle_returns_finished_file() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;
    session.start_stream().await.unwrap();

    let started = session.dispatch(BridgeCommand::ToggleRecording).await;
    assert!(started.success, "{started:?}");
    let again = session.start_recording().await.unwrap_err();
    assert!(matches!(again, SessionError::PreconditionFailed { .. }));

    let stopped = session.dispatch(BridgeCommand::ToggleRecording).await;
    assert!(stopped.success, "{stopped:?}");
    assert_eq!(stopped.path, started.path);
    assert_eq!(session.stream_state(), StreamState::Live);

    session.shutdown().await;
}

#[tokio::test]
async fn transcoder_crash_fails_the_stream() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, "sleep 0.3; exit 3").await;
    let mut events = session.events();

    session.start_stream().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::StreamStatus { live: true });

    wait_for_state(&session, StreamState::Failed).await;
    match next_event(&mut events).await {
        SessionEvent::Fault { reason } => assert!(reason.contains("exited unexpectedly"), "{reason}"),
        other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::StreamStatus { live: false });

    // Stopping a failed stream acknowledges the fault
    session.stop_stream().await.unwrap();
    assert_eq!(session.stream_state(), StreamState::Idle);
}

#[tokio::test]
async fn transcoder_crash_stops_the_recording_first() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, "sleep 1; exit 3").await;

    session.start_stream().await.unwrap();
    let path = session.start_recording().await.expect("recording starts");
    let mut events = session.events();

    wait_for_state(&session, StreamState::Failed).await;
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::RecordingStatus { recording: false, path: Some(path) }
    );
    assert!(matches!(next_event(&mut events).await, SessionEvent::Fault { .. }));
    assert_eq!(next_event(&mut events).await, SessionEvent::StreamStatus { live: false });
    assert_eq!(session.recording_state(), RecordingState::Idle);
    assert_eq!(session.stream_state(), StreamState::Failed);
}

#[tokio::test]
async fn concurrent_toggles_alternate() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, spawned) = start_session(&device, &media, ECHO_WITH_STILL).await;

    let (first, second) = tokio::join!(session.toggle_stream(), session.toggle_stream());

    let mut outcomes = vec![first.expect("first toggle"), second.expect("second toggle")];
    outcomes.sort();
    assert_eq!(outcomes, vec![false, true]);
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(session.stream_state(), StreamState::Idle);
}

#[tokio::test]
async fn photo_copies_the_still_frame() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;
    session.start_stream().await.unwrap();
    let mut events = session.events();

    let path = session.capture_photo().await.expect("photo");

    assert!(path.starts_with(session.media().photos_dir()));
    assert_eq!(std::fs::read(&path).unwrap(), b"jpeg");
    assert_eq!(next_event(&mut events).await, SessionEvent::PhotoCaptured { path });
}

#[tokio::test]
async fn empty_still_frame_times_out_without_writing() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, r#": > "$1"; exec cat"#).await;
    session.start_stream().await.unwrap();

    let err = session.capture_photo().await.unwrap_err();

    assert!(matches!(err, SessionError::Timeout { .. }), "{err}");
    let photos = std::fs::read_dir(session.media().photos_dir()).unwrap().count();
    assert_eq!(photos, 0);
}

#[tokio::test]
async fn photo_requires_live_stream() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;

    let reply = session.dispatch(BridgeCommand::CapturePhoto).await;

    assert!(!reply.success);
    assert!(reply.error.unwrap().contains("stream is not live"));
}

#[tokio::test]
async fn refused_streamon_reverts_the_stream() {
    let device = FakeDevice::start(|text, _| {
        Some(if text == "streamon" { "error".to_string() } else { "ok".to_string() })
    })
    .await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;
    let mut events = session.events();

    let err = session.start_stream().await.unwrap_err();

    assert!(matches!(err, SessionError::ProtocolRejected { .. }), "{err}");
    assert_eq!(session.stream_state(), StreamState::Idle);
    assert_eq!(next_event(&mut events).await, SessionEvent::StreamStatus { live: true });
    assert_eq!(next_event(&mut events).await, SessionEvent::StreamStatus { live: false });
    assert!(matches!(next_event(&mut events).await, SessionEvent::Fault { .. }));
}

#[tokio::test]
async fn second_start_is_rejected_while_live() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, spawned) = start_session(&device, &media, ECHO_WITH_STILL).await;

    session.start_stream().await.unwrap();
    let err = session.start_stream().await.unwrap_err();

    assert!(matches!(err, SessionError::PreconditionFailed { .. }), "{err}");
    assert_eq!(spawned.load(Ordering::SeqCst), 1);
    assert_eq!(session.stream_state(), StreamState::Live);
}

#[tokio::test]
async fn bridge_commands_and_shutdown() {
    let device = FakeDevice::start(|text, _| {
        Some(if text == "battery?" { "55".to_string() } else { "ok".to_string() })
    })
    .await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;
    let mut events = session.events();

    let reply = session.dispatch(BridgeCommand::Connect).await;
    assert!(reply.success);
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    let reply =
        session.dispatch(BridgeCommand::SendRawCommand { text: "battery?".into() }).await;
    assert_eq!(reply.data.as_deref(), Some("55"));

    session.start_stream().await.unwrap();
    let reply = session.dispatch(BridgeCommand::Shutdown).await;
    assert!(reply.success);
    assert!(session.is_shut_down());
    assert_eq!(session.stream_state(), StreamState::Idle);

    let err = session.command("land").await.unwrap_err();
    assert!(matches!(err, SessionError::Shutdown));
}

#[tokio::test]
async fn telemetry_reaches_subscribers() {
    let device = FakeDevice::agreeable().await;
    let media = tempfile::tempdir().unwrap();
    let (session, _) = start_session(&device, &media, ECHO_WITH_STILL).await;
    let mut telemetry = Box::pin(session.telemetry(UpdateRate::Native));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = session.telemetry_addr().port();
    socket.send_to(b"bat:85;h:120;time:42;", ("127.0.0.1", port)).await.unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), telemetry.next())
        .await
        .expect("snapshot arrives")
        .expect("stream open");
    assert_eq!(snapshot.bat, 85);
    assert_eq!(snapshot.h, 120);
    assert_eq!(snapshot.time, 42);
    assert!(snapshot.observed_at.is_some());
    assert_eq!(session.current_telemetry().map(|s| s.bat), Some(85));
}
