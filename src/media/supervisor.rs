//! Live stream supervision
//!
//! The supervisor owns the live pipeline: the video ingest, the live
//! transcoder feeding the viewer broadcaster, and the recording branch that
//! hangs off the same ingest. It is the only place that changes
//! [`StreamState`].
//!
//! Lock order is stream slot first, recording slot second. Stopping the
//! stream therefore always finishes the recording (and publishes its
//! stopped event) before the stream itself reports stopped.

use bytes::Bytes;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::broadcaster::Broadcaster;
use super::fanout::MemberId;
use super::hygiene::PortInspector;
use super::ingest::VideoIngest;
use super::photo;
use super::recording::RecordingBranch;
use super::transcoder::{self, ExitReport, TranscoderLauncher};
use crate::config::SessionConfig;
use crate::types::{RecordingState, SessionEvent, StreamState};
use crate::{Result, SessionError};

/// Read size for the transcoder's output; a multiple of the 188-byte TS packet.
const OUTPUT_CHUNK: usize = 188 * 64;

enum Slot {
    Idle,
    Starting,
    Live(ActiveStream),
    Stopping,
    Failed,
}

struct ActiveStream {
    generation: u64,
    ingest: VideoIngest,
    consumer: MemberId,
    stop: CancellationToken,
    exit: JoinHandle<ExitReport>,
    output: JoinHandle<()>,
}

/// Owns the live pipeline and its recording branch.
pub struct StreamSupervisor {
    config: Arc<SessionConfig>,
    launcher: Arc<dyn TranscoderLauncher>,
    inspector: Arc<dyn PortInspector>,
    broadcaster: Arc<Broadcaster>,
    recording: Arc<RecordingBranch>,
    events: broadcast::Sender<SessionEvent>,
    slot: Mutex<Slot>,
    state: watch::Sender<StreamState>,
    still_frame: PathBuf,
    generation: AtomicU64,
}

impl StreamSupervisor {
    pub fn new(
        config: Arc<SessionConfig>,
        launcher: Arc<dyn TranscoderLauncher>,
        inspector: Arc<dyn PortInspector>,
        broadcaster: Arc<Broadcaster>,
        events: broadcast::Sender<SessionEvent>,
        still_frame: PathBuf,
    ) -> Self {
        let recording = Arc::new(RecordingBranch::new(
            Arc::clone(&launcher),
            config.recording.stop_grace(),
            config.video.consumer_buffer,
            events.clone(),
        ));
        Self {
            config,
            launcher,
            inspector,
            broadcaster,
            recording,
            events,
            slot: Mutex::new(Slot::Idle),
            state: watch::Sender::new(StreamState::Idle),
            still_frame,
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recording.state()
    }

    pub fn still_frame(&self) -> &Path {
        &self.still_frame
    }

    /// Address of the bound video socket while the stream is live.
    pub async fn video_addr(&self) -> Option<SocketAddr> {
        match &*self.slot.lock().await {
            Slot::Live(active) => Some(active.ingest.local_addr()),
            _ => None,
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.broadcaster.viewer_count()
    }

    /// Bind the video port, spawn the live transcoder and start serving viewers.
    ///
    /// Allowed from `Idle` and `Failed`. Any failure leaves the stream in
    /// `Failed` with the video port released.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let current = self.state();
        if !current.can_start() {
            warn!(state = ?current, "Stream start ignored");
            return Err(SessionError::precondition(
                "start stream",
                format!("stream is already {current:?}").to_lowercase(),
            ));
        }

        *slot = Slot::Starting;
        self.state.send_replace(StreamState::Starting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Starting stream");

        match tokio::fs::remove_file(&self.still_frame).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.still_frame.display(), error = %e, "Could not remove stale still frame"),
        }

        let ingest = match VideoIngest::start(
            self.config.device.video_port,
            &self.config.video,
            self.launcher.program(),
            self.inspector.as_ref(),
        )
        .await
        {
            Ok(ingest) => ingest,
            Err(e) => {
                self.fail_start(&mut slot, &e);
                return Err(e);
            }
        };

        let process = match transcoder::spawn(
            self.launcher.live(&self.still_frame),
            "stream",
            self.launcher.program(),
            true,
        ) {
            Ok(process) => process,
            Err(e) => {
                ingest.shutdown().await;
                self.fail_start(&mut slot, &e);
                return Err(e);
            }
        };

        let (consumer, chunks) = ingest.register(self.config.video.consumer_buffer);
        tokio::spawn(transcoder::feed_stdin(chunks, process.stdin, "stream"));
        let output = match process.stdout {
            Some(stdout) => tokio::spawn(pump_output(stdout, Arc::clone(&self.broadcaster))),
            None => tokio::spawn(async {}),
        };

        let stop = CancellationToken::new();
        let exit = tokio::spawn(monitor(
            Arc::downgrade(self),
            generation,
            process.child,
            stop.clone(),
            self.config.transcoder.stop_grace(),
        ));

        *slot = Slot::Live(ActiveStream { generation, ingest, consumer, stop, exit, output });
        self.state.send_replace(StreamState::Live);
        info!(generation, "Stream live");
        let _ = self.events.send(SessionEvent::StreamStatus { live: true });
        Ok(())
    }

    /// Stop the live pipeline, finishing any recording first.
    ///
    /// From `Failed` this only acknowledges the fault and returns to `Idle`.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let active = match std::mem::replace(&mut *slot, Slot::Stopping) {
            Slot::Live(active) => active,
            Slot::Failed => {
                *slot = Slot::Idle;
                self.state.send_replace(StreamState::Idle);
                info!("Stream fault cleared");
                return Ok(());
            }
            other => {
                *slot = other;
                let current = self.state();
                return Err(SessionError::precondition(
                    "stop stream",
                    format!("stream is {current:?}").to_lowercase(),
                ));
            }
        };
        self.state.send_replace(StreamState::Stopping);
        info!(generation = active.generation, "Stopping stream");

        self.recording.stop_if_active().await;

        active.stop.cancel();
        active.ingest.deregister(active.consumer);
        match active.exit.await {
            Ok(report) if report.requested => {
                info!(status = %report.describe(), "Live transcoder exited")
            }
            Ok(report) => warn!(status = %report.describe(), "Live transcoder exited before stop"),
            Err(e) => error!(error = %e, "Live transcoder monitor failed"),
        }
        active.ingest.shutdown().await;
        active.output.abort();

        *slot = Slot::Idle;
        self.state.send_replace(StreamState::Idle);
        let _ = self.events.send(SessionEvent::StreamStatus { live: false });
        Ok(())
    }

    /// Start recording the raw feed to `path`. Requires a live stream.
    pub async fn start_recording(&self, path: PathBuf) -> Result<PathBuf> {
        let slot = self.slot.lock().await;
        let Slot::Live(active) = &*slot else {
            return Err(SessionError::precondition("start recording", "stream is not live"));
        };
        self.recording.start(&active.ingest, path).await
    }

    /// Stop the active recording and return the finished file.
    pub async fn stop_recording(&self) -> Result<PathBuf> {
        self.recording.stop().await
    }

    /// Copy the live still frame to `destination`. Requires a live stream.
    pub async fn capture_photo(&self, destination: PathBuf) -> Result<PathBuf> {
        if !self.state().is_live() {
            return Err(SessionError::precondition("capture photo", "stream is not live"));
        }
        let path = photo::capture_still(&self.still_frame, &destination, &self.config.photo).await?;
        let _ = self.events.send(SessionEvent::PhotoCaptured { path: path.clone() });
        Ok(path)
    }

    /// Stop whatever is running. Never fails.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(SessionError::PreconditionFailed { .. }) => {}
            Err(e) => warn!(error = %e, "Stream did not stop cleanly"),
        }
        self.broadcaster.disconnect_all();
    }

    fn fail_start(&self, slot: &mut Slot, error: &SessionError) {
        error!(%error, "Stream failed to start");
        *slot = Slot::Failed;
        self.state.send_replace(StreamState::Failed);
        let _ = self.events.send(SessionEvent::StreamStatus { live: false });
    }

    /// Tear down after the live transcoder exited without being asked to.
    async fn on_crash(&self, generation: u64, report: ExitReport) {
        let mut slot = self.slot.lock().await;
        let active = match std::mem::replace(&mut *slot, Slot::Failed) {
            Slot::Live(active) if active.generation == generation => active,
            other => {
                *slot = other;
                return;
            }
        };

        let error =
            SessionError::ProcessCrash { process: "stream".to_string(), status: report.describe() };
        error!(generation, %error, "Live transcoder crashed");

        self.recording.stop_if_active().await;
        active.ingest.shutdown().await;
        active.output.abort();

        self.state.send_replace(StreamState::Failed);
        let _ = self.events.send(SessionEvent::fault(&error));
        let _ = self.events.send(SessionEvent::StreamStatus { live: false });
    }
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("state", &*self.state.borrow())
            .field("recording", &self.recording)
            .field("still_frame", &self.still_frame)
            .finish()
    }
}

async fn monitor(
    supervisor: Weak<StreamSupervisor>,
    generation: u64,
    child: Child,
    stop: CancellationToken,
    grace: Duration,
) -> ExitReport {
    let report = transcoder::supervise(child, stop, grace, "stream").await;
    if !report.requested {
        if let Some(supervisor) = supervisor.upgrade() {
            // The stop path awaits this task, so the teardown runs on its own
            tokio::spawn(async move { supervisor.on_crash(generation, report).await });
        }
    }
    report
}

async fn pump_output(mut stdout: ChildStdout, broadcaster: Arc<Broadcaster>) {
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    let mut total: u64 = 0;
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                broadcaster.broadcast(&Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!(error = %e, "Live transcoder output failed");
                break;
            }
        }
    }
    info!(bytes = total, "Live transcoder output ended");
}
