//! Recording branch: a second consumer of the raw feed, muxed to a file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::fanout::{FanOut, MemberId};
use super::ingest::VideoIngest;
use super::transcoder::{self, ExitReport, TranscoderLauncher};
use crate::types::{RecordingState, SessionEvent};
use crate::{Result, SessionError};

enum Slot {
    Idle,
    Recording(ActiveRecording),
    Stopping,
}

struct ActiveRecording {
    generation: u64,
    path: PathBuf,
    consumer: MemberId,
    feed: Arc<FanOut>,
    stop: CancellationToken,
    exit: JoinHandle<ExitReport>,
}

/// Owns at most one recording process.
///
/// Starting and stopping are serialized on the slot lock. Callers that also
/// hold the stream lock must take it first.
pub struct RecordingBranch {
    launcher: Arc<dyn TranscoderLauncher>,
    grace: Duration,
    consumer_buffer: usize,
    events: broadcast::Sender<SessionEvent>,
    slot: Mutex<Slot>,
    state: watch::Sender<RecordingState>,
    generation: AtomicU64,
}

impl RecordingBranch {
    pub(crate) fn new(
        launcher: Arc<dyn TranscoderLauncher>,
        grace: Duration,
        consumer_buffer: usize,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            launcher,
            grace,
            consumer_buffer,
            events,
            slot: Mutex::new(Slot::Idle),
            state: watch::Sender::new(RecordingState::Idle),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.state.subscribe()
    }

    /// Start muxing the raw feed of `ingest` into `path`.
    pub(crate) async fn start(self: &Arc<Self>, ingest: &VideoIngest, path: PathBuf) -> Result<PathBuf> {
        let mut slot = self.slot.lock().await;
        if !matches!(*slot, Slot::Idle) {
            return Err(SessionError::precondition("start recording", "a recording is already active"));
        }

        let process = transcoder::spawn(
            self.launcher.recording(&path),
            "recording",
            self.launcher.program(),
            false,
        )?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let feed = ingest.consumers();
        let (consumer, chunks) = feed.join(self.consumer_buffer);
        tokio::spawn(transcoder::feed_stdin(chunks, process.stdin, "recording"));

        let stop = CancellationToken::new();
        let exit = tokio::spawn(monitor(
            Arc::downgrade(self),
            generation,
            process.child,
            stop.clone(),
            self.grace,
            path.clone(),
            self.events.clone(),
        ));

        *slot = Slot::Recording(ActiveRecording {
            generation,
            path: path.clone(),
            consumer,
            feed,
            stop,
            exit,
        });
        self.state.send_replace(RecordingState::Recording);
        info!(path = %path.display(), "Recording started");
        let _ = self
            .events
            .send(SessionEvent::RecordingStatus { recording: true, path: Some(path.clone()) });
        Ok(path)
    }

    /// Close the recording's input, wait for the container to be finalized
    /// and return its path.
    pub(crate) async fn stop(&self) -> Result<PathBuf> {
        let mut slot = self.slot.lock().await;
        let active = match std::mem::replace(&mut *slot, Slot::Stopping) {
            Slot::Recording(active) => active,
            other => {
                *slot = other;
                return Err(SessionError::precondition("stop recording", "no recording is active"));
            }
        };
        self.state.send_replace(RecordingState::Stopping);
        info!(path = %active.path.display(), "Stopping recording");

        active.stop.cancel();
        active.feed.leave(active.consumer);
        let report = match active.exit.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Recording monitor failed");
                None
            }
        };

        *slot = Slot::Idle;
        self.state.send_replace(RecordingState::Idle);

        match report {
            Some(report) if report.is_clean() => Ok(active.path),
            Some(report) => Err(SessionError::ProcessCrash {
                process: "recording".to_string(),
                status: report.describe(),
            }),
            None => Err(SessionError::ProcessCrash {
                process: "recording".to_string(),
                status: "monitor task failed".to_string(),
            }),
        }
    }

    /// Stop the recording if there is one. Used when the stream goes away.
    pub(crate) async fn stop_if_active(&self) {
        match self.stop().await {
            Ok(path) => info!(path = %path.display(), "Recording stopped with the stream"),
            Err(SessionError::PreconditionFailed { .. }) => {}
            Err(e) => warn!(error = %e, "Recording did not finish cleanly"),
        }
    }

    /// Reset after the recording process exited without being asked to.
    async fn on_unexpected_exit(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Recording(active) if active.generation == generation => {
                active.feed.leave(active.consumer);
                self.state.send_replace(RecordingState::Idle);
            }
            other => *slot = other,
        }
    }
}

async fn monitor(
    branch: Weak<RecordingBranch>,
    generation: u64,
    child: Child,
    stop: CancellationToken,
    grace: Duration,
    path: PathBuf,
    events: broadcast::Sender<SessionEvent>,
) -> ExitReport {
    let report = transcoder::supervise(child, stop, grace, "recording").await;

    if report.is_clean() {
        info!(path = %path.display(), "Recording finalized");
        let _ = events.send(SessionEvent::RecordingStatus { recording: false, path: Some(path) });
        return report;
    }

    let error = SessionError::ProcessCrash {
        process: "recording".to_string(),
        status: report.describe(),
    };
    error!(path = %path.display(), %error, "Recording was not finalized");
    let _ = events.send(SessionEvent::fault(&error));
    let _ = events.send(SessionEvent::RecordingStatus { recording: false, path: None });

    if !report.requested {
        if let Some(branch) = branch.upgrade() {
            // A stop path may be awaiting this task, so reset from a separate one
            tokio::spawn(async move { branch.on_unexpected_exit(generation).await });
        }
    }
    report
}

impl std::fmt::Debug for RecordingBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBranch").field("state", &*self.state.borrow()).finish()
    }
}
