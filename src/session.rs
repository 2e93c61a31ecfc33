//! Session coordinator
//!
//! A [`Session`] owns everything that talks to one drone: the command
//! transport, the telemetry driver, the stream supervisor with its recording
//! branch, and the viewer server. The UI bridge talks to it through
//! [`Session::dispatch`] and listens on [`Session::events`].

use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandTransport, DroneCommand, Reply};
use crate::config::SessionConfig;
use crate::media::{
    Broadcaster, FfmpegLauncher, MediaStore, PortInspector, StreamSupervisor, SystemPortInspector,
    TranscoderLauncher,
};
use crate::stream::ThrottleExt;
use crate::telemetry::{TelemetryDecoder, TelemetryDriver, UdpTelemetrySource};
use crate::types::{
    BridgeCommand, BridgeReply, RecordingState, SessionEvent, StreamState, TelemetrySnapshot,
    UpdateRate,
};
use crate::{Result, SessionError};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_BUFFER: usize = 256;

/// Builder for [`Session`].
///
/// ```rust,no_run
/// use dronelink::{Session, SessionConfig};
///
/// # async fn run() -> dronelink::Result<()> {
/// let session = Session::builder(SessionConfig::default()).start().await?;
/// session.connect().await?;
/// session.toggle_stream().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
    launcher: Option<Arc<dyn TranscoderLauncher>>,
    inspector: Option<Arc<dyn PortInspector>>,
}

impl SessionBuilder {
    /// Use a different transcoder launcher than ffmpeg.
    pub fn launcher(mut self, launcher: impl TranscoderLauncher) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Use a different port inspector for video port hygiene.
    pub fn inspector(mut self, inspector: impl PortInspector) -> Self {
        self.inspector = Some(Arc::new(inspector));
        self
    }

    /// Prepare the media folder, bind every socket and start the background tasks.
    pub async fn start(self) -> Result<Session> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = MediaStore::new(&config.media_root);
        store.prepare().await?;

        let transport =
            CommandTransport::bind(config.device.command_addr(), config.command.clone()).await?;
        let source = UdpTelemetrySource::bind(config.device.telemetry_port).await?;
        let telemetry_addr = source.local_addr()?;
        let listener = Broadcaster::bind(config.viewer.bind).await?;
        let viewer_addr = listener
            .local_addr()
            .map_err(|e| SessionError::transport("viewer server address", e))?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let channels = TelemetryDriver::spawn(
            source,
            TelemetryDecoder::new(config.telemetry.min_interval()),
            events.clone(),
            config.telemetry.link_timeout(),
        );
        let cancel = channels.cancel;

        let broadcaster = Arc::new(Broadcaster::new(config.viewer.buffer));
        broadcaster.serve(listener, cancel.child_token());

        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(FfmpegLauncher::new(&config.transcoder, &config.recording))
        });
        let inspector = self.inspector.unwrap_or_else(|| Arc::new(SystemPortInspector));
        let supervisor = Arc::new(StreamSupervisor::new(
            Arc::clone(&config),
            launcher,
            inspector,
            broadcaster,
            events.clone(),
            store.still_frame_path(),
        ));

        info!(
            device = %transport.device(),
            %telemetry_addr,
            %viewer_addr,
            media_root = %store.root().display(),
            "Session started"
        );

        Ok(Session {
            config,
            transport,
            supervisor,
            store,
            events,
            snapshots: channels.snapshots,
            telemetry_addr,
            viewer_addr,
            stream_ops: Mutex::new(()),
            cancel,
            closed: AtomicBool::new(false),
        })
    }
}

/// One drone, its media pipeline and the events the UI sees.
pub struct Session {
    config: Arc<SessionConfig>,
    transport: CommandTransport,
    supervisor: Arc<StreamSupervisor>,
    store: MediaStore,
    events: broadcast::Sender<SessionEvent>,
    snapshots: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,
    telemetry_addr: SocketAddr,
    viewer_addr: SocketAddr,
    /// Serializes stream toggles including their `streamon`/`streamoff`
    stream_ops: Mutex<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder { config, launcher: None, inspector: None }
    }

    /// Start a session with the ffmpeg launcher and system port inspector.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn media(&self) -> &MediaStore {
        &self.store
    }

    /// Local address the telemetry socket is bound to.
    pub fn telemetry_addr(&self) -> SocketAddr {
        self.telemetry_addr
    }

    /// Address viewers connect to for the live stream.
    pub fn viewer_addr(&self) -> SocketAddr {
        self.viewer_addr
    }

    /// Address of the video socket while the stream is live.
    pub async fn video_addr(&self) -> Option<SocketAddr> {
        self.supervisor.video_addr().await
    }

    pub fn stream_state(&self) -> StreamState {
        self.supervisor.state()
    }

    pub fn watch_stream_state(&self) -> watch::Receiver<StreamState> {
        self.supervisor.subscribe()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.supervisor.recording_state()
    }

    pub fn viewer_count(&self) -> usize {
        self.supervisor.viewer_count()
    }

    /// Subscribe to session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Session events as a stream. A subscriber that lags skips the missed events.
    pub fn event_stream(&self) -> impl Stream<Item = SessionEvent> + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged");
                    None
                }
            }
        })
    }

    /// Last accepted telemetry snapshot, if any arrived yet.
    pub fn current_telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.snapshots.borrow().clone()
    }

    /// Telemetry snapshots at the requested rate.
    ///
    /// The current snapshot (if any) is yielded first. With `Max(hz)` bursts
    /// collapse to the newest snapshot.
    pub fn telemetry(&self, rate: UpdateRate) -> impl Stream<Item = Arc<TelemetrySnapshot>> + 'static {
        let snapshots = WatchStream::new(self.snapshots.clone()).filter_map(|opt| async move { opt });

        match rate.throttle_interval(self.config.telemetry.min_interval()) {
            None => snapshots.boxed(),
            Some(period) => snapshots.throttle(period).boxed(),
        }
    }

    /// Put the drone into SDK mode.
    pub async fn connect(&self) -> Result<Reply> {
        self.ensure_open()?;
        match self.transport.execute(DroneCommand::Command).await {
            Ok(reply) => {
                info!("Drone accepted SDK mode");
                let _ = self.events.send(SessionEvent::Connected);
                Ok(reply)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Send raw command text.
    pub async fn command(&self, text: &str) -> Result<Reply> {
        self.ensure_open()?;
        self.transport.send(text).await
    }

    /// Send a typed command.
    pub async fn execute(&self, command: DroneCommand) -> Result<Reply> {
        self.ensure_open()?;
        self.transport.execute(command).await
    }

    /// Turn the stream on if it is off, off otherwise. Returns whether it is now live.
    ///
    /// The current state is read under the stream lock, so concurrent
    /// toggles alternate instead of racing to the same transition.
    pub async fn toggle_stream(&self) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.stream_ops.lock().await;
        if self.stream_state().is_live() {
            self.stop_stream_locked().await.map(|()| false)
        } else {
            self.start_stream_locked().await.map(|()| true)
        }
    }

    /// Start the pipeline, then ask the drone to send video.
    ///
    /// If the drone refuses, the pipeline is stopped again so the stream
    /// reads as off.
    pub async fn start_stream(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.stream_ops.lock().await;
        self.start_stream_locked().await
    }

    /// Stop the pipeline (finishing any recording), then tell the drone to stop video.
    pub async fn stop_stream(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.stream_ops.lock().await;
        self.stop_stream_locked().await
    }

    async fn start_stream_locked(&self) -> Result<()> {
        if let Err(e) = self.supervisor.start().await {
            return Err(self.fault(e));
        }
        if let Err(e) = self.transport.execute(DroneCommand::StreamOn).await {
            warn!(error = %e, "Drone refused streamon, stopping pipeline");
            if let Err(stop_err) = self.supervisor.stop().await {
                warn!(error = %stop_err, "Pipeline did not stop cleanly");
            }
            return Err(self.fault(e));
        }
        Ok(())
    }

    async fn stop_stream_locked(&self) -> Result<()> {
        if let Err(e) = self.supervisor.stop().await {
            return Err(self.fault(e));
        }
        if let Err(e) = self.transport.execute(DroneCommand::StreamOff).await {
            warn!(error = %e, "streamoff was not acknowledged");
        }
        Ok(())
    }

    /// Start a recording if none is active, stop it otherwise.
    ///
    /// Returns the new recording's path when starting and the finished
    /// file's path when stopping.
    pub async fn toggle_recording(&self) -> Result<PathBuf> {
        if self.recording_state().is_recording() {
            self.stop_recording().await
        } else {
            self.start_recording().await
        }
    }

    /// Record the live feed to a new file under `recordings/`.
    pub async fn start_recording(&self) -> Result<PathBuf> {
        self.ensure_open()?;
        let path = self.store.recording_path().await.map_err(|e| self.fault(e))?;
        match self.supervisor.start_recording(path.clone()).await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.store.discard(&path).await;
                Err(self.fault(e))
            }
        }
    }

    /// Finish the active recording and return its path.
    pub async fn stop_recording(&self) -> Result<PathBuf> {
        self.ensure_open()?;
        self.supervisor.stop_recording().await.map_err(|e| self.fault(e))
    }

    /// Save the current still frame to a new file under `photos/`.
    pub async fn capture_photo(&self) -> Result<PathBuf> {
        self.ensure_open()?;
        let path = self.store.photo_path().await.map_err(|e| self.fault(e))?;
        match self.supervisor.capture_photo(path.clone()).await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.store.discard(&path).await;
                Err(self.fault(e))
            }
        }
    }

    /// Execute a bridge command and describe the outcome.
    pub async fn dispatch(&self, command: BridgeCommand) -> BridgeReply {
        debug!(?command, "Bridge command");
        let result = match command {
            BridgeCommand::Connect => self.connect().await.map(|r| BridgeReply::with_data(r.to_string())),
            BridgeCommand::SendRawCommand { text } => {
                self.command(&text).await.map(|r| BridgeReply::with_data(r.to_string()))
            }
            BridgeCommand::ToggleStream => self
                .toggle_stream()
                .await
                .map(|live| BridgeReply::with_data(if live { "on" } else { "off" })),
            BridgeCommand::ToggleRecording => self.toggle_recording().await.map(BridgeReply::with_path),
            BridgeCommand::CapturePhoto => self.capture_photo().await.map(BridgeReply::with_path),
            BridgeCommand::Shutdown => {
                self.shutdown().await;
                Ok(BridgeReply::ok())
            }
        };
        result.unwrap_or_else(|e| BridgeReply::failure(&e))
    }

    /// Stop recording and stream, then cancel the background tasks.
    ///
    /// Safe to call more than once; later operations fail with `Shutdown`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session");
        {
            let _guard = self.stream_ops.lock().await;
            self.supervisor.shutdown().await;
        }
        self.cancel.cancel();
        info!("Session shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() { Err(SessionError::Shutdown) } else { Ok(()) }
    }

    /// Publish `error` as a fault event and hand it back.
    fn fault(&self, error: SessionError) -> SessionError {
        warn!(%error, "Session operation failed");
        let _ = self.events.send(SessionEvent::fault(&error));
        error
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Dropping session");
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.transport.device())
            .field("telemetry_addr", &self.telemetry_addr)
            .field("viewer_addr", &self.viewer_addr)
            .field("stream", &self.supervisor)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
