//! Transcoder processes: how they are launched, fed and stopped.
//!
//! Both the live transcoder and the recording muxer read raw H.264 on stdin.
//! Closing stdin is the graceful stop signal: the process flushes its
//! outputs (the recording muxer writes its container trailer) and exits on
//! its own. Only a process that overstays the grace period is killed.

use bytes::Bytes;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RecordingConfig, TranscoderConfig};
use crate::{Result, SessionError};

/// Builds the commands for the two transcoder roles.
///
/// Implementations only choose the program and its arguments; stdio wiring
/// is done by the supervisor.
pub trait TranscoderLauncher: Send + Sync + 'static {
    /// Program name, used in errors and for reclaiming the video port.
    fn program(&self) -> &str;

    /// Raw H.264 on stdin to a viewer-ready stream on stdout, refreshing a
    /// still frame at `still_frame` as a side output.
    fn live(&self, still_frame: &Path) -> Command;

    /// Raw H.264 on stdin remuxed into a container at `destination`.
    fn recording(&self, destination: &Path) -> Command;
}

/// ffmpeg-backed launcher.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    transcoder: TranscoderConfig,
    recording: RecordingConfig,
}

impl FfmpegLauncher {
    pub fn new(transcoder: &TranscoderConfig, recording: &RecordingConfig) -> Self {
        Self { transcoder: transcoder.clone(), recording: recording.clone() }
    }

    pub fn live_args(&self, still_frame: &Path) -> Vec<OsString> {
        let t = &self.transcoder;
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-f",
            "h264",
            "-i",
            "pipe:0",
            // viewer output
            "-map",
            "0:v:0",
            "-f",
            "mpegts",
            "-codec:v",
            "mpeg1video",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.extend(
            [
                "-s".to_string(),
                format!("{}x{}", t.width, t.height),
                "-b:v".to_string(),
                t.bitrate.clone(),
                "-r".to_string(),
                t.fps.to_string(),
                "-bf".to_string(),
                "0".to_string(),
                "pipe:1".to_string(),
                // still frame output
                "-map".to_string(),
                "0:v:0".to_string(),
                "-vf".to_string(),
                format!("fps={}", t.still_fps),
                "-q:v".to_string(),
                "2".to_string(),
                "-f".to_string(),
                "image2".to_string(),
                "-update".to_string(),
                "1".to_string(),
                "-y".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(still_frame.as_os_str().to_owned());
        args
    }

    pub fn recording_args(&self, destination: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-fflags".into(),
            "+genpts".into(),
            "-r".into(),
            self.recording.fps.to_string().into(),
            "-f".into(),
            "h264".into(),
            "-i".into(),
            "pipe:0".into(),
            "-map".into(),
            "0:v:0".into(),
            "-c:v".into(),
            "copy".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            "-y".into(),
        ];
        args.push(destination.as_os_str().to_owned());
        args
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn program(&self) -> &str {
        &self.transcoder.program
    }

    fn live(&self, still_frame: &Path) -> Command {
        let mut command = Command::new(&self.transcoder.program);
        command.args(self.live_args(still_frame));
        command
    }

    fn recording(&self, destination: &Path) -> Command {
        let mut command = Command::new(&self.transcoder.program);
        command.args(self.recording_args(destination));
        command
    }
}

/// A freshly spawned transcoder with its pipes split off.
pub(crate) struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: Option<ChildStdout>,
}

/// Spawn `command` with piped stdin and stderr, and stdout piped only when
/// `capture_stdout` is set. Stderr is forwarded to the log.
pub(crate) fn spawn(
    mut command: Command,
    label: &'static str,
    program: &str,
    capture_stdout: bool,
) -> Result<SpawnedProcess> {
    command
        .stdin(Stdio::piped())
        .stdout(if capture_stdout { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| SessionError::spawn_failed(program, e))?;
    let stdin = child.stdin.take().ok_or_else(|| {
        SessionError::spawn_failed(program, std::io::Error::other("stdin was not captured"))
    })?;
    let stdout = child.stdout.take();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, label));
    }

    info!(process = label, pid = child.id(), "Transcoder spawned");
    Ok(SpawnedProcess { child, stdin, stdout })
}

/// Copy queued chunks into the process's stdin until the queue ends.
///
/// Returning drops `stdin`, which is what tells the process to finish.
pub(crate) async fn feed_stdin(
    mut chunks: mpsc::Receiver<Bytes>,
    mut stdin: ChildStdin,
    label: &'static str,
) {
    let mut written: u64 = 0;
    while let Some(chunk) = chunks.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!(process = label, error = %e, "Transcoder input closed");
            return;
        }
        written += chunk.len() as u64;
    }
    debug!(process = label, written, "Transcoder input finished");
}

async fn log_stderr(stderr: ChildStderr, label: &'static str) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(process = label, "{}", line);
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExitReport {
    /// A stop was requested before the process exited
    pub requested: bool,
    /// The process overstayed its grace period
    pub killed: bool,
    pub status: Option<ExitStatus>,
}

impl ExitReport {
    /// Exited by itself after a stop request, with a success status.
    pub fn is_clean(&self) -> bool {
        self.requested && !self.killed && self.status.is_some_and(|s| s.success())
    }

    pub fn describe(&self) -> String {
        match (self.killed, self.status) {
            (true, _) => "killed after grace period".to_string(),
            (false, Some(status)) => status.to_string(),
            (false, None) => "unknown status".to_string(),
        }
    }
}

/// Wait for `child` to exit, or for `stop` to be requested.
///
/// After a stop request the child gets `grace` to exit on its own (its input
/// is expected to be closed by the caller) before being killed.
pub(crate) async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    grace: Duration,
    label: &'static str,
) -> ExitReport {
    tokio::select! {
        biased;
        _ = stop.cancelled() => {}
        status = child.wait() => {
            return ExitReport { requested: false, killed: false, status: status.ok() };
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => ExitReport { requested: true, killed: false, status: status.ok() },
        Err(_) => {
            warn!(process = label, ?grace, "Transcoder ignored stop request, killing");
            if let Err(e) = child.kill().await {
                warn!(process = label, error = %e, "Failed to kill transcoder");
            }
            ExitReport { requested: true, killed: true, status: child.wait().await.ok() }
        }
    }
}
