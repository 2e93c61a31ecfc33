//! Media folder layout and file naming

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tracing::{debug, info, warn};

use crate::{Result, SessionError};

/// Where photos, recordings and the live still frame live.
///
/// ```text
/// <root>/photos/tello_photo_<timestamp>.jpg
/// <root>/recordings/tello_video_<timestamp>.mp4
/// <root>/.live/still.jpg
/// ```
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.root.join("photos")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("recordings")
    }

    pub fn still_frame_path(&self) -> PathBuf {
        self.root.join(".live").join("still.jpg")
    }

    /// Create the folders and make sure they are writable.
    pub async fn prepare(&self) -> Result<()> {
        for dir in [self.photos_dir(), self.recordings_dir(), self.root.join(".live")] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| SessionError::file_error(&dir, e))?;
        }

        let probe = self.root.join(".testwrite");
        tokio::fs::write(&probe, b"ok").await.map_err(|e| SessionError::file_error(&probe, e))?;
        tokio::fs::remove_file(&probe).await.map_err(|e| SessionError::file_error(&probe, e))?;

        info!(root = %self.root.display(), "Media folder ready");
        Ok(())
    }

    /// Claim a fresh path for a photo taken now.
    ///
    /// The file is created empty so a concurrent capture cannot pick the
    /// same name; [`MediaStore::discard`] removes it if nothing gets written.
    pub async fn photo_path(&self) -> Result<PathBuf> {
        claim_unique_path(&self.photos_dir(), "photo", "jpg", Utc::now()).await
    }

    /// Claim a fresh path for a recording started now.
    pub async fn recording_path(&self) -> Result<PathBuf> {
        claim_unique_path(&self.recordings_dir(), "video", "mp4", Utc::now()).await
    }

    /// Remove a claimed path whose artifact was never produced.
    pub async fn discard(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Released unused media path"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not release media path"),
        }
    }
}

/// Create `tello_<kind>_<timestamp>.<ext>`, appending `-1`, `-2`, ... until
/// the name is free. Creation is exclusive, so two callers never share a name.
async fn claim_unique_path(dir: &Path, kind: &str, ext: &str, at: DateTime<Utc>) -> Result<PathBuf> {
    let stem = format!("tello_{kind}_{}", at.format("%Y-%m-%dT%H-%M-%S-%3fZ"));
    let mut n = 0u32;
    loop {
        let candidate = match n {
            0 => dir.join(format!("{stem}.{ext}")),
            n => dir.join(format!("{stem}-{n}.{ext}")),
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(SessionError::file_error(&candidate, e)),
        }
    }
}
