//! Photo capture from the live transcoder's still frame

use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, trace};

use crate::config::PhotoConfig;
use crate::{Result, SessionError};

/// Copy the current still frame to `destination`.
///
/// The still frame is rewritten continuously by the live transcoder, so it
/// may be missing or empty for a moment. It is polled until it has content;
/// if it never does, nothing is written to `destination`.
pub async fn capture_still(
    still_frame: &Path,
    destination: &Path,
    config: &PhotoConfig,
) -> Result<PathBuf> {
    for attempt in 1..=config.poll_attempts {
        match tokio::fs::metadata(still_frame).await {
            Ok(meta) if meta.len() > 0 => {
                tokio::fs::copy(still_frame, destination)
                    .await
                    .map_err(|e| SessionError::file_error(destination, e))?;
                info!(path = %destination.display(), bytes = meta.len(), "Photo captured");
                return Ok(destination.to_path_buf());
            }
            Ok(_) => trace!(attempt, "Still frame is empty"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(attempt, "Still frame not written yet")
            }
            Err(e) => return Err(SessionError::file_error(still_frame, e)),
        }
        if attempt < config.poll_attempts {
            tokio::time::sleep(config.poll_interval()).await;
        }
    }

    Err(SessionError::Timeout {
        operation: "capture photo".to_string(),
        duration: config.poll_interval() * config.poll_attempts,
    })
}
