//! Best-effort room snapshot persistence.
//!
//! The coordinator's in-memory state is authoritative; the snapshot only
//! lets a restarted server come back with the same queue instead of an
//! empty room. Store failures are logged and swallowed. Sessions are
//! ephemeral and are never written here.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use syncjam_core::messages::PlaybackMode;
use syncjam_core::queue::Track;

/// Snapshots older than this are stale and discarded on load.
const SNAPSHOT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub queue: Vec<Track>,
    pub current_index: usize,
    pub mode: PlaybackMode,
    pub current_time: f64,
    #[serde(default)]
    pub saved_at_ms: u64,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshots outlive the process, so this is the one place that reads
    /// wall-clock time instead of the room's monotonic clock.
    fn wall_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Load the stored room, if there is one worth restoring.
    ///
    /// Absence, corruption, staleness and internally-inconsistent records
    /// all come back as `None`: a fresh room is always an acceptable
    /// outcome. A record saved mid-playback wakes up Paused.
    pub async fn load(&self) -> Option<RoomRecord> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "snapshot unreadable");
                return None;
            }
        };
        let mut record: RoomRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "snapshot corrupt, ignoring");
                return None;
            }
        };

        let age_ms = Self::wall_ms().saturating_sub(record.saved_at_ms);
        if age_ms > SNAPSHOT_TTL_MS {
            tracing::info!(age_ms, "snapshot stale, starting fresh");
            return None;
        }
        if record.queue.is_empty() {
            return None;
        }
        if record.current_index >= record.queue.len() {
            tracing::warn!(
                current_index = record.current_index,
                queue_len = record.queue.len(),
                "snapshot index out of range, ignoring"
            );
            return None;
        }
        if record.mode == PlaybackMode::Playing || record.mode == PlaybackMode::Preparing {
            record.mode = PlaybackMode::Paused;
        }
        if !record.current_time.is_finite() || record.current_time < 0.0 {
            record.current_time = 0.0;
        }
        Some(record)
    }

    /// Best-effort save; failures are logged, never propagated.
    pub async fn save(&self, mut record: RoomRecord) {
        record.saved_at_ms = Self::wall_ms();
        if let Err(e) = self.try_save(&record).await {
            tracing::warn!(path = %self.path.display(), error = %e, "snapshot save failed");
        }
    }

    async fn try_save(&self, record: &RoomRecord) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Whether the store looks usable, for the health endpoint.
    pub async fn available(&self) -> bool {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::metadata(dir).await.is_ok()
    }
}
