//! Environment-driven server configuration.

use std::path::PathBuf;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RESOLVER_URL: &str = "http://127.0.0.1:5001";
const DEFAULT_SNAPSHOT_PATH: &str = "syncjam-room.json";
const DEFAULT_ROOM_NAME: &str = "SyncJam";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Base URL of the audio-URL resolution sidecar.
    pub resolver_url: String,
    /// Where the best-effort room snapshot lives.
    pub snapshot_path: PathBuf,
    /// Display name of the room, reported on the health endpoint.
    pub room_name: String,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("SYNCJAM_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let resolver_url =
            std::env::var("SYNCJAM_RESOLVER_URL").unwrap_or_else(|_| DEFAULT_RESOLVER_URL.into());
        let snapshot_path = std::env::var("SYNCJAM_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SNAPSHOT_PATH));
        let room_name =
            std::env::var("SYNCJAM_ROOM_NAME").unwrap_or_else(|_| DEFAULT_ROOM_NAME.into());
        Self {
            port,
            resolver_url,
            snapshot_path,
            room_name,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            resolver_url: DEFAULT_RESOLVER_URL.into(),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            room_name: DEFAULT_ROOM_NAME.into(),
        }
    }
}
