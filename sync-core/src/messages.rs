//! Wire protocol between the room server and its clients.
//!
//! Messages travel as JSON text frames, internally tagged with a `type`
//! field and camelCase payload keys so browser clients can consume them
//! directly.

use serde::{Deserialize, Serialize};

use crate::queue::Track;

/// Room playback mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackMode {
    Idle,
    Preparing,
    Playing,
    Paused,
}

/// Full room state, sent on connect and after every queue mutation.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub queue: Vec<Track>,
    pub current_index: usize,
    pub mode: PlaybackMode,
    /// Seconds into the current track. Live (derived from the virtual
    /// clock) when the room is playing.
    pub current_time: f64,
    pub epoch: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Introduce this session with a display name. Sent once after
    /// connecting; purely informational.
    Join { name: String },
    /// Latency probe. Carries the client's monotonic clock in ms.
    Ping { client_timestamp: u64 },
    Play,
    Pause,
    Skip,
    Previous,
    JumpTo { index: usize },
    Seek { seconds: f64 },
    AddToQueue { track: Track },
    RemoveFromQueue { index: usize },
    ReorderQueue { queue: Vec<Track>, current_track_index: usize },
    /// Pre-buffer confirmation for the given playback epoch.
    ReadyToPlay { epoch: u64 },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomState {
        #[serde(flatten)]
        room: RoomSnapshot,
    },
    QueueUpdate {
        #[serde(flatten)]
        room: RoomSnapshot,
    },
    PlayerUpdate {
        is_playing: bool,
        current_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_wall_ms: Option<u64>,
    },
    /// Open a new playback epoch: clients pre-buffer and reply `readyToPlay`.
    PreparePlayback {
        track_index: usize,
        start_time: f64,
        server_timestamp: u64,
        epoch: u64,
    },
    /// Ready convergence (or the ready-timeout) was reached: start playback.
    SynchronizedPlay {
        start_time: f64,
        server_timestamp: u64,
        is_playing: bool,
        epoch: u64,
    },
    /// Authoritative virtual clock, broadcast every tick while playing.
    SyncTime {
        current_time: f64,
        is_playing: bool,
        current_track_index: usize,
        server_timestamp: u64,
        epoch: u64,
    },
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
        /// Estimated one-way latency in ms.
        latency: f64,
    },
    ForceReload,
}
