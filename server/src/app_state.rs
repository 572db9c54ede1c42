//! Shared server state handed to every request handler.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use syncjam_core::clock::{Clock, SystemClock};
use syncjam_core::messages::ServerMessage;

use crate::config::Config;
use crate::coordinator::{self, Command, Coordinator};
use crate::registry::SessionRegistry;
use crate::resolver::AudioResolver;
use crate::snapshot::SnapshotStore;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Pub/Sub for fanning coordinator broadcasts out to every socket.
    /// A lagging consumer drops messages instead of stalling the room.
    pub tx: broadcast::Sender<ServerMessage>,
    /// Command queue into the coordinator's single-writer task.
    pub commands: mpsc::Sender<Command>,
    pub clock: Arc<dyn Clock>,
    pub resolver: AudioResolver,
    pub snapshot: Arc<SnapshotStore>,
    /// Display name of this room, surfaced on the health endpoint.
    pub room_name: String,
}

impl AppState {
    /// Assemble the room: hydrate from the snapshot store if it has
    /// anything worth restoring, then spawn the coordinator task.
    pub async fn build(config: &Config) -> SharedState {
        let registry = Arc::new(SessionRegistry::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let (tx, _) = broadcast::channel(256);
        let snapshot = Arc::new(SnapshotStore::new(config.snapshot_path.clone()));

        let mut coordinator =
            Coordinator::new(registry.clone(), clock.clone(), Arc::new(tx.clone()));
        if let Some(record) = snapshot.load().await {
            coordinator.hydrate(record);
        }
        let commands = coordinator::spawn(coordinator, Some(snapshot.clone()));

        Arc::new(Self {
            registry,
            tx,
            commands,
            clock,
            resolver: AudioResolver::new(config.resolver_url.clone()),
            snapshot,
            room_name: config.room_name.clone(),
        })
    }
}
