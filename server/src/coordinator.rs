//! Playback coordinator: the room's single writer.
//!
//! All room mutations flow through one task fed by a command queue, so
//! state transitions are totally ordered and every broadcast for a
//! mutation is emitted before the next command is looked at. Timers (the
//! ready-timeout, the post-navigation prepare delay, the sync tick) are
//! deadlines compared against the injected clock; the async shell turns
//! the nearest deadline into a sleep, and tests advance a manual clock
//! instead.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use syncjam_core::clock::Clock;
use syncjam_core::consts::{
    NAV_PREPARE_DELAY_MS, PLAY_PAUSE_COOLDOWN_MS, READY_TIMEOUT_MS, SYNC_INTERVAL_MS,
};
use syncjam_core::messages::{PlaybackMode, RoomSnapshot, ServerMessage};
use syncjam_core::queue::{Queue, QueueError, RemoveOutcome, Track};

use crate::registry::SessionRegistry;
use crate::snapshot::RoomRecord;

/// Protocol-level command rejections. None of these crosses the wire:
/// the coordinator loop logs them and drops the command, keeping the
/// room state untouched.
#[derive(Debug, Error, PartialEq)]
pub enum CoordinatorError {
    #[error("{what}: index {index} out of range")]
    IndexOutOfRange { what: &'static str, index: usize },
    #[error("queue is empty")]
    EmptyQueue,
    #[error("seek to {0} is not a valid position")]
    InvalidSeek(f64),
    #[error("track {0:?} is not playable")]
    UnplayableTrack(String),
    #[error("ready for epoch {got}, current epoch is {current}")]
    StaleEpoch { got: u64, current: u64 },
    #[error("unknown session {0}")]
    UnknownSession(String),
}

/// Room-wide fan-out seam. Production wires the broadcast channel in;
/// tests record.
pub trait RoomSink: Send + Sync {
    fn send(&self, msg: ServerMessage);
}

impl RoomSink for broadcast::Sender<ServerMessage> {
    fn send(&self, msg: ServerMessage) {
        // No receivers just means an empty room.
        let _ = broadcast::Sender::send(self, msg);
    }
}

/// Everything the coordinator will act on, client commands and internal
/// queries alike.
#[derive(Debug)]
pub enum Command {
    Attach {
        session_id: String,
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Detach {
        session_id: String,
    },
    Play,
    Pause,
    Skip,
    Previous,
    JumpTo {
        index: usize,
    },
    Seek {
        seconds: f64,
    },
    AddToQueue {
        track: Track,
    },
    RemoveFromQueue {
        index: usize,
    },
    Reorder {
        queue: Vec<Track>,
        current_track_index: usize,
    },
    ReadyToPlay {
        session_id: String,
        epoch: u64,
    },
    Health {
        reply: oneshot::Sender<RoomHealth>,
    },
}

#[derive(Debug, Clone)]
pub struct RoomHealth {
    pub clients: usize,
    pub mode: PlaybackMode,
    pub queue_len: usize,
}

pub struct Coordinator {
    queue: Queue,
    mode: PlaybackMode,
    /// Seconds into the current track; authoritative while not Playing.
    current_time: f64,
    /// Wall-clock ms at which the track would have started from zero.
    /// Signed so a seek early in process life cannot underflow.
    start_wall_ms: Option<i64>,
    epoch: u64,
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn RoomSink>,
    ready_deadline: Option<u64>,
    nav_prepare_at: Option<u64>,
    next_tick_ms: Option<u64>,
    last_guarded_ms: Option<u64>,
    dirty: bool,
}

impl Coordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn RoomSink>,
    ) -> Self {
        Self {
            queue: Queue::new(),
            mode: PlaybackMode::Idle,
            current_time: 0.0,
            start_wall_ms: None,
            epoch: 0,
            registry,
            clock,
            sink,
            ready_deadline: None,
            nav_prepare_at: None,
            next_tick_ms: None,
            last_guarded_ms: None,
            dirty: false,
        }
    }

    /// Restore queue/index/time from a boot snapshot. Sessions are never
    /// restored and a hydrated room always wakes Paused.
    pub fn hydrate(&mut self, record: RoomRecord) {
        self.queue = Queue::from_parts(record.queue, record.current_index);
        self.current_time = record.current_time;
        self.mode = if self.queue.is_empty() {
            PlaybackMode::Idle
        } else {
            PlaybackMode::Paused
        };
        tracing::info!(
            tracks = self.queue.len(),
            current_index = self.queue.current_index(),
            "room hydrated from snapshot"
        );
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn live_time(&self, now: u64) -> f64 {
        match (self.mode, self.start_wall_ms) {
            (PlaybackMode::Playing, Some(start)) => {
                ((now as i64 - start).max(0) as f64) / 1000.0
            }
            _ => self.current_time,
        }
    }

    pub fn room_snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            queue: self.queue.tracks().to_vec(),
            current_index: self.queue.current_index(),
            mode: self.mode,
            current_time: self.live_time(self.now()),
            epoch: self.epoch,
        }
    }

    /// Snapshot-store image of the durable part of the room.
    pub fn persistable(&self) -> RoomRecord {
        RoomRecord {
            queue: self.queue.tracks().to_vec(),
            current_index: self.queue.current_index(),
            mode: self.mode,
            current_time: self.live_time(self.now()),
            saved_at_ms: 0,
        }
    }

    /// True once since the last call if a durable mutation happened.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Nearest pending timer, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        [self.nav_prepare_at, self.ready_deadline, self.next_tick_ms]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every timer that has come due.
    pub fn poll(&mut self) {
        let now = self.now();
        if matches!(self.nav_prepare_at, Some(at) if now >= at) {
            self.nav_prepare_at = None;
            self.fire_nav_prepare(now);
        }
        if matches!(self.ready_deadline, Some(at) if now >= at) {
            self.ready_deadline = None;
            self.fire_ready_timeout(now);
        }
        if matches!(self.next_tick_ms, Some(at) if now >= at) {
            self.tick(now);
        }
    }

    /// Apply one command, dropping protocol rejections with a log. This
    /// is the shape every caller wants: a bad command never takes the
    /// room down.
    pub fn handle(&mut self, cmd: Command) {
        if let Err(e) = self.apply(cmd) {
            tracing::debug!(error = %e, "command dropped");
        }
    }

    /// Apply one command, surfacing protocol rejections as typed errors.
    pub fn apply(&mut self, cmd: Command) -> Result<(), CoordinatorError> {
        let now = self.now();
        match cmd {
            Command::Attach { session_id, reply } => {
                self.registry.attach(&session_id);
                tracing::info!(%session_id, clients = self.registry.len(), "client attached");
                let _ = reply.send(self.room_snapshot());
                Ok(())
            }
            Command::Detach { session_id } => {
                self.detach(now, &session_id);
                Ok(())
            }
            Command::Play => self.cmd_play(now),
            Command::Pause => {
                self.cmd_pause(now);
                Ok(())
            }
            Command::Skip => {
                let target = self.queue.current_index() + 1;
                self.navigate(now, target, "skip")
            }
            Command::Previous => {
                let current = self.queue.current_index();
                if current == 0 {
                    return Err(CoordinatorError::IndexOutOfRange {
                        what: "previous",
                        index: 0,
                    });
                }
                self.navigate(now, current - 1, "previous")
            }
            Command::JumpTo { index } => self.navigate(now, index, "jumpTo"),
            Command::Seek { seconds } => self.cmd_seek(now, seconds),
            Command::AddToQueue { track } => self.cmd_add(track),
            Command::RemoveFromQueue { index } => self.cmd_remove(index),
            Command::Reorder {
                queue,
                current_track_index,
            } => self.cmd_reorder(queue, current_track_index),
            Command::ReadyToPlay { session_id, epoch } => self.cmd_ready(now, &session_id, epoch),
            Command::Health { reply } => {
                let _ = reply.send(RoomHealth {
                    clients: self.registry.len(),
                    mode: self.mode,
                    queue_len: self.queue.len(),
                });
                Ok(())
            }
        }
    }

    fn detach(&mut self, now: u64, session_id: &str) {
        self.registry.detach(session_id);
        tracing::info!(session_id, clients = self.registry.len(), "client detached");

        if self.mode != PlaybackMode::Preparing {
            return;
        }
        if self.registry.is_empty() {
            // Nobody left to converge; stop preparing where we stood.
            tracing::info!("room emptied while preparing, pausing");
            self.ready_deadline = None;
            self.nav_prepare_at = None;
            self.mode = PlaybackMode::Paused;
            self.dirty = true;
        } else if self.ready_deadline.is_some() && self.registry.all_ready() {
            // The departed client was the only one holding the room up.
            self.begin_playing(now);
        }
    }

    /// Shared play/pause guard: a single-writer lock plus a minimum gap
    /// between accepted transport commands filters double taps and racing
    /// clients.
    fn guard_transport(&mut self, now: u64, what: &str) -> bool {
        if let Some(last) = self.last_guarded_ms {
            if now.saturating_sub(last) < PLAY_PAUSE_COOLDOWN_MS {
                tracing::debug!(what, "transport command inside cooldown, dropped");
                return false;
            }
        }
        self.last_guarded_ms = Some(now);
        true
    }

    fn cmd_play(&mut self, now: u64) -> Result<(), CoordinatorError> {
        if !self.guard_transport(now, "play") {
            return Ok(());
        }
        match self.mode {
            PlaybackMode::Playing | PlaybackMode::Preparing => {
                tracing::debug!(mode = ?self.mode, "play ignored");
                Ok(())
            }
            PlaybackMode::Idle | PlaybackMode::Paused => {
                if self.queue.is_empty() {
                    return Err(CoordinatorError::EmptyQueue);
                }
                self.enter_preparing(now, self.current_time);
                Ok(())
            }
        }
    }

    fn cmd_pause(&mut self, now: u64) {
        if !self.guard_transport(now, "pause") {
            return;
        }
        match self.mode {
            PlaybackMode::Playing => {
                self.current_time = self.live_time(now);
                self.mode = PlaybackMode::Paused;
                self.next_tick_ms = None;
                self.sink.send(ServerMessage::PlayerUpdate {
                    is_playing: false,
                    current_time: self.current_time,
                    start_wall_ms: None,
                });
                self.dirty = true;
            }
            PlaybackMode::Preparing => {
                // Abort the epoch before it starts.
                tracing::info!("pause during prepare, epoch abandoned");
                self.ready_deadline = None;
                self.nav_prepare_at = None;
                self.mode = PlaybackMode::Paused;
                self.sink.send(ServerMessage::PlayerUpdate {
                    is_playing: false,
                    current_time: self.current_time,
                    start_wall_ms: None,
                });
                self.dirty = true;
            }
            PlaybackMode::Idle | PlaybackMode::Paused => {
                tracing::debug!(mode = ?self.mode, "pause ignored");
            }
        }
    }

    /// Open a new playback epoch and ask every client to pre-buffer.
    fn enter_preparing(&mut self, now: u64, start_time: f64) {
        self.registry.reset_ready_all();
        self.epoch += 1;
        self.mode = PlaybackMode::Preparing;
        self.start_wall_ms = Some(now as i64 - (start_time * 1000.0) as i64);
        self.next_tick_ms = None;
        self.nav_prepare_at = None;
        self.ready_deadline = Some(now + READY_TIMEOUT_MS);
        self.sink.send(ServerMessage::PreparePlayback {
            track_index: self.queue.current_index(),
            start_time,
            server_timestamp: now,
            epoch: self.epoch,
        });
        tracing::info!(
            epoch = self.epoch,
            track_index = self.queue.current_index(),
            start_time,
            "preparing playback"
        );
    }

    fn cmd_ready(
        &mut self,
        now: u64,
        session_id: &str,
        epoch: u64,
    ) -> Result<(), CoordinatorError> {
        if epoch != self.epoch {
            return Err(CoordinatorError::StaleEpoch {
                got: epoch,
                current: self.epoch,
            });
        }
        if !self.registry.mark_ready(session_id) {
            return Err(CoordinatorError::UnknownSession(session_id.to_string()));
        }
        // Convergence only counts once the prepare broadcast is out
        // (ready_deadline armed); during the post-navigation gap the new
        // epoch has not been announced yet.
        if self.mode == PlaybackMode::Preparing
            && self.ready_deadline.is_some()
            && self.registry.all_ready()
        {
            self.begin_playing(now);
        }
        Ok(())
    }

    fn fire_ready_timeout(&mut self, now: u64) {
        if self.mode != PlaybackMode::Preparing {
            return;
        }
        let (ready, total) = self.registry.snapshot_ready();
        tracing::warn!(ready, total, "ready timeout, starting with {ready}/{total} ready");
        self.begin_playing(now);
    }

    /// Preparing -> Playing: anchor the virtual clock and start ticking.
    fn begin_playing(&mut self, now: u64) {
        self.ready_deadline = None;
        self.nav_prepare_at = None;
        self.mode = PlaybackMode::Playing;
        self.start_wall_ms = Some(now as i64 - (self.current_time * 1000.0) as i64);
        self.next_tick_ms = Some(now + SYNC_INTERVAL_MS);
        self.sink.send(ServerMessage::SynchronizedPlay {
            start_time: self.current_time,
            server_timestamp: now,
            is_playing: true,
            epoch: self.epoch,
        });
        tracing::info!(epoch = self.epoch, start_time = self.current_time, "playing");
    }

    /// skip / previous / jumpTo: move the index, drop the old epoch, and
    /// (when the room was playing) re-prepare after a teardown gap.
    fn navigate(
        &mut self,
        now: u64,
        target: usize,
        what: &'static str,
    ) -> Result<(), CoordinatorError> {
        if self.queue.is_empty() || self.queue.jump_to(target).is_err() {
            return Err(CoordinatorError::IndexOutOfRange {
                what,
                index: target,
            });
        }
        let was_playing = self.mode == PlaybackMode::Playing;
        self.current_time = 0.0;
        self.registry.reset_ready_all();
        self.epoch += 1;
        self.next_tick_ms = None;
        self.ready_deadline = None;
        self.nav_prepare_at = None;

        if was_playing {
            self.mode = PlaybackMode::Preparing;
            // Clients tear the old pipeline down before the next
            // pre-buffer starts.
            self.nav_prepare_at = Some(now + NAV_PREPARE_DELAY_MS);
        } else {
            self.mode = PlaybackMode::Paused;
        }
        self.sink.send(ServerMessage::QueueUpdate {
            room: self.room_snapshot(),
        });
        self.dirty = true;
        tracing::info!(what, target, epoch = self.epoch, "navigated");
        Ok(())
    }

    fn fire_nav_prepare(&mut self, now: u64) {
        if self.mode != PlaybackMode::Preparing {
            return;
        }
        self.ready_deadline = Some(now + READY_TIMEOUT_MS);
        self.sink.send(ServerMessage::PreparePlayback {
            track_index: self.queue.current_index(),
            start_time: self.current_time,
            server_timestamp: now,
            epoch: self.epoch,
        });
    }

    fn cmd_seek(&mut self, now: u64, seconds: f64) -> Result<(), CoordinatorError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(CoordinatorError::InvalidSeek(seconds));
        }
        if self.queue.is_empty() {
            return Err(CoordinatorError::EmptyQueue);
        }
        self.current_time = seconds;
        let is_playing = self.mode == PlaybackMode::Playing;
        if is_playing {
            self.start_wall_ms = Some(now as i64 - (seconds * 1000.0) as i64);
        }
        self.sink.send(ServerMessage::PlayerUpdate {
            is_playing,
            current_time: seconds,
            start_wall_ms: if is_playing {
                self.start_wall_ms.map(|ms| ms.max(0) as u64)
            } else {
                None
            },
        });
        self.dirty = true;
        Ok(())
    }

    fn cmd_add(&mut self, track: Track) -> Result<(), CoordinatorError> {
        if !track.is_playable() {
            return Err(CoordinatorError::UnplayableTrack(track.id));
        }
        self.queue.append(track);
        self.sink.send(ServerMessage::QueueUpdate {
            room: self.room_snapshot(),
        });
        self.dirty = true;
        Ok(())
    }

    fn cmd_remove(&mut self, index: usize) -> Result<(), CoordinatorError> {
        let outcome = self.queue.remove_at(index).map_err(|e| match e {
            QueueError::OutOfRange(index) => CoordinatorError::IndexOutOfRange {
                what: "removeFromQueue",
                index,
            },
        })?;
        match outcome {
            RemoveOutcome::Untouched => {}
            RemoveOutcome::CurrentRemoved | RemoveOutcome::Emptied => {
                // The playing material is gone; stop where the queue now
                // points instead of guessing what the room wanted next.
                self.stop_playback();
            }
        }
        self.sink.send(ServerMessage::QueueUpdate {
            room: self.room_snapshot(),
        });
        self.dirty = true;
        Ok(())
    }

    fn cmd_reorder(
        &mut self,
        tracks: Vec<Track>,
        client_index: usize,
    ) -> Result<(), CoordinatorError> {
        if let Some(bad) = tracks.iter().find(|t| !t.is_playable()) {
            return Err(CoordinatorError::UnplayableTrack(bad.id.clone()));
        }
        let previous_id = self.queue.current().map(|t| t.id.clone());
        self.queue.reorder(tracks, client_index);
        let current_id = self.queue.current().map(|t| t.id.clone());

        if previous_id != current_id {
            // The reorder dropped the playing track on the floor.
            self.stop_playback();
        }
        self.sink.send(ServerMessage::QueueUpdate {
            room: self.room_snapshot(),
        });
        self.dirty = true;
        Ok(())
    }

    fn stop_playback(&mut self) {
        self.current_time = 0.0;
        self.next_tick_ms = None;
        self.ready_deadline = None;
        self.nav_prepare_at = None;
        if self.mode != PlaybackMode::Idle {
            self.mode = PlaybackMode::Paused;
        }
    }

    /// One sync tick: broadcast the virtual clock or detect end-of-track.
    fn tick(&mut self, now: u64) {
        if self.mode != PlaybackMode::Playing {
            self.next_tick_ms = None;
            return;
        }
        let Some(track) = self.queue.current() else {
            tracing::error!("playing with no current track, pausing");
            self.stop_playback();
            return;
        };
        let duration = track.duration;
        let current_time = self.live_time(now);
        if current_time >= duration {
            self.end_of_track(now);
            return;
        }
        self.sink.send(ServerMessage::SyncTime {
            current_time,
            is_playing: true,
            current_track_index: self.queue.current_index(),
            server_timestamp: now,
            epoch: self.epoch,
        });
        self.next_tick_ms = Some(now + SYNC_INTERVAL_MS);
    }

    fn end_of_track(&mut self, now: u64) {
        self.next_tick_ms = None;
        if self.queue.advance() {
            self.current_time = 0.0;
            self.registry.reset_ready_all();
            self.epoch += 1;
            self.mode = PlaybackMode::Preparing;
            self.nav_prepare_at = Some(now + NAV_PREPARE_DELAY_MS);
            self.sink.send(ServerMessage::QueueUpdate {
                room: self.room_snapshot(),
            });
            self.dirty = true;
            tracing::info!(
                track_index = self.queue.current_index(),
                epoch = self.epoch,
                "end of track, advancing"
            );
        } else {
            self.mode = PlaybackMode::Paused;
            self.current_time = 0.0;
            self.sink.send(ServerMessage::PlayerUpdate {
                is_playing: false,
                current_time: 0.0,
                start_wall_ms: None,
            });
            self.dirty = true;
            tracing::info!("end of queue, pausing");
        }
    }
}

/// Spawn the coordinator's single-writer task. Returns the command queue
/// handle the socket tasks feed.
pub fn spawn(
    mut coordinator: Coordinator,
    store: Option<Arc<crate::snapshot::SnapshotStore>>,
) -> mpsc::Sender<Command> {
    let (tx, mut rx) = mpsc::channel::<Command>(256);
    tokio::spawn(async move {
        loop {
            let now = coordinator.now();
            let wait = coordinator
                .next_deadline()
                .map(|at| Duration::from_millis(at.saturating_sub(now)));
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => coordinator.handle(cmd),
                    None => break,
                },
                _ = async {
                    match wait {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => std::future::pending::<()>().await,
                    }
                } => coordinator.poll(),
            }
            if coordinator.take_dirty() {
                if let Some(store) = &store {
                    let record = coordinator.persistable();
                    let store = store.clone();
                    // Fire and forget; the store logs its own failures.
                    tokio::spawn(async move { store.save(record).await });
                }
            }
        }
        tracing::info!("coordinator stopped");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use syncjam_core::clock::ManualClock;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ServerMessage>>);

    impl RoomSink for RecordingSink {
        fn send(&self, msg: ServerMessage) {
            self.0.lock().unwrap().push(msg);
        }
    }

    impl RecordingSink {
        fn drain(&self) -> Vec<ServerMessage> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Rig {
        clock: Arc<ManualClock>,
        registry: Arc<SessionRegistry>,
        sink: Arc<RecordingSink>,
        co: Coordinator,
    }

    fn track(id: &str, duration: f64) -> Track {
        Track {
            id: id.into(),
            source: "youtube".into(),
            duration,
            meta: serde_json::Value::Null,
        }
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new(100_000));
        let registry = Arc::new(SessionRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let co = Coordinator::new(
            registry.clone(),
            clock.clone() as Arc<dyn Clock>,
            sink.clone() as Arc<dyn RoomSink>,
        );
        Rig {
            clock,
            registry,
            sink,
            co,
        }
    }

    impl Rig {
        fn attach(&mut self, id: &str) {
            let (tx, _rx) = oneshot::channel();
            self.co.handle(Command::Attach {
                session_id: id.into(),
                reply: tx,
            });
        }

        fn add_track(&mut self, id: &str, duration: f64) {
            self.co.handle(Command::AddToQueue {
                track: track(id, duration),
            });
        }

        fn ready(&mut self, id: &str, epoch: u64) {
            self.co.handle(Command::ReadyToPlay {
                session_id: id.into(),
                epoch,
            });
        }

        /// Advance the clock tick by tick, polling like the shell would.
        fn run_for(&mut self, ms: u64) {
            let step = SYNC_INTERVAL_MS;
            let mut left = ms;
            while left > 0 {
                let delta = step.min(left);
                self.clock.advance(delta);
                self.co.poll();
                left -= delta;
            }
        }

        fn mode(&self) -> PlaybackMode {
            self.co.room_snapshot().mode
        }
    }

    fn cold_start(rig: &mut Rig) {
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        rig.sink.drain();
        rig.co.handle(Command::Play);
    }

    #[test]
    fn test_two_client_cold_start() {
        let mut rig = rig();
        cold_start(&mut rig);

        // Everyone is asked to pre-buffer epoch 1 from zero.
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::PreparePlayback {
                track_index: 0,
                epoch: 1,
                ..
            }]
        ));
        assert_eq!(rig.mode(), PlaybackMode::Preparing);

        // No syncTime while preparing.
        rig.run_for(1_000);
        assert!(rig.sink.drain().is_empty());

        rig.ready("x", 1);
        assert_eq!(rig.mode(), PlaybackMode::Preparing);
        rig.ready("y", 1);
        assert_eq!(rig.mode(), PlaybackMode::Playing);

        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::SynchronizedPlay {
                is_playing: true,
                epoch: 1,
                ..
            }]
        ));

        // The virtual clock now ticks every interval and is monotone.
        rig.run_for(1_000);
        let msgs = rig.sink.drain();
        assert_eq!(msgs.len(), 10);
        let mut last = (0u64, -1.0f64);
        for msg in msgs {
            let ServerMessage::SyncTime {
                current_time,
                server_timestamp,
                epoch,
                ..
            } = msg
            else {
                panic!("expected syncTime, got {msg:?}");
            };
            assert_eq!(epoch, 1);
            assert!(server_timestamp >= last.0);
            assert!(current_time >= last.1);
            last = (server_timestamp, current_time);
        }
    }

    #[test]
    fn test_ready_timeout_starts_with_stragglers() {
        let mut rig = rig();
        cold_start(&mut rig);
        rig.sink.drain();
        rig.ready("x", 1);

        // y never confirms; just shy of the timeout nothing happens.
        rig.run_for(READY_TIMEOUT_MS - SYNC_INTERVAL_MS);
        assert_eq!(rig.mode(), PlaybackMode::Preparing);
        assert!(rig.sink.drain().is_empty());

        rig.run_for(SYNC_INTERVAL_MS);
        assert_eq!(rig.mode(), PlaybackMode::Playing);
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.first(),
            Some(ServerMessage::SynchronizedPlay { epoch: 1, .. })
        ));
    }

    #[test]
    fn test_stale_ready_is_dropped() {
        let mut rig = rig();
        cold_start(&mut rig);
        rig.ready("x", 0);
        rig.ready("y", 7);
        assert_eq!(rig.mode(), PlaybackMode::Preparing);
    }

    fn play_until_playing(rig: &mut Rig) {
        rig.co.handle(Command::Play);
        rig.ready("x", rig.co.epoch);
        rig.ready("y", rig.co.epoch);
        assert_eq!(rig.mode(), PlaybackMode::Playing);
        rig.sink.drain();
    }

    #[test]
    fn test_mid_track_skip_reprepares_after_gap() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        rig.add_track("b", 200.0);
        play_until_playing(&mut rig);

        rig.run_for(42_000);
        rig.sink.drain();

        rig.co.handle(Command::Skip);
        let msgs = rig.sink.drain();
        let [ServerMessage::QueueUpdate { room }] = msgs.as_slice() else {
            panic!("expected an immediate queueUpdate, got {msgs:?}");
        };
        assert_eq!(room.current_index, 1);
        assert_eq!(room.current_time, 0.0);
        assert_eq!(rig.registry.snapshot_ready(), (0, 2));

        // The teardown gap: no syncTime, no prepare yet.
        rig.run_for(NAV_PREPARE_DELAY_MS - SYNC_INTERVAL_MS);
        assert!(rig.sink.drain().is_empty());

        rig.run_for(SYNC_INTERVAL_MS);
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::PreparePlayback {
                track_index: 1,
                epoch: 2,
                ..
            }]
        ));
    }

    #[test]
    fn test_skip_while_paused_stays_paused() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.add_track("b", 200.0);
        rig.sink.drain();

        rig.co.handle(Command::Skip);
        assert_eq!(rig.mode(), PlaybackMode::Paused);
        rig.run_for(2_000);
        // No prepare is ever scheduled.
        let msgs = rig.sink.drain();
        assert!(msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::PreparePlayback { .. })));
    }

    #[test]
    fn test_remove_current_last_rewinds_and_pauses() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        rig.add_track("b", 200.0);
        rig.co.handle(Command::JumpTo { index: 1 });
        play_until_playing(&mut rig);

        rig.co.handle(Command::RemoveFromQueue { index: 1 });
        let msgs = rig.sink.drain();
        let [ServerMessage::QueueUpdate { room }] = msgs.as_slice() else {
            panic!("expected queueUpdate, got {msgs:?}");
        };
        assert_eq!(room.queue.len(), 1);
        assert_eq!(room.queue[0].id, "a");
        assert_eq!(room.current_index, 0);
        assert_eq!(room.mode, PlaybackMode::Paused);
        assert_eq!(room.current_time, 0.0);

        // Ticker is dead.
        rig.run_for(1_000);
        assert!(rig.sink.drain().is_empty());
    }

    #[test]
    fn test_remove_last_track_empties_room() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.sink.drain();

        rig.co.handle(Command::RemoveFromQueue { index: 0 });
        let msgs = rig.sink.drain();
        let [ServerMessage::QueueUpdate { room }] = msgs.as_slice() else {
            panic!("expected queueUpdate, got {msgs:?}");
        };
        assert!(room.queue.is_empty());
        assert_eq!(room.current_index, 0);
        assert_eq!(room.current_time, 0.0);
    }

    #[test]
    fn test_play_pause_cooldown_drops_second_command() {
        let mut rig = rig();
        cold_start(&mut rig);
        rig.sink.drain();

        // Pause lands 100ms after play: inside the cooldown, dropped.
        rig.clock.advance(100);
        rig.co.handle(Command::Pause);
        assert_eq!(rig.mode(), PlaybackMode::Preparing);
        assert!(rig.sink.drain().is_empty());

        // The room still converges to Playing.
        rig.ready("x", 1);
        rig.ready("y", 1);
        assert_eq!(rig.mode(), PlaybackMode::Playing);
    }

    #[test]
    fn test_pause_freezes_the_virtual_clock() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        play_until_playing(&mut rig);

        rig.run_for(5_000);
        rig.co.handle(Command::Pause);
        let msgs = rig.sink.drain();
        let Some(ServerMessage::PlayerUpdate {
            is_playing: false,
            current_time,
            ..
        }) = msgs.last()
        else {
            panic!("expected playerUpdate, got {msgs:?}");
        };
        assert!((current_time - 5.0).abs() < 0.2, "froze at {current_time}");

        // No further syncTime after the pause.
        rig.run_for(2_000);
        assert!(rig.sink.drain().is_empty());
        assert_eq!(rig.co.room_snapshot().current_time, *current_time);
    }

    #[test]
    fn test_resume_continues_from_frozen_time() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.co.handle(Command::Play);
        rig.ready("x", 1);
        rig.sink.drain();

        rig.run_for(10_000);
        rig.co.handle(Command::Pause);
        rig.sink.drain();

        rig.clock.advance(60_000);
        rig.co.handle(Command::Play);
        let msgs = rig.sink.drain();
        let [ServerMessage::PreparePlayback {
            start_time, epoch, ..
        }] = msgs.as_slice()
        else {
            panic!("expected preparePlayback, got {msgs:?}");
        };
        assert_eq!(*epoch, 2);
        assert!((start_time - 10.0).abs() < 0.2, "resumed at {start_time}");
    }

    #[test]
    fn test_seek_while_playing_reanchors_clock() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        play_until_playing(&mut rig);

        rig.co.handle(Command::Seek { seconds: 90.0 });
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::PlayerUpdate {
                is_playing: true,
                current_time: t,
                start_wall_ms: Some(_),
            }] if *t == 90.0
        ));
        // Still Playing, no re-prepare; ticks continue from the new spot.
        assert_eq!(rig.mode(), PlaybackMode::Playing);
        rig.run_for(SYNC_INTERVAL_MS);
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::SyncTime { current_time, .. }] if *current_time >= 90.0
        ));
    }

    #[test]
    fn test_end_of_track_advances_and_reprepares() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 2.0);
        rig.add_track("b", 200.0);
        play_until_playing(&mut rig);

        rig.run_for(2_100);
        let msgs = rig.sink.drain();
        let queue_update = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::QueueUpdate { room } => Some(room.clone()),
                _ => None,
            })
            .expect("queueUpdate after end of track");
        assert_eq!(queue_update.current_index, 1);
        assert_eq!(queue_update.mode, PlaybackMode::Preparing);

        rig.run_for(NAV_PREPARE_DELAY_MS);
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.as_slice(),
            [ServerMessage::PreparePlayback {
                track_index: 1,
                epoch: 2,
                ..
            }]
        ));

        // Both clients confirm the new epoch and the room plays on.
        rig.ready("x", 2);
        rig.ready("y", 2);
        assert_eq!(rig.mode(), PlaybackMode::Playing);
    }

    #[test]
    fn test_end_of_queue_pauses_at_zero() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 1.0);
        rig.co.handle(Command::Play);
        rig.ready("x", 1);
        rig.sink.drain();

        rig.run_for(1_200);
        let msgs = rig.sink.drain();
        assert!(matches!(
            msgs.last(),
            Some(ServerMessage::PlayerUpdate {
                is_playing: false,
                current_time: t,
                ..
            }) if *t == 0.0
        ));
        assert_eq!(rig.mode(), PlaybackMode::Paused);
    }

    #[test]
    fn test_detach_of_straggler_unblocks_room() {
        let mut rig = rig();
        cold_start(&mut rig);
        rig.sink.drain();
        rig.ready("x", 1);
        assert_eq!(rig.mode(), PlaybackMode::Preparing);

        rig.co.handle(Command::Detach {
            session_id: "y".into(),
        });
        assert_eq!(rig.mode(), PlaybackMode::Playing);
    }

    #[test]
    fn test_room_emptied_while_preparing_pauses() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.sink.drain();
        rig.co.handle(Command::Play);
        rig.co.handle(Command::Detach {
            session_id: "x".into(),
        });
        assert_eq!(rig.mode(), PlaybackMode::Paused);

        // The abandoned ready-timeout never fires.
        rig.run_for(READY_TIMEOUT_MS + 1_000);
        let msgs = rig.sink.drain();
        assert!(msgs
            .iter()
            .all(|m| !matches!(m, ServerMessage::SynchronizedPlay { .. })));
    }

    #[test]
    fn test_reorder_follows_current_track() {
        let mut rig = rig();
        rig.attach("x");
        rig.attach("y");
        rig.add_track("a", 180.0);
        rig.add_track("b", 200.0);
        rig.add_track("c", 90.0);
        play_until_playing(&mut rig);

        rig.co.handle(Command::Reorder {
            queue: vec![track("c", 90.0), track("a", 180.0), track("b", 200.0)],
            current_track_index: 0,
        });
        let msgs = rig.sink.drain();
        let [ServerMessage::QueueUpdate { room }] = msgs.as_slice() else {
            panic!("expected queueUpdate, got {msgs:?}");
        };
        // Track "a" was playing and is still current at its new position.
        assert_eq!(room.current_index, 1);
        assert_eq!(room.mode, PlaybackMode::Playing);
    }

    #[test]
    fn test_epoch_strictly_increases_across_prepares() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.add_track("b", 180.0);
        rig.sink.drain();

        rig.co.handle(Command::Play);
        assert_eq!(rig.co.epoch, 1);
        rig.ready("x", 1);

        rig.clock.advance(1_000);
        rig.co.handle(Command::Skip);
        assert_eq!(rig.co.epoch, 2);
        assert_eq!(rig.registry.snapshot_ready(), (0, 1));
    }

    #[test]
    fn test_protocol_rejections_are_typed_and_leave_state_alone() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        rig.sink.drain();

        assert_eq!(
            rig.co.apply(Command::JumpTo { index: 7 }),
            Err(CoordinatorError::IndexOutOfRange {
                what: "jumpTo",
                index: 7
            })
        );
        assert_eq!(
            rig.co.apply(Command::Previous),
            Err(CoordinatorError::IndexOutOfRange {
                what: "previous",
                index: 0
            })
        );
        assert_eq!(
            rig.co.apply(Command::Seek { seconds: -3.0 }),
            Err(CoordinatorError::InvalidSeek(-3.0))
        );
        assert_eq!(
            rig.co.apply(Command::ReadyToPlay {
                session_id: "x".into(),
                epoch: 9
            }),
            Err(CoordinatorError::StaleEpoch { got: 9, current: 0 })
        );
        assert_eq!(
            rig.co.apply(Command::ReadyToPlay {
                session_id: "ghost".into(),
                epoch: 0
            }),
            Err(CoordinatorError::UnknownSession("ghost".into()))
        );
        assert_eq!(
            rig.co.apply(Command::AddToQueue {
                track: track("bad", 0.0)
            }),
            Err(CoordinatorError::UnplayableTrack("bad".into()))
        );

        // Nothing was broadcast and nothing moved.
        assert!(rig.sink.drain().is_empty());
        assert_eq!(rig.mode(), PlaybackMode::Idle);
        assert_eq!(rig.co.room_snapshot().queue.len(), 1);
    }

    #[test]
    fn test_health_report() {
        let mut rig = rig();
        rig.attach("x");
        rig.add_track("a", 180.0);
        let (tx, mut rx) = oneshot::channel();
        rig.co.handle(Command::Health { reply: tx });
        let health = rx.try_recv().unwrap();
        assert_eq!(health.clients, 1);
        assert_eq!(health.queue_len, 1);
        assert_eq!(health.mode, PlaybackMode::Idle);
    }
}
