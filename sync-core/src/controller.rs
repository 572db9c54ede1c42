//! Client-side playback controller.
//!
//! Mirrors the server's epoch machine from the other end of the wire:
//! measures latency, pre-buffers and confirms readiness when a new epoch
//! opens, schedules the compensated start on `synchronizedPlay`, and keeps
//! the media element chasing the authoritative clock with bounded
//! corrections.
//!
//! The media element is abstracted behind [`MediaSink`] so the CLI client
//! and the tests drive the same state machine a browser player would.

use std::sync::Arc;

use crate::clock::{Clock, ClockOffset};
use crate::consts::{
    MIN_PREBUFFER_SECS, PING_INTERVAL_MS, PLAY_TRANSITION_MS, PREBUFFER_TIMEOUT_MS,
    QUEUE_CHANGE_TRANSITION_MS, UI_PLAY_PAUSE_COOLDOWN_MS, WATCHDOG_INTERVAL_MS,
    WATCHDOG_STALL_MS,
};
use crate::drift::{DriftAction, DriftCorrector};
use crate::messages::{ClientMessage, PlaybackMode, RoomSnapshot, ServerMessage};
use crate::queue::Track;

/// Minimal surface of an audio element.
pub trait MediaSink {
    fn load(&mut self, track: &Track);
    fn seek(&mut self, seconds: f64);
    fn play(&mut self);
    fn pause(&mut self);
    fn set_rate(&mut self, rate: f64);
    /// Current media position in seconds.
    fn position(&self) -> f64;
    /// Seconds of decodable media buffered past `from`.
    fn buffered_ahead(&self, from: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    /// A new source was handed to the sink, no data seen yet.
    Loading,
    /// Data is arriving; waiting for enough depth to report ready.
    PreBuffering,
    Playing,
    Paused,
}

/// Stalls tolerated before the controller gives up on the source and
/// escalates to a skip.
const MAX_STALL_RELOADS: u32 = 2;

struct Prebuffer {
    start_time: f64,
    epoch: u64,
    deadline_ms: u64,
    ready_sent: bool,
}

pub struct ClientController<S: MediaSink> {
    clock: Arc<dyn Clock>,
    sink: S,
    state: ControllerState,
    room: Option<RoomSnapshot>,
    loaded_track: Option<String>,
    epoch: u64,
    latency_ms: f64,
    server_offset: Option<ClockOffset>,
    corrector: DriftCorrector,
    transition_until_ms: Option<u64>,
    prebuffer: Option<Prebuffer>,
    next_ping_ms: u64,
    next_watchdog_ms: u64,
    last_progress_pos: f64,
    last_progress_ms: u64,
    stall_reloads: u32,
    is_playing: bool,
    last_ui_toggle_ms: Option<u64>,
}

impl<S: MediaSink> ClientController<S> {
    pub fn new(clock: Arc<dyn Clock>, sink: S) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            sink,
            state: ControllerState::Idle,
            room: None,
            loaded_track: None,
            epoch: 0,
            latency_ms: 0.0,
            server_offset: None,
            corrector: DriftCorrector::new(),
            transition_until_ms: None,
            prebuffer: None,
            next_ping_ms: now,
            next_watchdog_ms: now + WATCHDOG_INTERVAL_MS,
            last_progress_pos: 0.0,
            last_progress_ms: now,
            stall_reloads: 0,
            is_playing: false,
            last_ui_toggle_ms: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn transitioning(&self, now: u64) -> bool {
        matches!(self.transition_until_ms, Some(until) if now < until)
    }

    fn current_track(&self) -> Option<Track> {
        let room = self.room.as_ref()?;
        room.queue.get(room.current_index).cloned()
    }

    fn load_if_needed(&mut self, track: &Track) {
        if self.loaded_track.as_deref() != Some(track.id.as_str()) {
            self.sink.load(track);
            self.loaded_track = Some(track.id.clone());
        }
    }

    /// Feed one server message through the state machine. Returns the
    /// messages to send back.
    pub fn handle_server(&mut self, msg: ServerMessage) -> Vec<ClientMessage> {
        let now = self.now();
        let mut out = Vec::new();
        match msg {
            ServerMessage::RoomState { room } => {
                self.epoch = room.epoch;
                let playing = room.mode == PlaybackMode::Playing;
                self.room = Some(room);
                // Late join into a live room: catch up immediately and let
                // drift correction trim the error.
                if playing {
                    if let Some(track) = self.current_track() {
                        let start = self.room.as_ref().map(|r| r.current_time).unwrap_or(0.0);
                        self.load_if_needed(&track);
                        self.sink.seek(start + self.latency_ms / 1000.0);
                        self.sink.play();
                        self.enter_playing(now);
                    }
                }
            }
            ServerMessage::QueueUpdate { room } => {
                let index_changed = self
                    .room
                    .as_ref()
                    .map(|prev| {
                        prev.current_index != room.current_index
                            || prev.queue.get(prev.current_index).map(|t| &t.id)
                                != room.queue.get(room.current_index).map(|t| &t.id)
                    })
                    .unwrap_or(true);
                if index_changed {
                    self.transition_until_ms = Some(now + QUEUE_CHANGE_TRANSITION_MS);
                }
                if room.mode != PlaybackMode::Playing && self.is_playing {
                    self.sink.pause();
                    self.is_playing = false;
                    self.state = ControllerState::Paused;
                }
                self.room = Some(room);
            }
            ServerMessage::PreparePlayback {
                track_index,
                start_time,
                server_timestamp: _,
                epoch,
            } => {
                let Some(track) = self
                    .room
                    .as_ref()
                    .and_then(|r| r.queue.get(track_index).cloned())
                else {
                    tracing::warn!(track_index, "preparePlayback for unknown track");
                    return out;
                };
                self.epoch = epoch;
                self.corrector.reset();
                self.sink.set_rate(1.0);
                self.sink.pause();
                self.is_playing = false;
                self.load_if_needed(&track);
                self.state = ControllerState::Loading;
                self.prebuffer = Some(Prebuffer {
                    start_time,
                    epoch,
                    deadline_ms: now + PREBUFFER_TIMEOUT_MS,
                    ready_sent: false,
                });
                // Drain any immediately-available buffer.
                out.extend(self.poll_prebuffer(now));
            }
            ServerMessage::SynchronizedPlay {
                start_time,
                server_timestamp,
                is_playing,
                epoch,
            } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, current = self.epoch, "stale synchronizedPlay");
                    return out;
                }
                let adjusted = start_time
                    + self.elapsed_since(server_timestamp, now) / 1000.0
                    + self.latency_ms / 1000.0;
                self.prebuffer = None;
                self.sink.seek(adjusted);
                self.sink.set_rate(1.0);
                if is_playing {
                    self.sink.play();
                    self.enter_playing(now);
                    self.transition_until_ms = Some(now + PLAY_TRANSITION_MS);
                }
            }
            ServerMessage::SyncTime {
                current_time,
                is_playing,
                current_track_index: _,
                server_timestamp: _,
                epoch,
            } => {
                if epoch != self.epoch || self.transitioning(now) {
                    return out;
                }
                if self.state != ControllerState::Playing || !is_playing {
                    return out;
                }
                let local = self.sink.position();
                match self
                    .corrector
                    .evaluate(now, current_time, local, self.latency_ms)
                {
                    DriftAction::None => {}
                    DriftAction::SoftCorrect { rate } => self.sink.set_rate(rate),
                    DriftAction::HardSeek { target } => self.sink.seek(target),
                }
            }
            ServerMessage::PlayerUpdate {
                is_playing,
                current_time,
                start_wall_ms: _,
            } => {
                if is_playing {
                    // A seek while the room keeps playing.
                    self.sink.seek(current_time + self.latency_ms / 1000.0);
                    if self.state != ControllerState::Playing {
                        self.sink.play();
                        self.enter_playing(now);
                    }
                } else {
                    self.sink.pause();
                    self.is_playing = false;
                    self.state = ControllerState::Paused;
                    if let Some(room) = self.room.as_mut() {
                        room.current_time = current_time;
                    }
                }
            }
            ServerMessage::Pong {
                client_timestamp,
                server_timestamp,
                latency,
            } => {
                if latency >= 0.0 {
                    self.latency_ms = latency;
                }
                self.server_offset = Some(ClockOffset::from_pong(
                    client_timestamp,
                    server_timestamp,
                    now,
                ));
            }
            ServerMessage::ForceReload => {
                tracing::info!("forced reload of current source");
                self.loaded_track = None;
                if let Some(track) = self.current_track() {
                    let pos = self.sink.position();
                    self.load_if_needed(&track);
                    self.sink.seek(pos);
                    if self.is_playing {
                        self.sink.play();
                    }
                }
            }
        }
        out
    }

    /// Drive the controller's timers. Call at least every few hundred ms.
    pub fn poll(&mut self) -> Vec<ClientMessage> {
        let now = self.now();
        let mut out = Vec::new();

        if now >= self.next_ping_ms {
            out.push(ClientMessage::Ping {
                client_timestamp: now,
            });
            self.next_ping_ms = now + PING_INTERVAL_MS;
        }

        if let Some(rate) = self.corrector.poll(now) {
            self.sink.set_rate(rate);
        }

        out.extend(self.poll_prebuffer(now));

        if now >= self.next_watchdog_ms {
            self.next_watchdog_ms = now + WATCHDOG_INTERVAL_MS;
            out.extend(self.run_watchdog(now));
        }

        out
    }

    fn poll_prebuffer(&mut self, now: u64) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        let Some(pb) = self.prebuffer.as_mut() else {
            return out;
        };
        if pb.ready_sent {
            return out;
        }
        let buffered = self.sink.buffered_ahead(pb.start_time);
        if buffered > 0.0 && self.state == ControllerState::Loading {
            self.state = ControllerState::PreBuffering;
        }
        let timed_out = now >= pb.deadline_ms;
        if buffered >= MIN_PREBUFFER_SECS || timed_out {
            if timed_out {
                tracing::warn!(buffered, "pre-buffer timed out, reporting ready anyway");
            }
            self.sink.seek(pb.start_time);
            pb.ready_sent = true;
            self.state = ControllerState::PreBuffering;
            out.push(ClientMessage::ReadyToPlay { epoch: pb.epoch });
        }
        out
    }

    fn run_watchdog(&mut self, now: u64) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        if self.state != ControllerState::Playing || !self.is_playing {
            self.last_progress_ms = now;
            return out;
        }
        let pos = self.sink.position();
        if pos > self.last_progress_pos {
            self.last_progress_pos = pos;
            self.last_progress_ms = now;
            self.stall_reloads = 0;
            return out;
        }
        if now.saturating_sub(self.last_progress_ms) < WATCHDOG_STALL_MS {
            return out;
        }
        self.stall_reloads += 1;
        if self.stall_reloads > MAX_STALL_RELOADS {
            tracing::error!("media stalled repeatedly, skipping track");
            self.stall_reloads = 0;
            out.push(ClientMessage::Skip);
            return out;
        }
        tracing::warn!(pos, "media stalled, reloading source");
        if let Some(track) = self.current_track() {
            self.loaded_track = None;
            self.load_if_needed(&track);
            self.sink.seek(pos);
            self.sink.play();
        }
        self.last_progress_ms = now;
        out
    }

    fn enter_playing(&mut self, now: u64) {
        self.state = ControllerState::Playing;
        self.is_playing = true;
        self.last_progress_pos = self.sink.position();
        self.last_progress_ms = now;
    }

    /// Milliseconds elapsed since `server_timestamp`, measured on the
    /// server's clock when an offset estimate exists.
    fn elapsed_since(&self, server_timestamp: u64, now: u64) -> f64 {
        match self.server_offset {
            Some(offset) => {
                let server_now = now as i64 + offset.offset_ms;
                (server_now - server_timestamp as i64).max(0) as f64
            }
            None => 0.0,
        }
    }

    /// Play button, debounced. The server cooldown is the authoritative
    /// defense; this just suppresses double clicks.
    pub fn request_play(&mut self) -> Option<ClientMessage> {
        self.ui_guarded(ClientMessage::Play)
    }

    /// Pause button, debounced.
    pub fn request_pause(&mut self) -> Option<ClientMessage> {
        self.ui_guarded(ClientMessage::Pause)
    }

    fn ui_guarded(&mut self, msg: ClientMessage) -> Option<ClientMessage> {
        let now = self.now();
        if let Some(last) = self.last_ui_toggle_ms {
            if now.saturating_sub(last) < UI_PLAY_PAUSE_COOLDOWN_MS {
                return None;
            }
        }
        self.last_ui_toggle_ms = Some(now);
        Some(msg)
    }
}
