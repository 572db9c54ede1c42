//! Session registry: the set of currently-connected clients, their
//! measured latency, and their epoch-scoped ready bits.
//!
//! Latency is recorded straight from the socket task; everything that can
//! change a playback transition (ready bits) is only touched from the
//! coordinator, which keeps those mutations totally ordered.

use dashmap::DashMap;

use syncjam_core::consts::MAX_LATENCY_MS;

#[derive(Debug, Clone)]
pub struct Session {
    /// Display name announced by the client, if it sent one.
    pub name: Option<String>,
    /// Estimated one-way latency in ms.
    pub latency_ms: f64,
    pub last_ping_at: u64,
    /// Pre-buffer confirmation for the current playback epoch.
    pub ready: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-attaching an existing session keeps its state.
    pub fn attach(&self, session_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert(Session {
                name: None,
                latency_ms: 0.0,
                last_ping_at: 0,
                ready: false,
            });
    }

    pub fn detach(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Record the display name a client announced with its join message.
    pub fn set_name(&self, session_id: &str, name: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.name = Some(name.to_string());
        }
    }

    /// Store one latency measurement from a ping round trip.
    ///
    /// Negative round trips (client clock ahead of ours) and one-way
    /// estimates beyond 10s are measurement garbage and are dropped, not
    /// clamped. Returns the accepted one-way latency.
    pub fn record_latency(&self, session_id: &str, rtt_ms: i64, now_ms: u64) -> Option<f64> {
        if rtt_ms < 0 {
            tracing::debug!(session_id, rtt_ms, "negative round trip dropped");
            return None;
        }
        let latency_ms = rtt_ms as f64 / 2.0;
        if latency_ms > MAX_LATENCY_MS {
            tracing::debug!(session_id, latency_ms, "absurd latency dropped");
            return None;
        }
        let mut session = self.sessions.get_mut(session_id)?;
        session.latency_ms = latency_ms;
        session.last_ping_at = now_ms;
        Some(latency_ms)
    }

    /// Returns false for sessions the registry does not know.
    pub fn mark_ready(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.ready = true;
                true
            }
            None => false,
        }
    }

    pub fn reset_ready_all(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.ready = false;
        }
    }

    /// `(ready, total)` for the current epoch.
    pub fn snapshot_ready(&self) -> (usize, usize) {
        let total = self.sessions.len();
        let ready = self.sessions.iter().filter(|s| s.ready).count();
        (ready, total)
    }

    pub fn all_ready(&self) -> bool {
        let (ready, total) = self.snapshot_ready();
        total > 0 && ready == total
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
