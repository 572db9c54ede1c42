//! Monotonic clock abstraction and client-side offset estimation.
//!
//! Every timestamp stamped into or compared against the protocol goes
//! through [`Clock`], so drift math is consistent and tests can drive the
//! whole machine with a [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real clock, monotonic since construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for tests.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Estimated server-clock offset derived from a ping/pong exchange.
#[derive(Debug, Clone, Copy)]
pub struct ClockOffset {
    /// server_clock - client_clock, in milliseconds.
    pub offset_ms: i64,
    /// Round trip time in milliseconds.
    pub rtt_ms: u64,
}

impl ClockOffset {
    /// Derive offset and RTT from a pong.
    ///
    /// `t0`: client send time, `server_ts`: server receive/transmit time,
    /// `t3`: client receive time. The server stamps one timestamp for both
    /// receive and transmit, so this is the two-point form of the NTP
    /// exchange: the server time is compared against the midpoint of the
    /// client's send/receive pair.
    pub fn from_pong(t0: u64, server_ts: u64, t3: u64) -> Self {
        let rtt_ms = t3.saturating_sub(t0);
        let midpoint = (t0 as i64 + t3 as i64) / 2;
        Self {
            offset_ms: server_ts as i64 - midpoint,
            rtt_ms,
        }
    }
}
