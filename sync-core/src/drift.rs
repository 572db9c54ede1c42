//! Client-side drift correction policy.
//!
//! Decides, for each authoritative `syncTime`, whether the local media
//! clock gets left alone, nudged with a temporary playback-rate change, or
//! hard-seeked. The policy is deliberately hysteretic: corrections are
//! rate-limited, the tolerance widens after repeated corrections, and an
//! active rate nudge suppresses further changes so the loop cannot
//! oscillate.

use crate::consts::{
    CLIENT_RESYNC_COOLDOWN_MS, DEGRADED_COOLDOWN_MS, DRIFT_HARD_THRESHOLD, DRIFT_SOFT_THRESHOLD,
    DRIFT_SOFT_THRESHOLD_RELAXED, MAX_CONSECUTIVE_RESYNCS, RESYNC_RECOVERY_MS, SOFT_CORRECTION_MS,
    SOFT_RATE_FAST, SOFT_RATE_SLOW,
};

/// What the media element should do about the measured drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftAction {
    None,
    /// Run at `rate` until the soft window closes.
    SoftCorrect { rate: f64 },
    /// Jump straight to `target` seconds.
    HardSeek { target: f64 },
}

#[derive(Debug, Default)]
pub struct DriftCorrector {
    last_correction_ms: Option<u64>,
    consecutive: u32,
    soft_until_ms: Option<u64>,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one `syncTime` sample.
    ///
    /// `server_time` and `local_time` are seconds into the track;
    /// `latency_ms` is the measured one-way latency used to lead a hard
    /// seek target.
    pub fn evaluate(
        &mut self,
        now_ms: u64,
        server_time: f64,
        local_time: f64,
        latency_ms: f64,
    ) -> DriftAction {
        // An in-flight rate nudge owns the media element.
        if self.soft_active(now_ms) {
            return DriftAction::None;
        }

        // A quiet stretch returns the corrector to normal tolerance.
        if let Some(last) = self.last_correction_ms {
            if now_ms.saturating_sub(last) >= RESYNC_RECOVERY_MS {
                self.consecutive = 0;
            }
        }

        let cooldown = if self.consecutive >= MAX_CONSECUTIVE_RESYNCS {
            DEGRADED_COOLDOWN_MS
        } else {
            CLIENT_RESYNC_COOLDOWN_MS
        };
        if let Some(last) = self.last_correction_ms {
            if now_ms.saturating_sub(last) < cooldown {
                return DriftAction::None;
            }
        }

        let threshold = if self.consecutive > 2 {
            DRIFT_SOFT_THRESHOLD_RELAXED
        } else {
            DRIFT_SOFT_THRESHOLD
        };
        let drift = server_time - local_time;
        if drift.abs() < threshold {
            return DriftAction::None;
        }

        self.last_correction_ms = Some(now_ms);
        self.consecutive += 1;

        if drift.abs() >= DRIFT_HARD_THRESHOLD {
            tracing::debug!(drift, "hard resync");
            DriftAction::HardSeek {
                target: server_time + latency_ms / 1000.0,
            }
        } else {
            self.soft_until_ms = Some(now_ms + SOFT_CORRECTION_MS);
            let rate = if drift > 0.0 {
                SOFT_RATE_FAST
            } else {
                SOFT_RATE_SLOW
            };
            tracing::debug!(drift, rate, "soft resync");
            DriftAction::SoftCorrect { rate }
        }
    }

    /// Close the soft window once it has elapsed. Returns the rate to
    /// restore when the window just closed.
    pub fn poll(&mut self, now_ms: u64) -> Option<f64> {
        match self.soft_until_ms {
            Some(until) if now_ms >= until => {
                self.soft_until_ms = None;
                Some(1.0)
            }
            _ => None,
        }
    }

    pub fn soft_active(&self, now_ms: u64) -> bool {
        matches!(self.soft_until_ms, Some(until) if now_ms < until)
    }

    /// Forget history across an epoch boundary.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
