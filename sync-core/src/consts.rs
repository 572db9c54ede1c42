//! Wire-visible protocol constants, shared by server and clients.

/// Period of the authoritative `syncTime` broadcast while playing.
pub const SYNC_INTERVAL_MS: u64 = 100;

/// How long the server waits in Preparing before starting without
/// the remaining unready clients.
pub const READY_TIMEOUT_MS: u64 = 10_000;

/// Minimum gap between accepted play/pause transport commands.
pub const PLAY_PAUSE_COOLDOWN_MS: u64 = 300;

/// Gap between a queue navigation and the `preparePlayback` broadcast,
/// giving clients time to tear down the previous audio pipeline.
pub const NAV_PREPARE_DELAY_MS: u64 = 500;

/// Drift below this is left alone (seconds).
pub const DRIFT_SOFT_THRESHOLD: f64 = 0.3;

/// Relaxed threshold applied after repeated corrections (seconds).
pub const DRIFT_SOFT_THRESHOLD_RELAXED: f64 = 0.5;

/// Drift at or above this triggers a hard seek instead of a rate nudge (seconds).
pub const DRIFT_HARD_THRESHOLD: f64 = 1.0;

/// Minimum gap between two client-side drift corrections.
pub const CLIENT_RESYNC_COOLDOWN_MS: u64 = 2_000;

/// Correction cooldown while the client is in the degraded window.
pub const DEGRADED_COOLDOWN_MS: u64 = 5_000;

/// Consecutive corrections that trip the degraded window.
pub const MAX_CONSECUTIVE_RESYNCS: u32 = 3;

/// Quiet time after which the corrector returns to normal tolerance.
pub const RESYNC_RECOVERY_MS: u64 = 10_000;

/// Duration of a soft playback-rate correction.
pub const SOFT_CORRECTION_MS: u64 = 500;

/// Playback rate while catching up to a server that is ahead.
pub const SOFT_RATE_FAST: f64 = 1.10;

/// Playback rate while waiting for a server that is behind.
pub const SOFT_RATE_SLOW: f64 = 0.90;

/// Interval between client latency pings.
pub const PING_INTERVAL_MS: u64 = 5_000;

/// Seconds of media the client buffers past the start position before
/// reporting ready.
pub const MIN_PREBUFFER_SECS: f64 = 3.0;

/// How long the client keeps pre-buffering before giving up and
/// reporting ready anyway.
pub const PREBUFFER_TIMEOUT_MS: u64 = 10_000;

/// One-way latency above this is discarded as a bogus measurement (ms).
pub const MAX_LATENCY_MS: f64 = 10_000.0;

/// Client-side UI cooldown for the play/pause button.
pub const UI_PLAY_PAUSE_COOLDOWN_MS: u64 = 400;

/// Transition window after a `queueUpdate` that moved the current index.
pub const QUEUE_CHANGE_TRANSITION_MS: u64 = 3_000;

/// Transition window after a `synchronizedPlay` lands.
pub const PLAY_TRANSITION_MS: u64 = 1_000;

/// Cadence of the client health watchdog.
pub const WATCHDOG_INTERVAL_MS: u64 = 2_000;

/// Media position must advance within this window while playing,
/// or the watchdog reloads the source.
pub const WATCHDOG_STALL_MS: u64 = 3_000;
