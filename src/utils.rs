//! grab bag of functions used across the board.
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

/// wall clock in milliseconds since the epoch.  All deadlines and latency
/// math in the relay are done in this unit.
pub fn get_milli_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis()
}

/// check the JCMP_DEBUG environment variable.  When set to 1 the engine will
/// emit per-event logs (lane latency, playback error, inter-playback interval,
/// buffer sizes).  Read once at startup, never on the hot path.
pub fn debug_events_enabled() -> bool {
    match env::var("JCMP_DEBUG") {
        Ok(v) => v == "1",
        Err(_) => false,
    }
}
