//! jcmp_relay - real time MIDI relay server
//!
//! Accepts musical performance events from browser clients and plays them on a
//! local MIDI output.  Two lanes are offered to every client: an immediate lane
//! over the reliable signaling websocket that fires MIDI the moment it arrives,
//! and a performance lane over an unreliable webrtc data channel whose packets
//! carry client timestamps.  Performance events are held in a per-client
//! adaptive jitter buffer and released by a single playback dispatcher so that
//! inter-onset spacing stays stable even when network arrival is bursty.

pub mod common;
pub mod midi;
pub mod server;
pub mod utils;
