//! MIDI device output for the relay.
pub mod sink;
