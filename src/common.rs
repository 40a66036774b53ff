//! These modules are shared between the wire handling code and the engine.
pub mod box_error;
pub mod config;
pub mod midi_message;
pub mod stream_stat;
