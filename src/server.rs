//! The relay server: signaling endpoint, peer negotiation, and the playback
//! engine that owns the queue, the registry, and the MIDI device.
use log::info;
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use crate::common::box_error::BoxError;
use crate::common::config::Config;
use crate::midi::sink::MidiSink;
use crate::utils;

pub mod client;
pub mod engine_message;
pub mod peer;
pub mod playback_queue;
pub mod relay_engine;
pub mod signaling;
pub mod telemetry;

pub const DEFAULT_PORT: u32 = 5000;

/// call this from the main function to start the whole thing running.
///
/// It loads settings.json, opens the MIDI output, binds the combined
/// HTTP/websocket listener, and then turns the calling thread into the
/// playback engine loop.  Only a failure to bind the port is fatal; a missing
/// MIDI device just puts the sink into null mode.
pub fn run(port_override: Option<u32>) -> Result<(), BoxError> {
    let mut config = Config::build();
    config.load_from_file()?;
    let port = match port_override {
        Some(p) => p,
        None => config.get_u32_value("port", DEFAULT_PORT),
    };
    let device_hint = String::from(config.get_value("midi_device", ""));

    let sink = MidiSink::build(&device_hint);
    let midi_available = sink.is_connected();

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port))?;
    info!(
        "jcmp relay listening on port {} (midi connected: {})",
        port, midi_available
    );

    let (engine_tx, engine_rx) = mpsc::channel();
    let listener_tx = engine_tx.clone();
    let _listener_handle = thread::spawn(move || {
        signaling::listener_thread(listener, listener_tx, midi_available);
    });

    let mut engine = relay_engine::RelayEngine::build(
        engine_rx,
        engine_tx,
        Box::new(sink),
        midi_available,
        utils::debug_events_enabled(),
    );
    engine.run()
}
