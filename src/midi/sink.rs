//! low level MIDI output device handling
//!
//! The engine and the immediate lane only talk to the [`MidiOut`] trait.  The
//! [`MidiSink`] implementation drives a real (or virtual) port through midir.
//! Channels are 1 based on the trait and translated to 0 based status nibbles
//! here at the device boundary.
//!
//! The sink must never fail its caller.  A send error is logged and swallowed,
//! and when no device could be opened at all the sink runs in null mode: it
//! logs once and then silently discards everything.
use log::{error, info, warn};
use midir::{MidiOutput, MidiOutputConnection};

const STATUS_NOTE_OFF: u8 = 0x80;
const STATUS_NOTE_ON: u8 = 0x90;
const STATUS_CONTROL_CHANGE: u8 = 0xB0;
const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
const STATUS_START: u8 = 0xFA;
const STATUS_CONTINUE: u8 = 0xFB;
const STATUS_STOP: u8 = 0xFC;

/// output names we will grab first if we see them
const PREFERRED_NAMES: [&str; 4] = ["loopMIDI", "MIDI Controller", "Virtual", "IAC"];
/// name used when we have to create our own virtual port
const VIRTUAL_PORT_NAME: &str = "Web MIDI Controller";

/// the device facing surface of the relay
#[cfg_attr(test, mockall::automock)]
pub trait MidiOut {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8);
    fn note_off(&mut self, channel: u8, note: u8, velocity: u8);
    fn control_change(&mut self, channel: u8, control: u8, value: u8);
    fn program_change(&mut self, channel: u8, program: u8);
    fn transport_start(&mut self);
    fn transport_stop(&mut self);
    fn transport_continue(&mut self);
}

pub struct MidiSink {
    connection: Option<MidiOutputConnection>,
    warned_null: bool,
}

impl MidiSink {
    /// open the best output we can find.  The hint (from settings.json) is
    /// tried before the built in preference list.  Never fails; if nothing
    /// can be opened the sink comes up in null mode.
    pub fn build(device_hint: &str) -> MidiSink {
        match Self::open_output(device_hint) {
            Some(connection) => MidiSink {
                connection: Some(connection),
                warned_null: false,
            },
            None => {
                warn!("no MIDI output could be opened, running in null mode");
                MidiSink {
                    connection: None,
                    warned_null: false,
                }
            }
        }
    }

    /// build a sink with no device at all.  Used by tests.
    pub fn null() -> MidiSink {
        MidiSink {
            connection: None,
            warned_null: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn open_output(device_hint: &str) -> Option<MidiOutputConnection> {
        // pass one: a port whose name matches the hint or the preference list
        let midi_out = match MidiOutput::new("jcmp-relay") {
            Ok(m) => m,
            Err(e) => {
                error!("midi subsystem unavailable: {}", e);
                return None;
            }
        };
        let ports = midi_out.ports();
        let mut wanted: Vec<&str> = Vec::new();
        if !device_hint.is_empty() {
            wanted.push(device_hint);
        }
        wanted.extend(PREFERRED_NAMES);
        let mut pick = None;
        'search: for frag in &wanted {
            for port in &ports {
                let name = match midi_out.port_name(port) {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                if name.contains(frag) {
                    pick = Some((port.clone(), name));
                    break 'search;
                }
            }
        }
        if let Some((port, name)) = pick {
            info!("opening MIDI output: {}", name);
            return match midi_out.connect(&port, "jcmp-relay-out") {
                Ok(connection) => Some(connection),
                Err(_) => {
                    warn!("could not connect to {}", name);
                    Self::open_fallback()
                }
            };
        }
        // pass two: make our own virtual port
        #[cfg(unix)]
        {
            use midir::os::unix::VirtualOutput;
            match midi_out.create_virtual(VIRTUAL_PORT_NAME) {
                Ok(connection) => {
                    info!("created virtual MIDI output: {}", VIRTUAL_PORT_NAME);
                    Some(connection)
                }
                // pass three: whatever is first
                Err(_) => Self::open_fallback(),
            }
        }
        #[cfg(not(unix))]
        Self::open_fallback()
    }

    fn open_fallback() -> Option<MidiOutputConnection> {
        let midi_out = MidiOutput::new("jcmp-relay").ok()?;
        let ports = midi_out.ports();
        let port = ports.first()?;
        let name = midi_out.port_name(port).unwrap_or_default();
        match midi_out.connect(port, "jcmp-relay-out") {
            Ok(connection) => {
                info!("opening fallback MIDI output: {}", name);
                Some(connection)
            }
            Err(_) => None,
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        match &mut self.connection {
            Some(connection) => {
                if let Err(e) = connection.send(bytes) {
                    // transient device error, keep going
                    warn!("midi send failed: {}", e);
                }
            }
            None => {
                if !self.warned_null {
                    info!("no MIDI device attached, discarding output");
                    self.warned_null = true;
                }
            }
        }
    }
}

/// 1 based channel into a status byte's low nibble
fn status(kind: u8, channel: u8) -> u8 {
    kind | (channel.saturating_sub(1) & 0x0F)
}

impl MidiOut for MidiSink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
        self.send(&[status(STATUS_NOTE_ON, channel), note & 0x7F, velocity & 0x7F]);
    }
    fn note_off(&mut self, channel: u8, note: u8, velocity: u8) {
        self.send(&[status(STATUS_NOTE_OFF, channel), note & 0x7F, velocity & 0x7F]);
    }
    fn control_change(&mut self, channel: u8, control: u8, value: u8) {
        self.send(&[
            status(STATUS_CONTROL_CHANGE, channel),
            control & 0x7F,
            value & 0x7F,
        ]);
    }
    fn program_change(&mut self, channel: u8, program: u8) {
        self.send(&[status(STATUS_PROGRAM_CHANGE, channel), program & 0x7F]);
    }
    fn transport_start(&mut self) {
        self.send(&[STATUS_START]);
    }
    fn transport_stop(&mut self) {
        self.send(&[STATUS_STOP]);
    }
    fn transport_continue(&mut self) {
        self.send(&[STATUS_CONTINUE]);
    }
}
