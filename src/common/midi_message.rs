//! Structures used to carry musical events from the wire to the engine
//!
//! Both lanes speak the same JSON shape.  The immediate lane frames arrive on
//! the signaling websocket, the performance lane frames arrive as datagrams on
//! the webrtc data channel.  The only difference is that performance frames
//! always carry a client timestamp while immediate frames may omit it.
use serde_json::Value;
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

/// the kind specific part of a musical event
#[derive(Debug, Clone, PartialEq)]
pub enum MidiPayload {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8, velocity: u8 },
    ControlChange { control: u8, value: u8 },
    ProgramChange { program: u8 },
}

/// one musical event as parsed off either lane
#[derive(Debug, Clone, PartialEq)]
pub struct MidiMessage {
    /// 1 based channel as the browser sends it.  The sink translates.
    pub channel: u8,
    pub payload: MidiPayload,
    /// client wall-clock milliseconds, when present
    pub timestamp: Option<u128>,
}

impl MidiMessage {
    /// does this type string name one of the four musical event kinds
    pub fn is_midi_type(mtype: &str) -> bool {
        matches!(
            mtype,
            "noteOn" | "noteOff" | "controlChange" | "programChange"
        )
    }

    pub fn from_string(data: &str) -> Result<MidiMessage, BoxError> {
        let raw = serde_json::from_str(data)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &Value) -> Result<MidiMessage, BoxError> {
        let mtype = match raw["type"].as_str() {
            Some(t) => t,
            None => bail!("no type in message"),
        };
        let channel = data_byte(raw, "channel")?;
        if !(1..=16).contains(&channel) {
            bail!("channel {} out of range", channel);
        }
        let payload = match mtype {
            "noteOn" => MidiPayload::NoteOn {
                note: data_byte(raw, "note")?,
                velocity: data_byte(raw, "velocity")?,
            },
            "noteOff" => MidiPayload::NoteOff {
                note: data_byte(raw, "note")?,
                // browsers don't send a release velocity
                velocity: opt_data_byte(raw, "velocity", 0)?,
            },
            "controlChange" => MidiPayload::ControlChange {
                control: data_byte(raw, "control")?,
                value: data_byte(raw, "value")?,
            },
            "programChange" => MidiPayload::ProgramChange {
                program: data_byte(raw, "program")?,
            },
            _ => bail!("not a midi event type: {}", mtype),
        };
        Ok(MidiMessage {
            channel,
            payload,
            timestamp: parse_timestamp(raw),
        })
    }
}

impl fmt::Display for MidiMessage {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ ch: {}, payload: {:?}, ts: {:?} }}",
            self.channel, self.payload, self.timestamp
        )
    }
}

/// required data byte, clamped into midi's 7 bit range
fn data_byte(raw: &Value, key: &str) -> Result<u8, BoxError> {
    match raw[key].as_u64() {
        Some(v) if v <= 127 => Ok(v as u8),
        Some(v) => bail!("{} value {} out of range", key, v),
        None => bail!("no {} in message", key),
    }
}

fn opt_data_byte(raw: &Value, key: &str, def_value: u8) -> Result<u8, BoxError> {
    if raw[key].is_null() {
        return Ok(def_value);
    }
    data_byte(raw, key)
}

/// timestamps come off Date.now() so they may arrive as floats
fn parse_timestamp(raw: &Value) -> Option<u128> {
    if let Some(ts) = raw["timestamp"].as_u64() {
        return Some(ts as u128);
    }
    raw["timestamp"].as_f64().map(|ts| ts.max(0.0) as u128)
}

/// the four actions a `transport` frame can carry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Record,
}

impl TransportAction {
    pub fn from_json(raw: &Value) -> Result<TransportAction, BoxError> {
        match raw["action"].as_str() {
            Some("play") => Ok(TransportAction::Play),
            Some("pause") => Ok(TransportAction::Pause),
            Some("stop") => Ok(TransportAction::Stop),
            Some("record") => Ok(TransportAction::Record),
            Some(other) => bail!("unknown transport action: {}", other),
            None => bail!("no action in transport message"),
        }
    }
}
