//! per client records and the registry that owns them
//!
//! A client is created when its signaling socket connects and destroyed when
//! that socket closes.  The peer and data channel handles hang off the record
//! so that dropping the record cascades the teardown.  Note that events a
//! client already put on the playback queue are anonymous; they drain within
//! one buffer depth and are deliberately not scrubbed on disconnect.
use serde_json::Value;
use std::fmt;
use std::sync::mpsc;

use crate::common::stream_stat::{LatencyWindow, BUFFER_DEFAULT_MS};
use crate::server::peer::PeerHandle;

/// state of the performance data channel as reported in dev stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataChannelState {
    None,
    Open,
    Closed,
}

impl DataChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataChannelState::None => "none",
            DataChannelState::Open => "open",
            DataChannelState::Closed => "closed",
        }
    }
}

pub struct Client {
    pub id: u64,
    signal_tx: mpsc::Sender<Value>,
    /// bound after a successful offer/answer round
    pub peer: Option<PeerHandle>,
    pub dc_state: DataChannelState,
    pub latency: LatencyWindow,
    pub buffer_depth_ms: u64,
    /// wall clock ms of the last performance packet
    pub last_seen: Option<u128>,
}

impl Client {
    pub fn build(id: u64, signal_tx: mpsc::Sender<Value>) -> Client {
        Client {
            id,
            signal_tx,
            peer: None,
            dc_state: DataChannelState::None,
            latency: LatencyWindow::build(),
            buffer_depth_ms: BUFFER_DEFAULT_MS,
            last_seen: None,
        }
    }
    /// queue a frame for the signaling thread to write.  Best effort; if the
    /// socket thread is gone the disconnect message is already in flight.
    pub fn send(&self, frame: &Value) -> () {
        let _res = self.signal_tx.send(frame.clone());
    }
}

impl fmt::Display for Client {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, dc: {}, buffer: {}ms, window: {} }}",
            self.id,
            self.dc_state.as_str(),
            self.buffer_depth_ms,
            self.latency
        )
    }
}

/// all currently connected clients, keyed by a process-lifetime unique id
pub struct ClientRegistry {
    clients: Vec<Client>,
    next_id: u64,
}

impl ClientRegistry {
    pub fn build() -> ClientRegistry {
        ClientRegistry {
            clients: vec![],
            next_id: 1,
        }
    }
    /// allocate an id and create the record
    pub fn add(&mut self, signal_tx: mpsc::Sender<Value>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.push(Client::build(id, signal_tx));
        id
    }
    pub fn remove(&mut self, id: u64) -> Option<Client> {
        match self.clients.iter().position(|c| c.id == id) {
            Some(idx) => Some(self.clients.remove(idx)),
            None => None,
        }
    }
    pub fn get_mut(&mut self, id: u64) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id == id)
    }
    pub fn get(&self, id: u64) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Client> {
        self.clients.iter()
    }
    pub fn len(&self) -> usize {
        self.clients.len()
    }
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
    /// test mode reset
    pub fn clear(&mut self) -> () {
        self.clients.clear();
    }
}

impl fmt::Display for ClientRegistry {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for client in &self.clients {
            write!(f, " {},", client)?;
        }
        write!(f, " ]")
    }
}
