//! Messages that flow from the I/O threads into the playback engine
//!
//! Every mutation of engine state travels through this enum on one mpsc
//! channel, which is what keeps the engine single threaded: the signaling
//! threads, the webrtc callbacks, and the engine's own negotiation results
//! all funnel through here.
use serde_json::Value;
use std::sync::mpsc;

#[derive(Debug)]
pub enum EngineMessage {
    /// a new signaling connection; the engine allocates the id and sends it
    /// back on the reply channel, outbound frames go to signal_tx
    Connect {
        reply: mpsc::Sender<u64>,
        signal_tx: mpsc::Sender<Value>,
    },
    /// the signaling socket closed or errored
    Disconnect { client_id: u64 },
    /// one parsed JSON frame off a client's signaling socket
    Signal { client_id: u64, message: Value },
    /// the remote opened its performance data channel
    DataOpen { client_id: u64, label: String },
    /// the performance data channel closed
    DataClosed { client_id: u64 },
    /// one datagram off the performance data channel
    DataPacket { client_id: u64, payload: String },
    /// a local ICE candidate to trickle back over signaling
    LocalCandidate { client_id: u64, candidate: Value },
    /// stop the engine loop
    Shutdown,
}
