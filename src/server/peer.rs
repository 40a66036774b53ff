//! webrtc peer negotiation for the performance lane
//!
//! Each client gets at most one peer connection, created when its offer
//! arrives over signaling.  The relay answers, trickles its local candidates
//! back over signaling, and waits for the remote to open the data channel.
//! Everything the channel produces is forwarded into the engine's message
//! queue; nothing in here touches engine state directly, callbacks only ever
//! capture the client id.
//!
//! The webrtc stack is async, so the manager owns a tokio runtime.  The
//! negotiation steps block_on it (offer handling is the one place the server
//! is allowed to wait); the channel callbacks run on the runtime's workers
//! and just push into the mpsc channel.
use log::{debug, warn};
use serde_json::Value;
use std::sync::{mpsc, Arc};
use tokio::runtime::Runtime;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::common::box_error::BoxError;
use crate::server::engine_message::EngineMessage;

pub struct PeerManager {
    rt: Runtime,
    api: API,
}

/// handle to one client's live peer connection
pub struct PeerHandle {
    pc: Arc<RTCPeerConnection>,
}

impl PeerManager {
    pub fn build() -> Result<PeerManager, BoxError> {
        Ok(PeerManager {
            rt: Runtime::new()?,
            api: APIBuilder::new().build(),
        })
    }

    /// run the offer/answer round for one client and wire the channel
    /// callbacks.  Returns the handle to stash on the client record and the
    /// answer to send back over signaling.
    pub fn negotiate(
        &self,
        client_id: u64,
        offer: &Value,
        events: mpsc::Sender<EngineMessage>,
    ) -> Result<(PeerHandle, Value), BoxError> {
        let offer: RTCSessionDescription = serde_json::from_value(offer.clone())?;
        // LAN only for now, so no ICE servers
        let config = RTCConfiguration {
            ice_servers: vec![],
            ..Default::default()
        };
        let pc = Arc::new(self.rt.block_on(self.api.new_peer_connection(config))?);

        let ice_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(value) = serde_json::to_value(&init) {
                                let _res = ice_tx.send(EngineMessage::LocalCandidate {
                                    client_id,
                                    candidate: value,
                                });
                            }
                        }
                        Err(e) => debug!("candidate serialize failed: {}", e),
                    }
                }
            })
        }));

        let chan_tx = events;
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let chan_tx = chan_tx.clone();
            Box::pin(async move {
                let label = channel.label().to_string();
                let _res = chan_tx.send(EngineMessage::DataOpen { client_id, label });

                let msg_tx = chan_tx.clone();
                channel.on_message(Box::new(move |msg: DataChannelMessage| {
                    let msg_tx = msg_tx.clone();
                    Box::pin(async move {
                        match String::from_utf8(msg.data.to_vec()) {
                            Ok(payload) => {
                                let _res = msg_tx
                                    .send(EngineMessage::DataPacket { client_id, payload });
                            }
                            // binary garbage on the wire, drop it
                            Err(_) => {}
                        }
                    })
                }));

                let close_tx = chan_tx.clone();
                channel.on_close(Box::new(move || {
                    let close_tx = close_tx.clone();
                    Box::pin(async move {
                        let _res = close_tx.send(EngineMessage::DataClosed { client_id });
                    })
                }));
            })
        }));

        let answer = self.rt.block_on(async {
            pc.set_remote_description(offer).await?;
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            Ok::<RTCSessionDescription, webrtc::Error>(answer)
        })?;

        Ok((PeerHandle { pc }, serde_json::to_value(&answer)?))
    }

    /// apply a remote ICE candidate relayed over signaling
    pub fn add_candidate(&self, peer: &PeerHandle, candidate: &Value) -> Result<(), BoxError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())?;
        self.rt.block_on(peer.pc.add_ice_candidate(init))?;
        Ok(())
    }

    /// tear down a peer.  Idempotent from the caller's point of view.
    pub fn close(&self, peer: &PeerHandle) -> () {
        if let Err(e) = self.rt.block_on(peer.pc.close()) {
            warn!("peer close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod test_peer_manager {
    use super::*;
    use serde_json::json;

    #[test]
    fn build() {
        // the runtime and webrtc api should come up
        let mgr = PeerManager::build();
        assert!(mgr.is_ok());
    }

    #[test]
    fn garbage_offer_is_rejected() {
        let mgr = PeerManager::build().unwrap();
        let (tx, _rx) = mpsc::channel();
        let res = mgr.negotiate(1, &json!({"not": "an offer"}), tx);
        assert!(res.is_err());
    }
}
