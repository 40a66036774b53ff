//! the playback engine: scheduler, dispatcher, and keeper of all relay state
//!
//! One thread owns everything mutable: the client registry, the playback
//! queue, the lane counters, and the MIDI sink.  The I/O threads feed it
//! [`EngineMessage`]s over a single mpsc channel and the loop interleaves
//! message handling with three periodic jobs driven by [`MilliTimer`]s: the
//! 5 ms dispatch tick, the 1 second dev stats broadcast, and the 5 second
//! operator summary.
//!
//! The two lanes meet here.  Immediate lane frames are played the moment the
//! loop sees them.  Performance lane packets first feed the client's latency
//! window, then get a deadline of `timestamp + buffer_depth` and wait on the
//! queue.  The dispatcher drains due events strictly by deadline and throws
//! away anything that is more than 50 ms overdue: a note played that late is
//! a glitch, and the adaptive buffer has already resized so it won't recur.
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::mpsc;
use std::time::Duration;

use crate::common::box_error::BoxError;
use crate::common::midi_message::{MidiMessage, MidiPayload, TransportAction};
use crate::common::stream_stat::MilliTimer;
use crate::midi::sink::MidiOut;
use crate::server::client::{ClientRegistry, DataChannelState};
use crate::server::engine_message::EngineMessage;
use crate::server::peer::PeerManager;
use crate::server::playback_queue::{PlaybackQueue, ScheduledEvent};
use crate::server::telemetry::{self, LaneCounters};
use crate::utils::get_milli_time;

/// dispatch pass granularity.  Coarser biases playback late, finer burns cpu.
pub const DISPATCH_TICK_MS: u128 = 5;
/// an event more overdue than this is discarded instead of played
pub const LATE_DROP_MS: u128 = 50;
/// every NoteOn gets a companion NoteOff this far behind it
pub const SAFETY_RELEASE_MS: u128 = 800;
const STATS_INTERVAL_MS: u128 = 1_000;
const SUMMARY_INTERVAL_MS: u128 = 5_000;

pub struct RelayEngine {
    sink: Box<dyn MidiOut>,
    registry: ClientRegistry,
    queue: PlaybackQueue,
    counters: LaneCounters,
    late_drops: u64,
    /// created on the first offer; clients that never negotiate don't pay
    /// for a tokio runtime
    peers: Option<PeerManager>,
    rx: mpsc::Receiver<EngineMessage>,
    /// handed to webrtc callbacks so channel traffic loops back into rx
    self_tx: mpsc::Sender<EngineMessage>,
    midi_available: bool,
    dispatch_timer: MilliTimer,
    stats_timer: MilliTimer,
    summary_timer: MilliTimer,
    last_dispatch_at: u128,
    debug_events: bool,
    running: bool,
}

impl RelayEngine {
    pub fn build(
        rx: mpsc::Receiver<EngineMessage>,
        self_tx: mpsc::Sender<EngineMessage>,
        sink: Box<dyn MidiOut>,
        midi_available: bool,
        debug_events: bool,
    ) -> RelayEngine {
        let now = get_milli_time();
        RelayEngine {
            sink,
            registry: ClientRegistry::build(),
            queue: PlaybackQueue::build(),
            counters: LaneCounters::build(),
            late_drops: 0,
            peers: None,
            rx,
            self_tx,
            midi_available,
            dispatch_timer: MilliTimer::build(now, DISPATCH_TICK_MS),
            stats_timer: MilliTimer::build(now, STATS_INTERVAL_MS),
            summary_timer: MilliTimer::build(now, SUMMARY_INTERVAL_MS),
            last_dispatch_at: 0,
            debug_events,
            running: true,
        }
    }

    /// the engine loop.  Interleaves the message pump with the periodic jobs
    /// at millisecond granularity.  Never returns until Shutdown.
    pub fn run(&mut self) -> Result<(), BoxError> {
        info!("playback engine running");
        while self.running {
            match self.rx.recv_timeout(Duration::from_millis(1)) {
                Ok(msg) => self.handle_message(msg, get_milli_time()),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            self.tick(get_milli_time());
        }
        info!("playback engine stopped");
        Ok(())
    }

    pub fn handle_message(&mut self, msg: EngineMessage, now: u128) -> () {
        match msg {
            EngineMessage::Connect { reply, signal_tx } => {
                let id = self.registry.add(signal_tx);
                let _res = reply.send(id);
            }
            EngineMessage::Disconnect { client_id } => self.handle_disconnect(client_id),
            EngineMessage::Signal { client_id, message } => {
                self.handle_signal(client_id, &message, now)
            }
            EngineMessage::DataOpen { client_id, label } => {
                if let Some(client) = self.registry.get_mut(client_id) {
                    client.dc_state = DataChannelState::Open;
                    info!("client {} data channel open ({})", client_id, label);
                }
            }
            EngineMessage::DataClosed { client_id } => {
                if let Some(client) = self.registry.get_mut(client_id) {
                    client.dc_state = DataChannelState::Closed;
                    info!("client {} data channel closed", client_id);
                }
            }
            EngineMessage::DataPacket { client_id, payload } => {
                self.handle_data_packet(client_id, &payload, now)
            }
            EngineMessage::LocalCandidate {
                client_id,
                candidate,
            } => {
                if let Some(client) = self.registry.get(client_id) {
                    client.send(&json!({
                        "type": "webrtc-ice-candidate",
                        "candidate": candidate,
                    }));
                }
            }
            EngineMessage::Shutdown => {
                self.running = false;
            }
        }
    }

    fn handle_disconnect(&mut self, client_id: u64) -> () {
        if let Some(client) = self.registry.remove(client_id) {
            // already queued events from this client stay; they drain within
            // one buffer depth and the safety NoteOffs bound stuck notes
            if let (Some(peers), Some(peer)) = (self.peers.as_ref(), client.peer.as_ref()) {
                peers.close(peer);
            }
            info!("client {} removed", client_id);
        }
    }

    fn handle_signal(&mut self, client_id: u64, message: &Value, now: u128) -> () {
        let mtype = match message["type"].as_str() {
            Some(t) => t,
            None => {
                info!("signaling frame without a type from client {}", client_id);
                return;
            }
        };
        match mtype {
            "client-hello" => self.send_welcome(client_id),
            "webrtc-offer" => self.handle_offer(client_id, &message["offer"]),
            "webrtc-ice-candidate" => {
                self.handle_remote_candidate(client_id, &message["candidate"])
            }
            "transport" => self.handle_transport(message),
            t if MidiMessage::is_midi_type(t) => self.immediate_dispatch(message, now),
            other => {
                // never fatal, the client may be newer than us
                info!("ignoring unknown signaling type: {}", other);
            }
        }
    }

    fn send_welcome(&self, client_id: u64) -> () {
        if let Some(client) = self.registry.get(client_id) {
            client.send(&json!({
                "type": "server-welcome",
                "id": client_id,
                "midiAvailable": self.midi_available,
            }));
        }
    }

    /// immediate lane: straight to the device, never queued
    fn immediate_dispatch(&mut self, raw: &Value, now: u128) -> () {
        match MidiMessage::from_json(raw) {
            Ok(msg) => {
                self.counters.ws_immediate += 1;
                if self.debug_events {
                    if let Some(ts) = msg.timestamp {
                        debug!(
                            "WS lane: {} (latency={}ms)",
                            raw["type"].as_str().unwrap_or("midi"),
                            now.saturating_sub(ts)
                        );
                    }
                }
                self.emit(msg.channel, &msg.payload);
            }
            Err(e) => warn!("bad immediate event: {}", e),
        }
    }

    fn handle_transport(&mut self, raw: &Value) -> () {
        match TransportAction::from_json(raw) {
            Ok(TransportAction::Play) => self.sink.transport_start(),
            Ok(TransportAction::Stop) => self.sink.transport_stop(),
            Ok(TransportAction::Pause) => self.sink.transport_continue(),
            // no MIDI realtime message for record; the convention the
            // browser client expects is CC 119 full on channel 1
            Ok(TransportAction::Record) => self.sink.control_change(1, 119, 127),
            Err(e) => warn!("bad transport message: {}", e),
        }
    }

    fn handle_offer(&mut self, client_id: u64, offer: &Value) -> () {
        if self.peers.is_none() {
            match PeerManager::build() {
                Ok(p) => self.peers = Some(p),
                Err(e) => {
                    error!("webrtc unavailable: {}", e);
                    return;
                }
            }
        }
        let peers = match self.peers.as_ref() {
            Some(p) => p,
            None => return,
        };
        let client = match self.registry.get_mut(client_id) {
            Some(c) => c,
            None => {
                warn!("offer from unknown client {}", client_id);
                return;
            }
        };
        // a fresh offer replaces any prior peer
        if let Some(old) = client.peer.take() {
            peers.close(&old);
        }
        client.dc_state = DataChannelState::None;
        match peers.negotiate(client_id, offer, self.self_tx.clone()) {
            Ok((handle, answer)) => {
                client.peer = Some(handle);
                client.send(&json!({
                    "type": "webrtc-answer",
                    "answer": answer,
                }));
                info!("client {} performance lane negotiated", client_id);
            }
            Err(e) => {
                // the immediate lane still works for this client
                warn!("offer handling failed for client {}: {}", client_id, e);
            }
        }
    }

    fn handle_remote_candidate(&mut self, client_id: u64, candidate: &Value) -> () {
        let peers = match self.peers.as_ref() {
            Some(p) => p,
            None => return,
        };
        let client = match self.registry.get(client_id) {
            Some(c) => c,
            None => return,
        };
        match client.peer.as_ref() {
            Some(peer) => {
                if let Err(e) = peers.add_candidate(peer, candidate) {
                    warn!("bad ice candidate from client {}: {}", client_id, e);
                }
            }
            None => debug!("candidate for client {} with no peer", client_id),
        }
    }

    /// performance lane ingest: sample the one-way delay, resize the buffer,
    /// and put the event on the queue with its deadline
    fn handle_data_packet(&mut self, client_id: u64, payload: &str, now: u128) -> () {
        let raw: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            // malformed datagram, drop it on the floor
            Err(_) => return,
        };
        let msg = match MidiMessage::from_json(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!("bad performance event: {}", e);
                return;
            }
        };
        let client = match self.registry.get_mut(client_id) {
            Some(c) => c,
            // the client is gone; whatever it had queued will still drain
            None => return,
        };
        self.counters.rtc_perf += 1;

        // a missing timestamp means "now", which makes the latency sample 0.
        // future dated timestamps (skewed client clock) also clamp to 0: we
        // only ever trust the timestamps as relative references, so skew
        // shifts every deadline uniformly and spacing is preserved.
        let timestamp = msg.timestamp.unwrap_or(now);
        let latency = now.saturating_sub(timestamp) as f64;
        client.latency.add_sample(latency);
        client.buffer_depth_ms = client.latency.buffer_depth_ms();
        client.last_seen = Some(now);
        let play_at = timestamp + client.buffer_depth_ms as u128;
        if self.debug_events {
            debug!(
                "RPSV Debug: RTC latency={}ms, bufferSizeMs={}",
                latency, client.buffer_depth_ms
            );
        }

        let channel = msg.channel;
        self.queue.push(ScheduledEvent {
            play_at,
            channel,
            payload: msg.payload.clone(),
        });
        if let MidiPayload::NoteOn { note, .. } = msg.payload {
            // bound stuck-note damage if the explicit NoteOff never arrives
            self.queue.push(ScheduledEvent {
                play_at: play_at + SAFETY_RELEASE_MS,
                channel,
                payload: MidiPayload::NoteOff { note, velocity: 0 },
            });
        }
    }

    /// the periodic jobs.  Called on every loop pass with the current time.
    pub fn tick(&mut self, now: u128) -> () {
        if self.dispatch_timer.expired(now) {
            self.dispatch_timer.reset(now);
            self.dispatch_due(now);
        }
        if self.stats_timer.expired(now) {
            self.stats_timer.reset(now);
            self.broadcast_stats(now);
        }
        if self.summary_timer.expired(now) {
            self.summary_timer.reset(now);
            self.log_summary();
        }
    }

    /// drain everything whose deadline has arrived, strictly by deadline
    fn dispatch_due(&mut self, now: u128) -> () {
        while let Some(play_at) = self.queue.peek_deadline() {
            if play_at > now {
                break;
            }
            let evt = match self.queue.pop() {
                Some(e) => e,
                None => break,
            };
            let overdue = now - evt.play_at;
            if overdue > LATE_DROP_MS {
                // playing this now would glitch worse than silence
                self.late_drops += 1;
                continue;
            }
            if self.debug_events {
                let interval = if self.last_dispatch_at == 0 {
                    0
                } else {
                    now - self.last_dispatch_at
                };
                debug!(
                    "RPSV Debug: PlaybackError={}ms, InterPlayback={}ms",
                    overdue, interval
                );
            }
            self.emit(evt.channel, &evt.payload);
            self.last_dispatch_at = now;
        }
    }

    fn emit(&mut self, channel: u8, payload: &MidiPayload) -> () {
        match payload {
            MidiPayload::NoteOn { note, velocity } => self.sink.note_on(channel, *note, *velocity),
            MidiPayload::NoteOff { note, velocity } => {
                self.sink.note_off(channel, *note, *velocity)
            }
            MidiPayload::ControlChange { control, value } => {
                self.sink.control_change(channel, *control, *value)
            }
            MidiPayload::ProgramChange { program } => {
                self.sink.program_change(channel, *program)
            }
        }
    }

    fn broadcast_stats(&self, now: u128) -> () {
        if self.registry.is_empty() {
            return;
        }
        let frame = telemetry::build_stats(now, self.queue.len(), &self.counters, &self.registry);
        for client in self.registry.iter() {
            client.send(&frame);
        }
    }

    fn log_summary(&mut self) -> () {
        info!(
            "summary: clients={} queue={} rtcPerf={} wsImmediate={} lateDrops={} queueDrops={}",
            self.registry.len(),
            self.queue.len(),
            self.counters.rtc_perf,
            self.counters.ws_immediate,
            self.late_drops,
            self.queue.overflow_drops(),
        );
        debug!("clients: {}", self.registry);
        // the stats frames are windowed by this reset
        self.counters.reset();
    }

    /// test mode reset: drop every client, queued event, and counter
    pub fn reset(&mut self) -> () {
        self.registry.clear();
        self.queue.clear();
        self.counters.reset();
        self.late_drops = 0;
    }
}

#[cfg(test)]
mod test_relay_engine {
    use super::*;
    use crate::midi::sink::MockMidiOut;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        NoteOn(u8, u8, u8),
        NoteOff(u8, u8, u8),
        Control(u8, u8, u8),
        Program(u8, u8),
        Start,
        Stop,
        Continue,
    }

    struct RecordingSink {
        calls: Arc<Mutex<Vec<SinkCall>>>,
    }

    impl MidiOut for RecordingSink {
        fn note_on(&mut self, channel: u8, note: u8, velocity: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::NoteOn(channel, note, velocity));
        }
        fn note_off(&mut self, channel: u8, note: u8, velocity: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::NoteOff(channel, note, velocity));
        }
        fn control_change(&mut self, channel: u8, control: u8, value: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::Control(channel, control, value));
        }
        fn program_change(&mut self, channel: u8, program: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::Program(channel, program));
        }
        fn transport_start(&mut self) {
            self.calls.lock().unwrap().push(SinkCall::Start);
        }
        fn transport_stop(&mut self) {
            self.calls.lock().unwrap().push(SinkCall::Stop);
        }
        fn transport_continue(&mut self) {
            self.calls.lock().unwrap().push(SinkCall::Continue);
        }
    }

    fn build_engine() -> (RelayEngine, Arc<Mutex<Vec<SinkCall>>>) {
        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            calls: calls.clone(),
        };
        let engine = RelayEngine::build(rx, tx, Box::new(sink), true, false);
        (engine, calls)
    }

    fn connect_client(engine: &mut RelayEngine, now: u128) -> (u64, mpsc::Receiver<Value>) {
        let (signal_tx, signal_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        engine.handle_message(
            EngineMessage::Connect {
                reply: reply_tx,
                signal_tx,
            },
            now,
        );
        (reply_rx.recv().unwrap(), signal_rx)
    }

    fn perf_packet(engine: &mut RelayEngine, id: u64, payload: Value, now: u128) {
        engine.handle_message(
            EngineMessage::DataPacket {
                client_id: id,
                payload: payload.to_string(),
            },
            now,
        );
    }

    #[test]
    fn hello_is_idempotent() {
        // two hellos get two identical welcomes with the same id
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, signal_rx) = connect_client(&mut engine, base);
        let hello = json!({"type": "client-hello"});
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: hello.clone(),
            },
            base,
        );
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: hello,
            },
            base + 1,
        );
        let first = signal_rx.try_recv().unwrap();
        let second = signal_rx.try_recv().unwrap();
        assert_eq!(first, second);
        assert_eq!(first["type"], "server-welcome");
        assert_eq!(first["id"], id);
        assert_eq!(first["midiAvailable"], true);
    }

    #[test]
    fn immediate_lane_plays_on_arrival() {
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: json!({"type":"noteOn","channel":1,"note":60,"velocity":100}),
            },
            base,
        );
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[SinkCall::NoteOn(1, 60, 100)]
        );
        assert_eq!(engine.counters.ws_immediate, 1);
        // nothing hit the queue
        assert!(engine.queue.is_empty());
    }

    #[test]
    fn immediate_lane_via_mock() {
        // same path, but with expectations on the device seam
        let (tx, rx) = mpsc::channel();
        let mut mock = MockMidiOut::new();
        mock.expect_note_on()
            .withf(|ch, note, vel| *ch == 2 && *note == 64 && *vel == 90)
            .times(1)
            .returning(|_, _, _| ());
        let mut engine = RelayEngine::build(rx, tx, Box::new(mock), true, false);
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: json!({"type":"noteOn","channel":2,"note":64,"velocity":90}),
            },
            base,
        );
    }

    #[test]
    fn transport_actions_map_to_realtime() {
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        for action in ["play", "pause", "stop", "record"] {
            engine.handle_message(
                EngineMessage::Signal {
                    client_id: id,
                    message: json!({"type":"transport","action":action}),
                },
                base,
            );
        }
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[
                SinkCall::Start,
                SinkCall::Continue,
                SinkCall::Stop,
                SinkCall::Control(1, 119, 127),
            ]
        );
    }

    #[test]
    fn unknown_type_is_ignored() {
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: json!({"type":"flux-capacitor","charge":88}),
            },
            base,
        );
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: json!({"no_type": true}),
            },
            base,
        );
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(engine.registry.len(), 1);
    }

    #[test]
    fn performance_packet_schedules_with_buffer() {
        // latency 30 -> buffer 45, note at ts+45, safety off at ts+845
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        let ts = base + 170;
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":100,"timestamp": ts as u64}),
            base + 200,
        );
        assert_eq!(engine.counters.rtc_perf, 1);
        assert_eq!(engine.queue.len(), 2);
        assert_eq!(engine.queue.peek_deadline(), Some(ts + 45));
        {
            let client = engine.registry.get(id).unwrap();
            assert_eq!(client.buffer_depth_ms, 45);
            assert_eq!(client.last_seen, Some(base + 200));
        }
        // nothing due yet
        engine.tick(base + 205);
        assert!(calls.lock().unwrap().is_empty());
        // the note comes due
        engine.tick(ts + 46);
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[SinkCall::NoteOn(1, 60, 100)]
        );
        // the safety release comes due 800 ms later
        engine.tick(ts + 45 + SAFETY_RELEASE_MS + 5);
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[SinkCall::NoteOn(1, 60, 100), SinkCall::NoteOff(1, 60, 0)]
        );
        assert!(engine.queue.is_empty());
    }

    #[test]
    fn reordered_packets_dispatch_in_timestamp_order() {
        // the later timestamp arrives first; deadlines put them back in order
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":61,"velocity":80,"timestamp": (base + 120) as u64}),
            base + 130,
        );
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":80,"timestamp": (base + 100) as u64}),
            base + 131,
        );
        // both latencies are near 10/31 ms so both buffers are 25 ms:
        // note 60 is due at base+125, note 61 at base+145
        engine.tick(base + 146);
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0], SinkCall::NoteOn(1, 60, 80));
        assert_eq!(calls[1], SinkCall::NoteOn(1, 61, 80));
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn stale_event_is_late_dropped() {
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        // prime the window so the buffer sits at 40 ms
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":50,"velocity":80,"timestamp": (base + 75) as u64}),
            base + 100,
        );
        assert_eq!(engine.registry.get(id).unwrap().buffer_depth_ms, 40);
        engine.tick(base + 116);
        calls.lock().unwrap().clear();
        // a packet delayed 200 ms lands 160 ms past its deadline
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":51,"velocity":80,"timestamp": (base + 200) as u64}),
            base + 400,
        );
        engine.tick(base + 401);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(engine.late_drops, 1);
    }

    #[test]
    fn future_dated_clock_skew_keeps_spacing() {
        // a client clock 10 s ahead yields latency 0 and a deadline 10 s out
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        let ts = base + 10_000;
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":100,"timestamp": ts as u64}),
            base,
        );
        let client = engine.registry.get(id).unwrap();
        assert_eq!(client.latency.p95(), 0.0);
        assert_eq!(client.buffer_depth_ms, 15);
        assert_eq!(engine.queue.peek_deadline(), Some(ts + 15));
    }

    #[test]
    fn missing_timestamp_means_now() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        perf_packet(
            &mut engine,
            id,
            json!({"type":"controlChange","channel":1,"control":7,"value":90}),
            base + 500,
        );
        let client = engine.registry.get(id).unwrap();
        assert_eq!(client.latency.len(), 1);
        assert_eq!(client.latency.p95(), 0.0);
        assert_eq!(engine.queue.peek_deadline(), Some(base + 500 + 15));
    }

    #[test]
    fn stats_frame_reaches_the_client() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::DataOpen {
                client_id: id,
                label: String::from("perf"),
            },
            base,
        );
        for i in 0..5u64 {
            // recent enough that the notes are due but not late at the tick
            let ts = base + 1_050 + i as u128;
            perf_packet(
                &mut engine,
                id,
                json!({"type":"noteOn","channel":1,"note":60 + i as u8,"velocity":100,"timestamp": ts as u64}),
                ts,
            );
        }
        engine.tick(base + 1_100);
        let mut stats = None;
        while let Ok(frame) = signal_rx.try_recv() {
            if frame["type"] == "jcmp-stats" {
                stats = Some(frame);
            }
        }
        let stats = stats.expect("no jcmp-stats frame seen");
        let client = &stats["clients"][0];
        assert_eq!(client["id"], id);
        assert_eq!(client["dcState"], "open");
        assert_eq!(client["latencyHistory"].as_array().unwrap().len(), 5);
        assert_eq!(stats["laneCounters"]["rtcPerf"], 5);
        // the notes played at the tick, the safety releases are still queued
        assert_eq!(stats["queueLength"], 5);
    }

    #[test]
    fn summary_resets_lane_counters() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::Signal {
                client_id: id,
                message: json!({"type":"noteOn","channel":1,"note":60,"velocity":100}),
            },
            base,
        );
        assert_eq!(engine.counters.ws_immediate, 1);
        engine.tick(base + SUMMARY_INTERVAL_MS + 100);
        assert_eq!(engine.counters.ws_immediate, 0);
        assert_eq!(engine.counters.rtc_perf, 0);
    }

    #[test]
    fn disconnect_removes_the_record() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        assert_eq!(engine.registry.len(), 1);
        engine.handle_message(EngineMessage::Disconnect { client_id: id }, base);
        assert!(engine.registry.is_empty());
        // stale traffic for the old id is a no-op
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":100,"timestamp": base as u64}),
            base,
        );
        assert!(engine.queue.is_empty());
    }

    #[test]
    fn packets_for_unknown_clients_are_dropped() {
        let (mut engine, calls) = build_engine();
        let base = get_milli_time();
        perf_packet(
            &mut engine,
            99,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":100,"timestamp": base as u64}),
            base,
        );
        assert!(engine.queue.is_empty());
        assert_eq!(engine.counters.rtc_perf, 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_datagram_is_silently_dropped() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        engine.handle_message(
            EngineMessage::DataPacket {
                client_id: id,
                payload: String::from("{not json"),
            },
            base,
        );
        assert!(engine.queue.is_empty());
        assert_eq!(engine.counters.rtc_perf, 0);
    }

    #[test]
    fn reset_clears_all_state() {
        let (mut engine, _calls) = build_engine();
        let base = get_milli_time();
        let (id, _signal_rx) = connect_client(&mut engine, base);
        perf_packet(
            &mut engine,
            id,
            json!({"type":"noteOn","channel":1,"note":60,"velocity":100,"timestamp": (base + 500) as u64}),
            base,
        );
        assert!(!engine.queue.is_empty());
        engine.reset();
        assert!(engine.queue.is_empty());
        assert!(engine.registry.is_empty());
        assert_eq!(engine.counters.rtc_perf, 0);
        assert_eq!(engine.late_drops, 0);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let (mut engine, _calls) = build_engine();
        engine.handle_message(EngineMessage::Shutdown, get_milli_time());
        assert!(!engine.running);
    }
}
