//! the signaling endpoint: one TCP port for everything reliable
//!
//! The listener serves two things on the same port: a plain HTTP status probe
//! (`GET /api/status`) and the websocket upgrade for the signaling channel.
//! We peek the request head to tell them apart before handing the stream to
//! tungstenite, since the handshake cannot give bytes back.
//!
//! Each websocket gets its own thread.  The thread registers with the engine
//! (which allocates the client id), then polls the socket with a short read
//! timeout so it can interleave reads with draining the outbound frame
//! channel the engine writes to.  This is also the immediate lane: musical
//! frames on this socket go to the engine like any other signaling message
//! and are played on arrival.
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tungstenite::{accept, Error as WsError, Message};

use crate::common::box_error::BoxError;
use crate::server::engine_message::EngineMessage;
use crate::utils::get_milli_time;

/// how long a socket read blocks before we look at the outbound queue
const OUTBOUND_POLL_MS: u64 = 50;

/// accept loop.  Runs until the listener socket dies.
pub fn listener_thread(
    listener: TcpListener,
    engine_tx: mpsc::Sender<EngineMessage>,
    midi_available: bool,
) -> () {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let conn_tx = engine_tx.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_stream(stream, conn_tx, midi_available) {
                        debug!("connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}

fn handle_stream(
    stream: TcpStream,
    engine_tx: mpsc::Sender<EngineMessage>,
    midi_available: bool,
) -> Result<(), BoxError> {
    let mut head = [0u8; 1024];
    let n = stream.peek(&mut head)?;
    let head = String::from_utf8_lossy(&head[..n]).to_lowercase();
    if head.contains("upgrade: websocket") {
        client_session(stream, engine_tx)
    } else {
        serve_http(stream, &head, midi_available)
    }
}

/// the JSON body behind GET /api/status
pub fn status_body(midi_available: bool) -> Value {
    json!({
        "server": "jcmp-relay",
        "midiConnected": midi_available,
        "timestamp": get_milli_time() as u64,
    })
}

fn serve_http(mut stream: TcpStream, head: &str, midi_available: bool) -> Result<(), BoxError> {
    // consume the request we only peeked at so far
    let mut buf = [0u8; 1024];
    let _res = stream.read(&mut buf)?;
    let (code, body) = if head.starts_with("get /api/status") {
        ("200 OK", status_body(midi_available).to_string())
    } else {
        ("404 Not Found", String::from("{\"error\":\"not found\"}"))
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn client_session(
    stream: TcpStream,
    engine_tx: mpsc::Sender<EngineMessage>,
) -> Result<(), BoxError> {
    let mut sock = match accept(stream) {
        Ok(s) => s,
        Err(e) => return Err(format!("websocket handshake failed: {}", e).into()),
    };
    sock.get_ref()
        .set_read_timeout(Some(Duration::from_millis(OUTBOUND_POLL_MS)))?;

    // register with the engine and learn our id
    let (signal_tx, signal_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    engine_tx.send(EngineMessage::Connect {
        reply: reply_tx,
        signal_tx,
    })?;
    let client_id = reply_rx.recv()?;
    info!("signaling client {} connected", client_id);

    loop {
        match sock.read_message() {
            Ok(msg) => {
                if msg.is_text() {
                    match msg.to_text() {
                        Ok(text) => match serde_json::from_str::<Value>(text) {
                            Ok(message) => {
                                if engine_tx
                                    .send(EngineMessage::Signal { client_id, message })
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            // malformed frame, drop it on the floor
                            Err(_) => {}
                        },
                        Err(_) => {}
                    }
                } else if msg.is_close() {
                    break;
                }
            }
            Err(WsError::Io(e))
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                // read timeout, fall through to the outbound drain
            }
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(e) => {
                debug!("client {} socket error: {}", client_id, e);
                break;
            }
        }
        // relay anything the engine wants delivered
        let mut dead = false;
        while let Ok(frame) = signal_rx.try_recv() {
            if sock.write_message(Message::Text(frame.to_string())).is_err() {
                dead = true;
                break;
            }
        }
        if dead {
            break;
        }
    }
    let _res = engine_tx.send(EngineMessage::Disconnect { client_id });
    info!("signaling client {} disconnected", client_id);
    Ok(())
}
