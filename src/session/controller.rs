//! Controller-facing session: the proxy plays the switch.

use super::{read_frame_bytes, spawn_writer};
use crate::engine::{Engine, SessionHandle, SliceId};
use crate::wire::{Frame, Message};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive one controller connection until it closes. The slice is already
/// registered; this loop feeds its messages to the engine and tears the
/// registration down on exit.
pub(crate) async fn run_controller_session(
    engine: Arc<Mutex<Engine>>,
    slice: SliceId,
    stream: TcpStream,
    handle: SessionHandle,
    rx: mpsc::UnboundedReceiver<Frame>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let (mut reader, writer) = stream.into_split();
    let writer_task = spawn_writer(writer, rx);

    // The proxy presents as a switch: hello first.
    handle.send(Frame::new(0, Message::Hello(Vec::new())));
    info!(slice = ?slice, peer = %peer, "controller session established");

    loop {
        let raw = match read_frame_bytes(&mut reader).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(slice = ?slice, "controller closed the connection");
                break;
            }
            Err(err) => {
                warn!(slice = ?slice, %err, "controller socket error");
                break;
            }
        };
        match Frame::decode(&raw) {
            Ok(frame) => engine.lock().controller_message(slice, frame, &raw),
            // The framing already consumed the full message; skip it and
            // keep the session.
            Err(err) => warn!(slice = ?slice, %err, "undecodable controller frame"),
        }
    }

    engine.lock().remove_slice(slice);
    writer_task.abort();
    info!(slice = ?slice, "controller session closed");
}
