//! Switch-facing session: the proxy plays the controller.

use super::{read_frame_bytes, spawn_writer};
use crate::engine::{Engine, SessionHandle};
use crate::wire::{DatapathId, Frame, Message};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive one accepted switch connection: handshake (hello, features), then
/// event pump into the engine until the socket closes.
pub(crate) async fn run_switch_session(engine: Arc<Mutex<Engine>>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    let (mut reader, writer) = stream.into_split();
    let (handle, rx) = SessionHandle::channel();
    let writer_task = spawn_writer(writer, rx);

    handle.send(Frame::new(0, Message::Hello(Vec::new())));
    handle.send(Frame::new(1, Message::FeaturesRequest));
    debug!(peer = %peer, "switch handshake started");

    let mut datapath: Option<DatapathId> = None;
    loop {
        let raw = match read_frame_bytes(&mut reader).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(peer = %peer, "switch closed the connection");
                break;
            }
            Err(err) => {
                warn!(peer = %peer, %err, "switch socket error");
                break;
            }
        };
        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %peer, %err, "undecodable switch frame");
                continue;
            }
        };
        match (datapath, frame.message) {
            (_, Message::Hello(_)) => {}
            // Keep-alive must work in both handshake and established state,
            // and without touching the engine.
            (_, Message::EchoRequest(payload)) => {
                handle.send(Frame::new(frame.xid, Message::EchoReply(payload)));
            }
            (None, Message::FeaturesReply(features)) => {
                let dpid = features.datapath_id;
                info!(peer = %peer, %dpid, "switch identified");
                engine.lock().switch_joined(dpid, &features, handle.clone());
                datapath = Some(dpid);
            }
            (Some(dpid), message) => {
                engine.lock().switch_event(dpid, Frame::new(frame.xid, message));
            }
            (None, message) => {
                debug!(peer = %peer, msg_type = message.type_code(),
                       "ignoring pre-handshake switch message");
            }
        }
    }

    if let Some(dpid) = datapath {
        engine.lock().switch_left(dpid);
    }
    writer_task.abort();
    info!(peer = %peer, "switch session closed");
}
