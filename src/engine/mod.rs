//! The virtualization engine: shared maps plus the message dispatch for both
//! session halves.
//!
//! Controllers talk to a virtual switch ([`Engine::controller_message`]),
//! physical switches talk to a virtual controller ([`Engine::switch_event`]).
//! Everything in between (port namespace, buffer bridge, xid correlation,
//! slice registry) lives here behind one lock owned by the caller.

mod buffer;
mod flow_mod;
mod packet_in;
mod packet_out;
mod port_map;
mod stats;
mod xid;

#[cfg(test)]
mod tests;

pub use buffer::BufferBridge;
pub use port_map::PortMap;
pub use xid::{Accumulator, CompletedStats, StatsChunk, XidTracker, SWEEP_INTERVAL, XID_TIMEOUT};

use crate::topology::Topology;
use crate::wire::{
    ActionTypes, Capabilities, DatapathId, ErrorKind, ErrorMsg, Frame, Match, Message, PortDesc,
    PortNo, PortStatus, PortStatusReason, SwitchConfig, SwitchFeatures,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Miss-send-len pushed to every physical switch at join.
const SWITCH_MISS_SEND_LEN: u16 = 0x1fff;
/// Miss-send-len reported to controllers in get-config replies.
const CONTROLLER_MISS_SEND_LEN: u16 = 3000;
/// How the virtual switch identifies itself in description stats.
pub const VIRTUAL_SWITCH_DESC: &str = "Mirage_flowvisor";
/// Name of the single flow table every slice sees.
pub const VIRTUAL_TABLE_NAME: &str = "flowvisor";

/// Identity of a slice registration. Stable for the life of the session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SliceId(pub u64);

/// A controller request that cannot be realized on the fabric. Sent back as
/// an OpenFlow error carrying the offending frame; never fatal to a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("virtual port {0} is not mapped")]
    UnknownPort(u16),
    #[error("buffer id {0} was never issued or already consumed")]
    UnknownBuffer(u32),
    #[error("output target {0:?} cannot be realized on the fabric")]
    UnsupportedTarget(PortNo),
    #[error("no path from {src} to {dst}")]
    NoPath { src: DatapathId, dst: DatapathId },
    #[error("unsupported delete shape (in_port {in_port:?}, out_port {out_port:?})")]
    BadDeleteShape { in_port: PortNo, out_port: PortNo },
}

impl TranslateError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            TranslateError::UnknownPort(_) => ErrorKind::ActionBadOutPort,
            TranslateError::UnknownBuffer(_) => ErrorKind::RequestBufferUnknown,
            TranslateError::UnsupportedTarget(_) => ErrorKind::RequestBadStat,
            TranslateError::NoPath { .. } => ErrorKind::ActionBadOutPort,
            TranslateError::BadDeleteShape { .. } => ErrorKind::RequestBadStat,
        }
    }
}

/// Outbound side of one session. Frames pushed here are drained in order by
/// the session's writer task; a closed channel means the peer is gone and the
/// frame is dropped on the floor, matching best-effort fan-out.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl SessionHandle {
    pub fn channel() -> (SessionHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle { tx }, rx)
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

pub struct Slice {
    pub id: SliceId,
    pub dpid: DatapathId,
    pub filter: Match,
    pub handle: SessionHandle,
}

pub struct Engine {
    pub(crate) ports: PortMap,
    pub(crate) buffers: BufferBridge,
    pub(crate) xids: XidTracker,
    slices: Vec<Slice>,
    switches: FxHashMap<DatapathId, SessionHandle>,
    topology: Arc<dyn Topology>,
    next_slice_id: u64,
}

impl Engine {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Engine {
            ports: PortMap::new(),
            buffers: BufferBridge::new(),
            xids: XidTracker::new(),
            slices: Vec::new(),
            switches: FxHashMap::default(),
            topology,
            next_slice_id: 1,
        }
    }

    // --- slice registry ---

    pub fn add_slice(&mut self, dpid: DatapathId, filter: Match, handle: SessionHandle) -> SliceId {
        let id = SliceId(self.next_slice_id);
        self.next_slice_id += 1;
        self.slices.push(Slice {
            id,
            dpid,
            filter,
            handle,
        });
        info!(slice = ?id, %dpid, "slice registered");
        id
    }

    pub fn remove_slice(&mut self, id: SliceId) {
        self.slices.retain(|s| s.id != id);
        self.xids.drop_slice(id);
        info!(slice = ?id, "slice removed");
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    fn slice(&self, id: SliceId) -> Option<&Slice> {
        self.slices.iter().find(|s| s.id == id)
    }

    pub(crate) fn send_to_slice(&self, id: SliceId, frame: Frame) {
        if let Some(slice) = self.slice(id) {
            if !slice.handle.send(frame) {
                debug!(slice = ?id, "dropping frame for closed controller session");
            }
        }
    }

    fn send_error(&self, slice: SliceId, xid: u32, kind: ErrorKind, original: &[u8]) {
        self.send_to_slice(
            slice,
            Frame::new(xid, Message::Error(ErrorMsg::new(kind, original.to_vec()))),
        );
    }

    // --- switch table ---

    pub(crate) fn send_to_switch(&self, dpid: DatapathId, frame: Frame) {
        match self.switches.get(&dpid) {
            Some(handle) => {
                if !handle.send(frame) {
                    debug!(%dpid, "dropping frame for closed switch session");
                }
            }
            None => debug!(%dpid, "dropping frame for unknown switch"),
        }
    }

    pub(crate) fn switch_ids(&self) -> Vec<DatapathId> {
        self.switches.keys().copied().collect()
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }

    /// A physical switch finished its handshake.
    pub fn switch_joined(
        &mut self,
        dpid: DatapathId,
        features: &SwitchFeatures,
        handle: SessionHandle,
    ) {
        if self.switches.insert(dpid, handle).is_some() {
            warn!(%dpid, "switch rejoined while a previous session was live; replacing it");
        }
        self.topology.add_switch(dpid);
        self.send_to_switch(
            dpid,
            Frame::new(
                0,
                Message::SetConfig(SwitchConfig {
                    flags: 0,
                    miss_send_len: SWITCH_MISS_SEND_LEN,
                }),
            ),
        );
        for port in &features.ports {
            // Reserved-range numbers (the switch's own LOCAL port) stay
            // physical-only; they are not part of any slice's view.
            if PortNo::from_u16(port.port_no) == PortNo::Port(port.port_no) {
                self.register_port(dpid, port.port_no, port.clone());
            }
        }
        info!(%dpid, ports = features.ports.len(), "switch joined");
    }

    /// A physical switch session ended: release everything it owned.
    pub fn switch_left(&mut self, dpid: DatapathId) {
        self.switches.remove(&dpid);
        self.topology.remove_switch(dpid);
        for (_, desc) in self.ports.remove_switch(dpid) {
            self.announce_port(PortStatusReason::Delete, desc);
        }
        let purged = self.buffers.purge_switch(dpid);
        if purged > 0 {
            debug!(%dpid, purged, "dropped buffered packets of departed switch");
        }
        for completed in self.xids.drop_switch(dpid) {
            self.deliver_stats(completed);
        }
        info!(%dpid, "switch left");
    }

    // --- port lifecycle ---

    fn register_port(&mut self, dpid: DatapathId, phys: u16, desc: PortDesc) -> u16 {
        let (virt, rewritten) = self.ports.add(dpid, phys, desc);
        self.topology.add_port(dpid, phys);
        self.announce_port(PortStatusReason::Add, rewritten);
        virt
    }

    fn unregister_port(&mut self, dpid: DatapathId, phys: u16) {
        self.topology.remove_port(dpid, phys);
        if let Some((_, desc)) = self.ports.remove(dpid, phys) {
            self.announce_port(PortStatusReason::Delete, desc);
        }
    }

    fn announce_port(&self, reason: PortStatusReason, desc: PortDesc) {
        let status = Message::PortStatus(PortStatus { reason, desc });
        for slice in &self.slices {
            slice.handle.send(Frame::new(0, status.clone()));
        }
    }

    // --- controller half ---

    /// Dispatch one message from a controller session. `raw` is the frame as
    /// it arrived, echoed back inside error replies.
    pub fn controller_message(&mut self, slice: SliceId, frame: Frame, raw: &[u8]) {
        let xid = frame.xid;
        match frame.message {
            Message::Hello(_) | Message::SetConfig(_) | Message::EchoReply(_) => {}
            Message::Error(err) => {
                warn!(slice = ?slice, err_type = err.err_type, code = err.code,
                      "controller reported an error");
            }
            Message::EchoRequest(payload) => {
                self.send_to_slice(slice, Frame::new(xid, Message::EchoReply(payload)));
            }
            Message::FeaturesRequest => {
                let features = self.synthesize_features(slice);
                self.send_to_slice(slice, Frame::new(xid, Message::FeaturesReply(features)));
            }
            Message::GetConfigRequest => {
                self.send_to_slice(
                    slice,
                    Frame::new(
                        xid,
                        Message::GetConfigReply(SwitchConfig {
                            flags: 0,
                            miss_send_len: CONTROLLER_MISS_SEND_LEN,
                        }),
                    ),
                );
            }
            Message::BarrierRequest => {
                // Answered locally; the fabric is not barriered.
                self.send_to_slice(slice, Frame::new(xid, Message::BarrierReply));
            }
            Message::StatsRequest(req) => self.handle_stats_request(slice, xid, req, raw),
            Message::PacketOut(po) => match self.translate_packet_out(po) {
                Ok(emissions) => {
                    for (dpid, po) in emissions {
                        self.send_to_switch(dpid, Frame::new(0, Message::PacketOut(po)));
                    }
                }
                Err(err) => {
                    debug!(slice = ?slice, %err, "packet-out rejected");
                    self.send_error(slice, xid, err.error_kind(), raw);
                }
            },
            Message::FlowMod(fm) => match self.translate_flow_mod(fm) {
                Ok(emissions) => {
                    for (dpid, message) in emissions {
                        self.send_to_switch(dpid, Frame::new(0, message));
                    }
                }
                Err(err) => {
                    debug!(slice = ?slice, %err, "flow-mod rejected");
                    self.send_error(slice, xid, err.error_kind(), raw);
                }
            },
            Message::QueueGetConfigRequest(_) => {
                self.send_error(slice, xid, ErrorKind::QueueOpBadPort, raw);
            }
            // Everything a switch would never be asked: features/config
            // replies, async switch events, stats replies, vendor extensions.
            _ => {
                self.send_error(slice, xid, ErrorKind::RequestBadType, raw);
            }
        }
    }

    fn synthesize_features(&self, slice: SliceId) -> SwitchFeatures {
        let dpid = self
            .slice(slice)
            .map(|s| s.dpid)
            .unwrap_or(DatapathId(0));
        SwitchFeatures {
            datapath_id: dpid,
            n_buffers: 0,
            n_tables: 1,
            capabilities: Capabilities::FLOW_STATS
                | Capabilities::TABLE_STATS
                | Capabilities::PORT_STATS
                | Capabilities::ARP_MATCH_IP,
            actions: ActionTypes::OUTPUT
                | ActionTypes::SET_VLAN_VID
                | ActionTypes::SET_VLAN_PCP
                | ActionTypes::STRIP_VLAN
                | ActionTypes::SET_DL_SRC
                | ActionTypes::SET_DL_DST
                | ActionTypes::SET_NW_SRC
                | ActionTypes::SET_NW_DST
                | ActionTypes::SET_NW_TOS
                | ActionTypes::SET_TP_SRC
                | ActionTypes::SET_TP_DST,
            ports: self.ports.descriptors(),
        }
    }

    // --- switch half ---

    /// Dispatch one event frame from an established switch session.
    pub fn switch_event(&mut self, dpid: DatapathId, frame: Frame) {
        let xid = frame.xid;
        match frame.message {
            Message::Hello(_) | Message::EchoReply(_) | Message::GetConfigReply(_)
            | Message::BarrierReply => {}
            Message::EchoRequest(payload) => {
                self.send_to_switch(dpid, Frame::new(xid, Message::EchoReply(payload)));
            }
            Message::PacketIn(pi) => self.dispatch_packet_in(dpid, pi),
            Message::FlowRemoved(fr) => self.forward_flow_removed(dpid, xid, fr),
            Message::PortStatus(status) => self.handle_port_status(dpid, status),
            Message::StatsReply(reply) => self.record_stats_reply(dpid, xid, reply),
            Message::Error(err) => {
                warn!(%dpid, err_type = err.err_type, code = err.code,
                      "switch rejected a proxied message");
            }
            other => {
                debug!(%dpid, msg_type = other.type_code(), "ignoring unexpected switch message");
            }
        }
    }

    fn handle_port_status(&mut self, dpid: DatapathId, status: PortStatus) {
        let phys = status.desc.port_no;
        if PortNo::from_u16(phys) != PortNo::Port(phys) {
            return;
        }
        match status.reason {
            PortStatusReason::Add => {
                self.register_port(dpid, phys, status.desc);
            }
            PortStatusReason::Delete => {
                self.unregister_port(dpid, phys);
            }
            PortStatusReason::Modify => {
                // Keep the mapping, refresh the descriptor, pass the change on.
                let (_, rewritten) = self.ports.add(dpid, phys, status.desc);
                self.announce_port(PortStatusReason::Modify, rewritten);
            }
        }
    }

    fn forward_flow_removed(
        &mut self,
        dpid: DatapathId,
        xid: u32,
        mut removed: crate::wire::FlowRemoved,
    ) {
        if !removed.of_match.in_port_wildcarded() {
            match self.ports.virt_of_phys(dpid, removed.of_match.in_port) {
                Some(virt) => removed.of_match.in_port = virt,
                // Expiry of an internal path segment; controllers never saw
                // this flow's ingress.
                None => return,
            }
        }
        for slice in &self.slices {
            if slice.filter.covers(&removed.of_match) {
                slice
                    .handle
                    .send(Frame::new(xid, Message::FlowRemoved(removed.clone())));
            }
        }
    }

    /// Deliver every slice's view of the packet-in classification result.
    pub(crate) fn slices_matching<'a>(&'a self, flow: &'a Match) -> impl Iterator<Item = &'a Slice> {
        self.slices.iter().filter(move |s| s.filter.covers(flow))
    }

    // --- maintenance ---

    /// Periodic xid maintenance; stale aggregations are flushed to their
    /// controllers with whatever arrived.
    pub fn sweep_stats(&mut self) {
        for completed in self.xids.sweep(Instant::now()) {
            self.deliver_stats(completed);
        }
    }
}
