//! Stats fan-out, fan-in, and reply marshalling.
//!
//! A controller's request goes to the relevant switches under a fresh xid;
//! the inverse translation (physical port numbers back into the virtual
//! namespace) happens as replies arrive, before they ever touch the
//! accumulator. Flows that only exist as internal path segments are not a
//! controller's business and are filtered out here.

use super::{
    Accumulator, CompletedStats, Engine, SliceId, StatsChunk, VIRTUAL_SWITCH_DESC,
    VIRTUAL_TABLE_NAME,
};
use crate::wire::{
    Action, AggregateStats, DatapathId, DescStats, FlowStatsEntry, Frame, Match, Message, PortNo,
    PortStatsEntry, StatsReply, StatsRequest, TableStatsEntry, Wildcards, HEADER_LEN,
    MAX_FRAME_LEN,
};
use tracing::debug;

/// Header + stats-reply preamble that every chunk of flow entries shares.
const STATS_REPLY_OVERHEAD: usize = HEADER_LEN + 4;

impl Engine {
    pub(super) fn handle_stats_request(
        &mut self,
        slice: SliceId,
        xid: u32,
        req: StatsRequest,
        raw: &[u8],
    ) {
        match req {
            StatsRequest::Desc => {
                let desc = DescStats {
                    mfr_desc: VIRTUAL_SWITCH_DESC.to_string(),
                    hw_desc: "virtual switch fabric".to_string(),
                    sw_desc: concat!("flowvisor ", env!("CARGO_PKG_VERSION")).to_string(),
                    serial_num: "None".to_string(),
                    dp_desc: VIRTUAL_SWITCH_DESC.to_string(),
                };
                self.send_to_slice(
                    slice,
                    Frame::new(xid, Message::StatsReply(StatsReply::Desc(desc))),
                );
            }
            StatsRequest::Table => {
                // One synthetic table stands in for the whole fabric; the
                // fan-out only decides *when* the answer goes back.
                let synthetic = TableStatsEntry {
                    table_id: 0,
                    name: VIRTUAL_TABLE_NAME.to_string(),
                    wildcards: Wildcards::ALL,
                    max_entries: 1 << 16,
                    active_count: 0,
                    lookup_count: 0,
                    matched_count: 0,
                };
                let targets = self.switch_ids();
                self.fanout_stats(
                    slice,
                    xid,
                    targets,
                    Accumulator::Table(vec![synthetic]),
                    StatsRequest::Table,
                );
            }
            StatsRequest::Flow {
                of_match,
                table_id,
                out_port,
            } => {
                match self.scope_flow_query(of_match, out_port) {
                    Ok((targets, of_match, out_port)) => self.fanout_stats(
                        slice,
                        xid,
                        targets,
                        Accumulator::Flow(Vec::new()),
                        StatsRequest::Flow {
                            of_match,
                            table_id,
                            out_port,
                        },
                    ),
                    Err(err) => self.send_error(slice, xid, err.error_kind(), raw),
                };
            }
            StatsRequest::Aggregate {
                of_match,
                table_id,
                out_port,
            } => {
                match self.scope_flow_query(of_match, out_port) {
                    Ok((targets, of_match, out_port)) => self.fanout_stats(
                        slice,
                        xid,
                        targets,
                        Accumulator::Aggregate(AggregateStats::default()),
                        StatsRequest::Aggregate {
                            of_match,
                            table_id,
                            out_port,
                        },
                    ),
                    Err(err) => self.send_error(slice, xid, err.error_kind(), raw),
                };
            }
            StatsRequest::Port { port_no } => {
                let scoped = match port_no {
                    PortNo::Port(v) => match self.ports.phys_of_virt_strict(v) {
                        Ok((dpid, phys)) => Some((vec![dpid], PortNo::Port(phys))),
                        Err(err) => {
                            self.send_error(slice, xid, err.error_kind(), raw);
                            return;
                        }
                    },
                    _ => None,
                };
                let (targets, port_no) = scoped.unwrap_or_else(|| (self.switch_ids(), PortNo::None));
                self.fanout_stats(
                    slice,
                    xid,
                    targets,
                    Accumulator::Port(Vec::new()),
                    StatsRequest::Port { port_no },
                );
            }
        }
    }

    /// Narrow a flow/aggregate query to the switch owning its concrete
    /// in_port, rewriting the match (and a concrete out_port filter) into
    /// physical numbers.
    fn scope_flow_query(
        &self,
        mut of_match: Match,
        out_port: PortNo,
    ) -> Result<(Vec<DatapathId>, Match, PortNo), super::TranslateError> {
        let mut targets = self.switch_ids();
        if !of_match.in_port_wildcarded() {
            if let PortNo::Port(v) = PortNo::from_u16(of_match.in_port) {
                let (dpid, phys) = self.ports.phys_of_virt_strict(v)?;
                of_match.in_port = phys;
                targets = vec![dpid];
            }
        }
        let out_port = match out_port {
            PortNo::Port(v) => PortNo::Port(self.ports.phys_of_virt_strict(v)?.1),
            other => other,
        };
        Ok((targets, of_match, out_port))
    }

    /// Allocate the fabric-side xid and emit the request. An empty (or fully
    /// disconnected) target set completes on the spot.
    fn fanout_stats(
        &mut self,
        slice: SliceId,
        controller_xid: u32,
        targets: Vec<DatapathId>,
        acc: Accumulator,
        req: StatsRequest,
    ) {
        let connected: Vec<DatapathId> = targets
            .into_iter()
            .filter(|dpid| self.switch_ids().contains(dpid))
            .collect();
        let fabric_xid =
            self.xids
                .allocate(slice, controller_xid, connected.iter().copied(), acc);
        if connected.is_empty() {
            if let Some(completed) = self.xids.take(fabric_xid) {
                self.deliver_stats(completed);
            }
            return;
        }
        for dpid in connected {
            self.send_to_switch(
                dpid,
                Frame::new(fabric_xid, Message::StatsRequest(req.clone())),
            );
        }
    }

    /// Fold one switch's stats reply into its pending aggregation.
    pub(super) fn record_stats_reply(&mut self, dpid: DatapathId, xid: u32, reply: StatsReply) {
        let (chunk, more) = match reply {
            StatsReply::Flow { entries, more } => {
                let translated = entries
                    .into_iter()
                    .filter_map(|e| self.virtualize_flow_entry(dpid, e))
                    .collect();
                (StatsChunk::Flow(translated), more)
            }
            StatsReply::Aggregate(agg) => (StatsChunk::Aggregate(agg), false),
            StatsReply::Table(tables) => (StatsChunk::Table(tables), false),
            StatsReply::Port { entries, more } => {
                let translated = entries
                    .into_iter()
                    .filter_map(|e| self.virtualize_port_entry(dpid, e))
                    .collect();
                (StatsChunk::Port(translated), more)
            }
            StatsReply::Desc(_) => {
                debug!(%dpid, "ignoring unsolicited description stats");
                return;
            }
        };
        match self.xids.record_reply(xid, dpid, chunk, more) {
            super::xid::ReplyOutcome::Complete(completed) => self.deliver_stats(completed),
            super::xid::ReplyOutcome::Partial => {}
            super::xid::ReplyOutcome::Unknown => {
                debug!(%dpid, xid, "stats reply for unknown xid");
            }
        }
    }

    /// Rewrite a flow entry into the virtual namespace. Entries anchored on
    /// ports no slice can name (transit links, departed ports) are internal
    /// plumbing and yield `None`.
    fn virtualize_flow_entry(
        &self,
        dpid: DatapathId,
        mut entry: FlowStatsEntry,
    ) -> Option<FlowStatsEntry> {
        if !entry.of_match.in_port_wildcarded() {
            if let PortNo::Port(phys) = PortNo::from_u16(entry.of_match.in_port) {
                entry.of_match.in_port = self.ports.virt_of_phys(dpid, phys)?;
            }
        }
        for action in &mut entry.actions {
            if let Action::Output { port, .. } = action {
                if let PortNo::Port(phys) = *port {
                    *port = PortNo::Port(self.ports.virt_of_phys(dpid, phys)?);
                }
            }
        }
        Some(entry)
    }

    fn virtualize_port_entry(
        &self,
        dpid: DatapathId,
        mut entry: PortStatsEntry,
    ) -> Option<PortStatsEntry> {
        match PortNo::from_u16(entry.port_no) {
            PortNo::Port(phys) => {
                entry.port_no = self.ports.virt_of_phys(dpid, phys)?;
                Some(entry)
            }
            // A physical switch's own reserved ports are not part of any
            // slice's view.
            _ => None,
        }
    }

    /// Marshal a finished aggregation back to its controller, chunking flow
    /// lists so no frame exceeds what the header length field can carry.
    pub(super) fn deliver_stats(&self, completed: CompletedStats) {
        let CompletedStats {
            slice,
            controller_xid,
            acc,
        } = completed;
        match acc {
            Accumulator::Flow(entries) => {
                let frames = chunk_flow_entries(entries);
                let last = frames.len() - 1;
                for (idx, chunk) in frames.into_iter().enumerate() {
                    self.send_to_slice(
                        slice,
                        Frame::new(
                            controller_xid,
                            Message::StatsReply(StatsReply::Flow {
                                entries: chunk,
                                more: idx != last,
                            }),
                        ),
                    );
                }
            }
            Accumulator::Aggregate(agg) => {
                self.send_to_slice(
                    slice,
                    Frame::new(controller_xid, Message::StatsReply(StatsReply::Aggregate(agg))),
                );
            }
            Accumulator::Table(tables) => {
                self.send_to_slice(
                    slice,
                    Frame::new(controller_xid, Message::StatsReply(StatsReply::Table(tables))),
                );
            }
            Accumulator::Port(entries) => {
                self.send_to_slice(
                    slice,
                    Frame::new(
                        controller_xid,
                        Message::StatsReply(StatsReply::Port {
                            entries,
                            more: false,
                        }),
                    ),
                );
            }
        }
    }
}

fn chunk_flow_entries(entries: Vec<FlowStatsEntry>) -> Vec<Vec<FlowStatsEntry>> {
    let capacity = MAX_FRAME_LEN - STATS_REPLY_OVERHEAD;
    let mut frames: Vec<Vec<FlowStatsEntry>> = vec![Vec::new()];
    let mut used = 0usize;
    for entry in entries {
        let len = entry.wire_len();
        if used + len > capacity && !frames.last().map(Vec::is_empty).unwrap_or(true) {
            frames.push(Vec::new());
            used = 0;
        }
        used += len;
        frames.last_mut().expect("at least one frame").push(entry);
    }
    frames
}
