//! Hand-rolled big-endian codec for the OF1.0 frame subset in [`super`].
//!
//! Layout notes live next to each body; lengths are validated up front so a
//! malformed frame is rejected as a whole rather than half-applied.

use super::*;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const T_HELLO: u8 = 0;
pub const T_ERROR: u8 = 1;
pub const T_ECHO_REQUEST: u8 = 2;
pub const T_ECHO_REPLY: u8 = 3;
pub const T_FEATURES_REQUEST: u8 = 5;
pub const T_FEATURES_REPLY: u8 = 6;
pub const T_GET_CONFIG_REQUEST: u8 = 7;
pub const T_GET_CONFIG_REPLY: u8 = 8;
pub const T_SET_CONFIG: u8 = 9;
pub const T_PACKET_IN: u8 = 10;
pub const T_FLOW_REMOVED: u8 = 11;
pub const T_PORT_STATUS: u8 = 12;
pub const T_PACKET_OUT: u8 = 13;
pub const T_FLOW_MOD: u8 = 14;
pub const T_STATS_REQUEST: u8 = 16;
pub const T_STATS_REPLY: u8 = 17;
pub const T_BARRIER_REQUEST: u8 = 18;
pub const T_BARRIER_REPLY: u8 = 19;
pub const T_QUEUE_GET_CONFIG_REQUEST: u8 = 20;

const STATS_DESC: u16 = 0;
const STATS_FLOW: u16 = 1;
const STATS_AGGREGATE: u16 = 2;
const STATS_TABLE: u16 = 3;
const STATS_PORT: u16 = 4;

const STATS_REPLY_MORE: u16 = 1 << 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {0} body")]
    Truncated(&'static str),
    #[error("unsupported OpenFlow version {0:#04x}")]
    BadVersion(u8),
    #[error("header length {0} shorter than the fixed header")]
    BadLength(u16),
    #[error("unknown action type {0}")]
    UnknownAction(u16),
    #[error("action length {0} disagrees with its type")]
    BadActionLength(u16),
    #[error("unknown stats kind {0}")]
    UnknownStatsKind(u16),
}

struct Reader<'a> {
    buf: &'a [u8],
    ctx: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], ctx: &'static str) -> Self {
        Reader { buf, ctx }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated(self.ctx));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn mac(&mut self) -> Result<[u8; 6], DecodeError> {
        let b = self.bytes(6)?;
        let mut raw = [0u8; 6];
        raw.copy_from_slice(b);
        Ok(raw)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf = &[];
        out
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_pad(buf: &mut Vec<u8>, n: usize) {
    buf.resize(buf.len() + n, 0);
}

/// Fixed-width, NUL-padded string field (port and table names, desc fields).
fn put_name(buf: &mut Vec<u8>, name: &str, width: usize) {
    let raw = name.as_bytes();
    let take = raw.len().min(width - 1);
    buf.extend_from_slice(&raw[..take]);
    put_pad(buf, width - take);
}

fn read_name(r: &mut Reader<'_>, width: usize) -> Result<String, DecodeError> {
    let raw = r.bytes(width)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

// --- match ---

fn put_match(buf: &mut Vec<u8>, m: &Match) {
    put_u32(buf, m.wildcards.bits());
    put_u16(buf, m.in_port);
    buf.extend_from_slice(&m.dl_src);
    buf.extend_from_slice(&m.dl_dst);
    put_u16(buf, m.dl_vlan);
    buf.push(m.dl_vlan_pcp);
    put_pad(buf, 1);
    put_u16(buf, m.dl_type);
    buf.push(m.nw_tos);
    buf.push(m.nw_proto);
    put_pad(buf, 2);
    put_u32(buf, u32::from(m.nw_src));
    put_u32(buf, u32::from(m.nw_dst));
    put_u16(buf, m.tp_src);
    put_u16(buf, m.tp_dst);
}

fn read_match(r: &mut Reader<'_>) -> Result<Match, DecodeError> {
    let wildcards = Wildcards::from_bits_retain(r.u32()?);
    let in_port = r.u16()?;
    let dl_src = r.mac()?;
    let dl_dst = r.mac()?;
    let dl_vlan = r.u16()?;
    let dl_vlan_pcp = r.u8()?;
    r.skip(1)?;
    let dl_type = r.u16()?;
    let nw_tos = r.u8()?;
    let nw_proto = r.u8()?;
    r.skip(2)?;
    let nw_src = Ipv4Addr::from(r.u32()?);
    let nw_dst = Ipv4Addr::from(r.u32()?);
    let tp_src = r.u16()?;
    let tp_dst = r.u16()?;
    Ok(Match {
        wildcards,
        in_port,
        dl_src,
        dl_dst,
        dl_vlan,
        dl_vlan_pcp,
        dl_type,
        nw_tos,
        nw_proto,
        nw_src,
        nw_dst,
        tp_src,
        tp_dst,
    })
}

// --- actions ---

fn put_action(buf: &mut Vec<u8>, a: &Action) {
    let (type_code, len) = match a {
        Action::Output { .. } => (0u16, 8u16),
        Action::SetVlanVid(_) => (1, 8),
        Action::SetVlanPcp(_) => (2, 8),
        Action::StripVlan => (3, 8),
        Action::SetDlSrc(_) => (4, 16),
        Action::SetDlDst(_) => (5, 16),
        Action::SetNwSrc(_) => (6, 8),
        Action::SetNwDst(_) => (7, 8),
        Action::SetNwTos(_) => (8, 8),
        Action::SetTpSrc(_) => (9, 8),
        Action::SetTpDst(_) => (10, 8),
        Action::Enqueue { .. } => (11, 16),
    };
    put_u16(buf, type_code);
    put_u16(buf, len);
    match a {
        Action::Output { port, max_len } => {
            put_u16(buf, port.as_u16());
            put_u16(buf, *max_len);
        }
        Action::SetVlanVid(vid) => {
            put_u16(buf, *vid);
            put_pad(buf, 2);
        }
        Action::SetVlanPcp(pcp) => {
            buf.push(*pcp);
            put_pad(buf, 3);
        }
        Action::StripVlan => put_pad(buf, 4),
        Action::SetDlSrc(mac) | Action::SetDlDst(mac) => {
            buf.extend_from_slice(mac);
            put_pad(buf, 6);
        }
        Action::SetNwSrc(addr) | Action::SetNwDst(addr) => put_u32(buf, u32::from(*addr)),
        Action::SetNwTos(tos) => {
            buf.push(*tos);
            put_pad(buf, 3);
        }
        Action::SetTpSrc(p) | Action::SetTpDst(p) => {
            put_u16(buf, *p);
            put_pad(buf, 2);
        }
        Action::Enqueue { port, queue_id } => {
            put_u16(buf, port.as_u16());
            put_pad(buf, 6);
            put_u32(buf, *queue_id);
        }
    }
}

fn put_actions(buf: &mut Vec<u8>, actions: &[Action]) {
    for a in actions {
        put_action(buf, a);
    }
}

fn read_actions(r: &mut Reader<'_>, mut len: usize) -> Result<Vec<Action>, DecodeError> {
    let mut actions = Vec::new();
    while len > 0 {
        if len < 4 {
            return Err(DecodeError::Truncated("action list"));
        }
        let type_code = r.u16()?;
        let act_len = r.u16()? as usize;
        if act_len < 8 || act_len > len {
            return Err(DecodeError::BadActionLength(act_len as u16));
        }
        let action = match type_code {
            0 => {
                let port = PortNo::from_u16(r.u16()?);
                let max_len = r.u16()?;
                Action::Output { port, max_len }
            }
            1 => {
                let vid = r.u16()?;
                r.skip(2)?;
                Action::SetVlanVid(vid)
            }
            2 => {
                let pcp = r.u8()?;
                r.skip(3)?;
                Action::SetVlanPcp(pcp)
            }
            3 => {
                r.skip(4)?;
                Action::StripVlan
            }
            4 | 5 => {
                let mac = r.mac()?;
                r.skip(6)?;
                if type_code == 4 {
                    Action::SetDlSrc(mac)
                } else {
                    Action::SetDlDst(mac)
                }
            }
            6 | 7 => {
                let addr = Ipv4Addr::from(r.u32()?);
                if type_code == 6 {
                    Action::SetNwSrc(addr)
                } else {
                    Action::SetNwDst(addr)
                }
            }
            8 => {
                let tos = r.u8()?;
                r.skip(3)?;
                Action::SetNwTos(tos)
            }
            9 | 10 => {
                let p = r.u16()?;
                r.skip(2)?;
                if type_code == 9 {
                    Action::SetTpSrc(p)
                } else {
                    Action::SetTpDst(p)
                }
            }
            11 => {
                let port = PortNo::from_u16(r.u16()?);
                r.skip(6)?;
                let queue_id = r.u32()?;
                Action::Enqueue { port, queue_id }
            }
            other => return Err(DecodeError::UnknownAction(other)),
        };
        // Consume any trailing slack an oversized length field declared.
        let consumed = 4 + match &action {
            Action::SetDlSrc(_) | Action::SetDlDst(_) | Action::Enqueue { .. } => 12,
            _ => 4,
        };
        if act_len > consumed {
            r.skip(act_len - consumed)?;
        }
        len -= act_len;
        actions.push(action);
    }
    Ok(actions)
}

// --- port descriptors ---

fn put_port_desc(buf: &mut Vec<u8>, p: &PortDesc) {
    put_u16(buf, p.port_no);
    buf.extend_from_slice(&p.hw_addr);
    put_name(buf, &p.name, 16);
    put_u32(buf, p.config);
    put_u32(buf, p.state);
    put_u32(buf, p.curr);
    put_u32(buf, p.advertised);
    put_u32(buf, p.supported);
    put_u32(buf, p.peer);
}

fn read_port_desc(r: &mut Reader<'_>) -> Result<PortDesc, DecodeError> {
    let port_no = r.u16()?;
    let hw_addr = r.mac()?;
    let name = read_name(r, 16)?;
    let config = r.u32()?;
    let state = r.u32()?;
    let curr = r.u32()?;
    let advertised = r.u32()?;
    let supported = r.u32()?;
    let peer = r.u32()?;
    Ok(PortDesc {
        port_no,
        hw_addr,
        name,
        config,
        state,
        curr,
        advertised,
        supported,
        peer,
    })
}

// --- stats bodies ---

fn put_stats_request(buf: &mut Vec<u8>, req: &StatsRequest) {
    match req {
        StatsRequest::Desc => {
            put_u16(buf, STATS_DESC);
            put_u16(buf, 0);
        }
        StatsRequest::Flow {
            of_match,
            table_id,
            out_port,
        }
        | StatsRequest::Aggregate {
            of_match,
            table_id,
            out_port,
        } => {
            let kind = if matches!(req, StatsRequest::Flow { .. }) {
                STATS_FLOW
            } else {
                STATS_AGGREGATE
            };
            put_u16(buf, kind);
            put_u16(buf, 0);
            put_match(buf, of_match);
            buf.push(*table_id);
            put_pad(buf, 1);
            put_u16(buf, out_port.as_u16());
        }
        StatsRequest::Table => {
            put_u16(buf, STATS_TABLE);
            put_u16(buf, 0);
        }
        StatsRequest::Port { port_no } => {
            put_u16(buf, STATS_PORT);
            put_u16(buf, 0);
            put_u16(buf, port_no.as_u16());
            put_pad(buf, 6);
        }
    }
}

fn read_stats_request(r: &mut Reader<'_>) -> Result<StatsRequest, DecodeError> {
    let kind = r.u16()?;
    let _flags = r.u16()?;
    match kind {
        STATS_DESC => Ok(StatsRequest::Desc),
        STATS_FLOW | STATS_AGGREGATE => {
            let of_match = read_match(r)?;
            let table_id = r.u8()?;
            r.skip(1)?;
            let out_port = PortNo::from_u16(r.u16()?);
            if kind == STATS_FLOW {
                Ok(StatsRequest::Flow {
                    of_match,
                    table_id,
                    out_port,
                })
            } else {
                Ok(StatsRequest::Aggregate {
                    of_match,
                    table_id,
                    out_port,
                })
            }
        }
        STATS_TABLE => Ok(StatsRequest::Table),
        STATS_PORT => {
            let port_no = PortNo::from_u16(r.u16()?);
            r.skip(6)?;
            Ok(StatsRequest::Port { port_no })
        }
        other => Err(DecodeError::UnknownStatsKind(other)),
    }
}

fn put_flow_stats_entry(buf: &mut Vec<u8>, e: &FlowStatsEntry) {
    put_u16(buf, e.wire_len() as u16);
    buf.push(e.table_id);
    put_pad(buf, 1);
    put_match(buf, &e.of_match);
    put_u32(buf, e.duration_sec);
    put_u32(buf, e.duration_nsec);
    put_u16(buf, e.priority);
    put_u16(buf, e.idle_timeout);
    put_u16(buf, e.hard_timeout);
    put_pad(buf, 6);
    put_u64(buf, e.cookie);
    put_u64(buf, e.packet_count);
    put_u64(buf, e.byte_count);
    put_actions(buf, &e.actions);
}

fn read_flow_stats_entries(r: &mut Reader<'_>) -> Result<Vec<FlowStatsEntry>, DecodeError> {
    let mut entries = Vec::new();
    while r.remaining() > 0 {
        let entry_len = r.u16()? as usize;
        if entry_len < FLOW_STATS_ENTRY_LEN {
            return Err(DecodeError::Truncated("flow stats entry"));
        }
        let table_id = r.u8()?;
        r.skip(1)?;
        let of_match = read_match(r)?;
        let duration_sec = r.u32()?;
        let duration_nsec = r.u32()?;
        let priority = r.u16()?;
        let idle_timeout = r.u16()?;
        let hard_timeout = r.u16()?;
        r.skip(6)?;
        let cookie = r.u64()?;
        let packet_count = r.u64()?;
        let byte_count = r.u64()?;
        let actions = read_actions(r, entry_len - FLOW_STATS_ENTRY_LEN)?;
        entries.push(FlowStatsEntry {
            table_id,
            of_match,
            duration_sec,
            duration_nsec,
            priority,
            idle_timeout,
            hard_timeout,
            cookie,
            packet_count,
            byte_count,
            actions,
        });
    }
    Ok(entries)
}

fn put_stats_reply(buf: &mut Vec<u8>, reply: &StatsReply) {
    match reply {
        StatsReply::Desc(desc) => {
            put_u16(buf, STATS_DESC);
            put_u16(buf, 0);
            put_name(buf, &desc.mfr_desc, 256);
            put_name(buf, &desc.hw_desc, 256);
            put_name(buf, &desc.sw_desc, 256);
            put_name(buf, &desc.serial_num, 32);
            put_name(buf, &desc.dp_desc, 256);
        }
        StatsReply::Flow { entries, more } => {
            put_u16(buf, STATS_FLOW);
            put_u16(buf, if *more { STATS_REPLY_MORE } else { 0 });
            for e in entries {
                put_flow_stats_entry(buf, e);
            }
        }
        StatsReply::Aggregate(agg) => {
            put_u16(buf, STATS_AGGREGATE);
            put_u16(buf, 0);
            put_u64(buf, agg.packet_count);
            put_u64(buf, agg.byte_count);
            put_u32(buf, agg.flow_count);
            put_pad(buf, 4);
        }
        StatsReply::Table(tables) => {
            put_u16(buf, STATS_TABLE);
            put_u16(buf, 0);
            for t in tables {
                buf.push(t.table_id);
                put_pad(buf, 3);
                put_name(buf, &t.name, 32);
                put_u32(buf, t.wildcards.bits());
                put_u32(buf, t.max_entries);
                put_u32(buf, t.active_count);
                put_u64(buf, t.lookup_count);
                put_u64(buf, t.matched_count);
            }
        }
        StatsReply::Port { entries, more } => {
            put_u16(buf, STATS_PORT);
            put_u16(buf, if *more { STATS_REPLY_MORE } else { 0 });
            for p in entries {
                put_u16(buf, p.port_no);
                put_pad(buf, 6);
                put_u64(buf, p.rx_packets);
                put_u64(buf, p.tx_packets);
                put_u64(buf, p.rx_bytes);
                put_u64(buf, p.tx_bytes);
                put_u64(buf, p.rx_dropped);
                put_u64(buf, p.tx_dropped);
                put_u64(buf, p.rx_errors);
                put_u64(buf, p.tx_errors);
                put_u64(buf, p.rx_frame_err);
                put_u64(buf, p.rx_over_err);
                put_u64(buf, p.rx_crc_err);
                put_u64(buf, p.collisions);
            }
        }
    }
}

fn read_stats_reply(r: &mut Reader<'_>) -> Result<StatsReply, DecodeError> {
    let kind = r.u16()?;
    let flags = r.u16()?;
    let more = flags & STATS_REPLY_MORE != 0;
    match kind {
        STATS_DESC => {
            let mfr_desc = read_name(r, 256)?;
            let hw_desc = read_name(r, 256)?;
            let sw_desc = read_name(r, 256)?;
            let serial_num = read_name(r, 32)?;
            let dp_desc = read_name(r, 256)?;
            Ok(StatsReply::Desc(DescStats {
                mfr_desc,
                hw_desc,
                sw_desc,
                serial_num,
                dp_desc,
            }))
        }
        STATS_FLOW => Ok(StatsReply::Flow {
            entries: read_flow_stats_entries(r)?,
            more,
        }),
        STATS_AGGREGATE => {
            let packet_count = r.u64()?;
            let byte_count = r.u64()?;
            let flow_count = r.u32()?;
            r.skip(4)?;
            Ok(StatsReply::Aggregate(AggregateStats {
                packet_count,
                byte_count,
                flow_count,
            }))
        }
        STATS_TABLE => {
            let mut tables = Vec::new();
            while r.remaining() > 0 {
                let table_id = r.u8()?;
                r.skip(3)?;
                let name = read_name(r, 32)?;
                let wildcards = Wildcards::from_bits_retain(r.u32()?);
                let max_entries = r.u32()?;
                let active_count = r.u32()?;
                let lookup_count = r.u64()?;
                let matched_count = r.u64()?;
                tables.push(TableStatsEntry {
                    table_id,
                    name,
                    wildcards,
                    max_entries,
                    active_count,
                    lookup_count,
                    matched_count,
                });
            }
            Ok(StatsReply::Table(tables))
        }
        STATS_PORT => {
            let mut entries = Vec::new();
            while r.remaining() > 0 {
                let port_no = r.u16()?;
                r.skip(6)?;
                let mut e = PortStatsEntry {
                    port_no,
                    ..PortStatsEntry::default()
                };
                e.rx_packets = r.u64()?;
                e.tx_packets = r.u64()?;
                e.rx_bytes = r.u64()?;
                e.tx_bytes = r.u64()?;
                e.rx_dropped = r.u64()?;
                e.tx_dropped = r.u64()?;
                e.rx_errors = r.u64()?;
                e.tx_errors = r.u64()?;
                e.rx_frame_err = r.u64()?;
                e.rx_over_err = r.u64()?;
                e.rx_crc_err = r.u64()?;
                e.collisions = r.u64()?;
                entries.push(e);
            }
            Ok(StatsReply::Port { entries, more })
        }
        other => Err(DecodeError::UnknownStatsKind(other)),
    }
}

// --- frames ---

impl Message {
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Hello(_) => T_HELLO,
            Message::Error(_) => T_ERROR,
            Message::EchoRequest(_) => T_ECHO_REQUEST,
            Message::EchoReply(_) => T_ECHO_REPLY,
            Message::FeaturesRequest => T_FEATURES_REQUEST,
            Message::FeaturesReply(_) => T_FEATURES_REPLY,
            Message::GetConfigRequest => T_GET_CONFIG_REQUEST,
            Message::GetConfigReply(_) => T_GET_CONFIG_REPLY,
            Message::SetConfig(_) => T_SET_CONFIG,
            Message::PacketIn(_) => T_PACKET_IN,
            Message::FlowRemoved(_) => T_FLOW_REMOVED,
            Message::PortStatus(_) => T_PORT_STATUS,
            Message::PacketOut(_) => T_PACKET_OUT,
            Message::FlowMod(_) => T_FLOW_MOD,
            Message::StatsRequest(_) => T_STATS_REQUEST,
            Message::StatsReply(_) => T_STATS_REPLY,
            Message::BarrierRequest => T_BARRIER_REQUEST,
            Message::BarrierReply => T_BARRIER_REPLY,
            Message::QueueGetConfigRequest(_) => T_QUEUE_GET_CONFIG_REQUEST,
            Message::Other { msg_type, .. } => *msg_type,
        }
    }

    fn put_body(&self, buf: &mut Vec<u8>) {
        match self {
            Message::Hello(body)
            | Message::EchoRequest(body)
            | Message::EchoReply(body)
            | Message::QueueGetConfigRequest(body)
            | Message::Other { body, .. } => buf.extend_from_slice(body),
            Message::Error(e) => {
                put_u16(buf, e.err_type);
                put_u16(buf, e.code);
                buf.extend_from_slice(&e.data);
            }
            Message::FeaturesRequest
            | Message::GetConfigRequest
            | Message::BarrierRequest
            | Message::BarrierReply => {}
            Message::FeaturesReply(f) => {
                put_u64(buf, f.datapath_id.0);
                put_u32(buf, f.n_buffers);
                buf.push(f.n_tables);
                put_pad(buf, 3);
                put_u32(buf, f.capabilities.bits());
                put_u32(buf, f.actions.bits());
                for p in &f.ports {
                    put_port_desc(buf, p);
                }
            }
            Message::GetConfigReply(c) | Message::SetConfig(c) => {
                put_u16(buf, c.flags);
                put_u16(buf, c.miss_send_len);
            }
            Message::PacketIn(pi) => {
                put_u32(buf, pi.buffer_id);
                put_u16(buf, pi.total_len);
                put_u16(buf, pi.in_port);
                buf.push(match pi.reason {
                    PacketInReason::NoMatch => 0,
                    PacketInReason::Action => 1,
                });
                put_pad(buf, 1);
                buf.extend_from_slice(&pi.data);
            }
            Message::FlowRemoved(fr) => {
                put_match(buf, &fr.of_match);
                put_u64(buf, fr.cookie);
                put_u16(buf, fr.priority);
                buf.push(fr.reason);
                put_pad(buf, 1);
                put_u32(buf, fr.duration_sec);
                put_u32(buf, fr.duration_nsec);
                put_u16(buf, fr.idle_timeout);
                put_pad(buf, 2);
                put_u64(buf, fr.packet_count);
                put_u64(buf, fr.byte_count);
            }
            Message::PortStatus(ps) => {
                buf.push(match ps.reason {
                    PortStatusReason::Add => 0,
                    PortStatusReason::Delete => 1,
                    PortStatusReason::Modify => 2,
                });
                put_pad(buf, 7);
                put_port_desc(buf, &ps.desc);
            }
            Message::PacketOut(po) => {
                put_u32(buf, po.buffer_id);
                put_u16(buf, po.in_port.as_u16());
                put_u16(buf, actions_wire_len(&po.actions) as u16);
                put_actions(buf, &po.actions);
                buf.extend_from_slice(&po.data);
            }
            Message::FlowMod(fm) => {
                put_match(buf, &fm.of_match);
                put_u64(buf, fm.cookie);
                put_u16(
                    buf,
                    match fm.command {
                        FlowModCommand::Add => 0,
                        FlowModCommand::Modify { strict: false } => 1,
                        FlowModCommand::Modify { strict: true } => 2,
                        FlowModCommand::Delete { strict: false } => 3,
                        FlowModCommand::Delete { strict: true } => 4,
                    },
                );
                put_u16(buf, fm.idle_timeout);
                put_u16(buf, fm.hard_timeout);
                put_u16(buf, fm.priority);
                put_u32(buf, fm.buffer_id);
                put_u16(buf, fm.out_port.as_u16());
                put_u16(buf, fm.flags.bits());
                put_actions(buf, &fm.actions);
            }
            Message::StatsRequest(req) => put_stats_request(buf, req),
            Message::StatsReply(reply) => put_stats_reply(buf, reply),
        }
    }
}

impl Frame {
    /// Serialize header + body. The length field is patched in afterwards.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(OFP_VERSION);
        buf.push(self.message.type_code());
        put_u16(&mut buf, 0);
        put_u32(&mut buf, self.xid);
        self.message.put_body(&mut buf);
        let len = buf.len().min(MAX_FRAME_LEN) as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    pub fn wire_len(&self) -> usize {
        self.encode().len()
    }

    /// Decode one complete frame (header + body, as framed off the socket).
    pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::Truncated("header"));
        }
        let version = bytes[0];
        // Hello frames are exempt so version negotiation failures stay readable.
        if version != OFP_VERSION && bytes[1] != T_HELLO {
            return Err(DecodeError::BadVersion(version));
        }
        let msg_type = bytes[1];
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]);
        if (declared as usize) < HEADER_LEN || (declared as usize) > bytes.len() {
            return Err(DecodeError::BadLength(declared));
        }
        let xid = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let body = &bytes[HEADER_LEN..declared as usize];
        let message = decode_body(msg_type, body)?;
        Ok(Frame { xid, message })
    }
}

fn decode_body(msg_type: u8, body: &[u8]) -> Result<Message, DecodeError> {
    match msg_type {
        T_HELLO => Ok(Message::Hello(body.to_vec())),
        T_ERROR => {
            let mut r = Reader::new(body, "error");
            let err_type = r.u16()?;
            let code = r.u16()?;
            Ok(Message::Error(ErrorMsg {
                err_type,
                code,
                data: r.rest(),
            }))
        }
        T_ECHO_REQUEST => Ok(Message::EchoRequest(body.to_vec())),
        T_ECHO_REPLY => Ok(Message::EchoReply(body.to_vec())),
        T_FEATURES_REQUEST => Ok(Message::FeaturesRequest),
        T_FEATURES_REPLY => {
            let mut r = Reader::new(body, "features reply");
            let datapath_id = DatapathId(r.u64()?);
            let n_buffers = r.u32()?;
            let n_tables = r.u8()?;
            r.skip(3)?;
            let capabilities = Capabilities::from_bits_truncate(r.u32()?);
            let actions = ActionTypes::from_bits_truncate(r.u32()?);
            let mut ports = Vec::new();
            while r.remaining() >= PORT_DESC_LEN {
                ports.push(read_port_desc(&mut r)?);
            }
            Ok(Message::FeaturesReply(SwitchFeatures {
                datapath_id,
                n_buffers,
                n_tables,
                capabilities,
                actions,
                ports,
            }))
        }
        T_GET_CONFIG_REQUEST => Ok(Message::GetConfigRequest),
        T_GET_CONFIG_REPLY | T_SET_CONFIG => {
            let mut r = Reader::new(body, "switch config");
            let config = SwitchConfig {
                flags: r.u16()?,
                miss_send_len: r.u16()?,
            };
            Ok(if msg_type == T_SET_CONFIG {
                Message::SetConfig(config)
            } else {
                Message::GetConfigReply(config)
            })
        }
        T_PACKET_IN => {
            let mut r = Reader::new(body, "packet-in");
            let buffer_id = r.u32()?;
            let total_len = r.u16()?;
            let in_port = r.u16()?;
            let reason = if r.u8()? == 0 {
                PacketInReason::NoMatch
            } else {
                PacketInReason::Action
            };
            r.skip(1)?;
            Ok(Message::PacketIn(PacketIn {
                buffer_id,
                total_len,
                in_port,
                reason,
                data: r.rest(),
            }))
        }
        T_FLOW_REMOVED => {
            let mut r = Reader::new(body, "flow-removed");
            let of_match = read_match(&mut r)?;
            let cookie = r.u64()?;
            let priority = r.u16()?;
            let reason = r.u8()?;
            r.skip(1)?;
            let duration_sec = r.u32()?;
            let duration_nsec = r.u32()?;
            let idle_timeout = r.u16()?;
            r.skip(2)?;
            let packet_count = r.u64()?;
            let byte_count = r.u64()?;
            Ok(Message::FlowRemoved(FlowRemoved {
                of_match,
                cookie,
                priority,
                reason,
                duration_sec,
                duration_nsec,
                idle_timeout,
                packet_count,
                byte_count,
            }))
        }
        T_PORT_STATUS => {
            let mut r = Reader::new(body, "port-status");
            let reason = match r.u8()? {
                0 => PortStatusReason::Add,
                1 => PortStatusReason::Delete,
                _ => PortStatusReason::Modify,
            };
            r.skip(7)?;
            let desc = read_port_desc(&mut r)?;
            Ok(Message::PortStatus(PortStatus { reason, desc }))
        }
        T_PACKET_OUT => {
            let mut r = Reader::new(body, "packet-out");
            let buffer_id = r.u32()?;
            let in_port = PortNo::from_u16(r.u16()?);
            let actions_len = r.u16()? as usize;
            if actions_len > r.remaining() {
                return Err(DecodeError::Truncated("packet-out"));
            }
            let actions = read_actions(&mut r, actions_len)?;
            Ok(Message::PacketOut(PacketOut {
                buffer_id,
                in_port,
                actions,
                data: r.rest(),
            }))
        }
        T_FLOW_MOD => {
            let mut r = Reader::new(body, "flow-mod");
            let of_match = read_match(&mut r)?;
            let cookie = r.u64()?;
            let command = match r.u16()? {
                0 => FlowModCommand::Add,
                1 => FlowModCommand::Modify { strict: false },
                2 => FlowModCommand::Modify { strict: true },
                3 => FlowModCommand::Delete { strict: false },
                _ => FlowModCommand::Delete { strict: true },
            };
            let idle_timeout = r.u16()?;
            let hard_timeout = r.u16()?;
            let priority = r.u16()?;
            let buffer_id = r.u32()?;
            let out_port = PortNo::from_u16(r.u16()?);
            let flags = FlowModFlags::from_bits_truncate(r.u16()?);
            let actions_len = r.remaining();
            let actions = read_actions(&mut r, actions_len)?;
            Ok(Message::FlowMod(FlowMod {
                of_match,
                cookie,
                command,
                idle_timeout,
                hard_timeout,
                priority,
                buffer_id,
                out_port,
                flags,
                actions,
            }))
        }
        T_STATS_REQUEST => {
            let mut r = Reader::new(body, "stats request");
            Ok(Message::StatsRequest(read_stats_request(&mut r)?))
        }
        T_STATS_REPLY => {
            let mut r = Reader::new(body, "stats reply");
            Ok(Message::StatsReply(read_stats_reply(&mut r)?))
        }
        T_BARRIER_REQUEST => Ok(Message::BarrierRequest),
        T_BARRIER_REPLY => Ok(Message::BarrierReply),
        T_QUEUE_GET_CONFIG_REQUEST => Ok(Message::QueueGetConfigRequest(body.to_vec())),
        other => Ok(Message::Other {
            msg_type: other,
            body: body.to_vec(),
        }),
    }
}
