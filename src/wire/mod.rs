//! OpenFlow 1.0 message model.
//!
//! Typed views of the message subset the proxy translates, plus the byte
//! codec in [`codec`]. Types the proxy does not understand are kept as raw
//! bodies so error replies can echo the offending frame.

mod codec;

pub use codec::DecodeError;

use bitflags::bitflags;
use std::fmt;
use std::net::Ipv4Addr;

pub const OFP_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 8;
/// Largest frame the 16-bit header length field can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;
/// Sentinel buffer id meaning "no packet buffered".
pub const NO_BUFFER: u32 = 0xffff_ffff;

pub const ETHERTYPE_LLDP: u16 = 0x88cc;

/// 64-bit datapath identifier of a switch, physical or virtual.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(pub u64);

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl fmt::Debug for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dpid:{self}")
    }
}

/// An OpenFlow 1.0 port number: either a concrete port or one of the
/// reserved constants, recognized by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortNo {
    Port(u16),
    /// Highest usable concrete port (0xff00).
    Max,
    InPort,
    Table,
    Normal,
    Flood,
    All,
    Controller,
    Local,
    /// "Not associated with a port" (0xffff), also the wildcard in delete
    /// out_port filters.
    None,
}

impl PortNo {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0xff00 => PortNo::Max,
            0xfff8 => PortNo::InPort,
            0xfff9 => PortNo::Table,
            0xfffa => PortNo::Normal,
            0xfffb => PortNo::Flood,
            0xfffc => PortNo::All,
            0xfffd => PortNo::Controller,
            0xfffe => PortNo::Local,
            0xffff => PortNo::None,
            n => PortNo::Port(n),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            PortNo::Port(n) => n,
            PortNo::Max => 0xff00,
            PortNo::InPort => 0xfff8,
            PortNo::Table => 0xfff9,
            PortNo::Normal => 0xfffa,
            PortNo::Flood => 0xfffb,
            PortNo::All => 0xfffc,
            PortNo::Controller => 0xfffd,
            PortNo::Local => 0xfffe,
            PortNo::None => 0xffff,
        }
    }
}

bitflags! {
    /// ofp_flow_wildcards. The nw_src/nw_dst fields are 6-bit counts of
    /// ignored low address bits; use the accessors rather than the raw mask
    /// constants.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Wildcards: u32 {
        const IN_PORT = 1 << 0;
        const DL_VLAN = 1 << 1;
        const DL_SRC = 1 << 2;
        const DL_DST = 1 << 3;
        const DL_TYPE = 1 << 4;
        const NW_PROTO = 1 << 5;
        const TP_SRC = 1 << 6;
        const TP_DST = 1 << 7;
        const NW_SRC_MASK = 0x3f << 8;
        const NW_DST_MASK = 0x3f << 14;
        const DL_VLAN_PCP = 1 << 20;
        const NW_TOS = 1 << 21;
        const ALL = (1 << 22) - 1;
    }
}

impl Wildcards {
    /// Number of low nw_src bits ignored when matching, capped at 32.
    pub fn nw_src_ignored(self) -> u32 {
        ((self.bits() >> 8) & 0x3f).min(32)
    }

    pub fn nw_dst_ignored(self) -> u32 {
        ((self.bits() >> 14) & 0x3f).min(32)
    }

    pub fn with_nw_src_ignored(self, bits: u32) -> Self {
        let raw = (self.bits() & !(0x3f << 8)) | ((bits.min(63)) << 8);
        Wildcards::from_bits_retain(raw)
    }

    pub fn with_nw_dst_ignored(self, bits: u32) -> Self {
        let raw = (self.bits() & !(0x3f << 14)) | ((bits.min(63)) << 14);
        Wildcards::from_bits_retain(raw)
    }
}

/// ofp_match: the twelve-tuple with its wildcard mask.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Match {
    pub wildcards: Wildcards,
    pub in_port: u16,
    pub dl_src: [u8; 6],
    pub dl_dst: [u8; 6],
    pub dl_vlan: u16,
    pub dl_vlan_pcp: u8,
    pub dl_type: u16,
    pub nw_tos: u8,
    pub nw_proto: u8,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub tp_src: u16,
    pub tp_dst: u16,
}

pub const MATCH_LEN: usize = 40;

impl Match {
    /// A match with every field wildcarded.
    pub fn any() -> Self {
        Match {
            wildcards: Wildcards::ALL,
            in_port: 0,
            dl_src: [0; 6],
            dl_dst: [0; 6],
            dl_vlan: 0,
            dl_vlan_pcp: 0,
            dl_type: 0,
            nw_tos: 0,
            nw_proto: 0,
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            tp_src: 0,
            tp_dst: 0,
        }
    }

    pub fn in_port_wildcarded(&self) -> bool {
        self.wildcards.contains(Wildcards::IN_PORT)
    }

    /// True when every field `self` pins down agrees with `concrete`.
    /// `self` is the filter; its wildcards decide which fields count.
    pub fn covers(&self, concrete: &Match) -> bool {
        let w = self.wildcards;
        if !w.contains(Wildcards::IN_PORT) && self.in_port != concrete.in_port {
            return false;
        }
        if !w.contains(Wildcards::DL_SRC) && self.dl_src != concrete.dl_src {
            return false;
        }
        if !w.contains(Wildcards::DL_DST) && self.dl_dst != concrete.dl_dst {
            return false;
        }
        if !w.contains(Wildcards::DL_VLAN) && self.dl_vlan != concrete.dl_vlan {
            return false;
        }
        if !w.contains(Wildcards::DL_VLAN_PCP) && self.dl_vlan_pcp != concrete.dl_vlan_pcp {
            return false;
        }
        if !w.contains(Wildcards::DL_TYPE) && self.dl_type != concrete.dl_type {
            return false;
        }
        if !w.contains(Wildcards::NW_TOS) && self.nw_tos != concrete.nw_tos {
            return false;
        }
        if !w.contains(Wildcards::NW_PROTO) && self.nw_proto != concrete.nw_proto {
            return false;
        }
        if !prefix_eq(self.nw_src, concrete.nw_src, w.nw_src_ignored()) {
            return false;
        }
        if !prefix_eq(self.nw_dst, concrete.nw_dst, w.nw_dst_ignored()) {
            return false;
        }
        if !w.contains(Wildcards::TP_SRC) && self.tp_src != concrete.tp_src {
            return false;
        }
        if !w.contains(Wildcards::TP_DST) && self.tp_dst != concrete.tp_dst {
            return false;
        }
        true
    }
}

fn prefix_eq(a: Ipv4Addr, b: Ipv4Addr, ignored_bits: u32) -> bool {
    if ignored_bits >= 32 {
        return true;
    }
    let mask = u32::MAX << ignored_bits;
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// ofp_action_*. Only the OF1.0 standard actions; vendor actions are a
/// non-goal and fail decoding.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    Output { port: PortNo, max_len: u16 },
    SetVlanVid(u16),
    SetVlanPcp(u8),
    StripVlan,
    SetDlSrc([u8; 6]),
    SetDlDst([u8; 6]),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    Enqueue { port: PortNo, queue_id: u32 },
}

impl Action {
    pub fn output(port: PortNo) -> Self {
        Action::Output { port, max_len: 0 }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Action::SetDlSrc(_) | Action::SetDlDst(_) | Action::Enqueue { .. } => 16,
            _ => 8,
        }
    }
}

pub fn actions_wire_len(actions: &[Action]) -> usize {
    actions.iter().map(Action::wire_len).sum()
}

bitflags! {
    /// ofp_capabilities.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Capabilities: u32 {
        const FLOW_STATS = 1 << 0;
        const TABLE_STATS = 1 << 1;
        const PORT_STATS = 1 << 2;
        const STP = 1 << 3;
        const IP_REASM = 1 << 5;
        const QUEUE_STATS = 1 << 6;
        const ARP_MATCH_IP = 1 << 7;
    }
}

bitflags! {
    /// Bitmap of supported action types (1 << action type).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ActionTypes: u32 {
        const OUTPUT = 1 << 0;
        const SET_VLAN_VID = 1 << 1;
        const SET_VLAN_PCP = 1 << 2;
        const STRIP_VLAN = 1 << 3;
        const SET_DL_SRC = 1 << 4;
        const SET_DL_DST = 1 << 5;
        const SET_NW_SRC = 1 << 6;
        const SET_NW_DST = 1 << 7;
        const SET_NW_TOS = 1 << 8;
        const SET_TP_SRC = 1 << 9;
        const SET_TP_DST = 1 << 10;
        const ENQUEUE = 1 << 11;
    }
}

/// ofp_phy_port: a port descriptor as reported by a switch (and re-reported
/// by the proxy with the port number rewritten).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: [u8; 6],
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
}

pub const PORT_DESC_LEN: usize = 48;

impl PortDesc {
    pub fn named(port_no: u16, name: &str) -> Self {
        PortDesc {
            port_no,
            hw_addr: [0; 6],
            name: name.to_string(),
            config: 0,
            state: 0,
            curr: 0,
            advertised: 0,
            supported: 0,
            peer: 0,
        }
    }

    pub fn with_port_no(&self, port_no: u16) -> Self {
        PortDesc {
            port_no,
            ..self.clone()
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SwitchFeatures {
    pub datapath_id: DatapathId,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: Capabilities,
    pub actions: ActionTypes,
    pub ports: Vec<PortDesc>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketInReason {
    NoMatch,
    Action,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub in_port: u16,
    pub reason: PacketInReason,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: PortNo,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowModCommand {
    Add,
    Modify { strict: bool },
    Delete { strict: bool },
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct FlowModFlags: u16 {
        const SEND_FLOW_REM = 1 << 0;
        const CHECK_OVERLAP = 1 << 1;
        const EMERG = 1 << 2;
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FlowMod {
    pub of_match: Match,
    pub cookie: u64,
    pub command: FlowModCommand,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: PortNo,
    pub flags: FlowModFlags,
    pub actions: Vec<Action>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FlowRemoved {
    pub of_match: Match,
    pub cookie: u64,
    pub priority: u16,
    pub reason: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortStatusReason {
    Add,
    Delete,
    Modify,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PortStatus {
    pub reason: PortStatusReason,
    pub desc: PortDesc,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StatsRequest {
    Desc,
    Flow {
        of_match: Match,
        table_id: u8,
        out_port: PortNo,
    },
    Aggregate {
        of_match: Match,
        table_id: u8,
        out_port: PortNo,
    },
    Table,
    Port {
        port_no: PortNo,
    },
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DescStats {
    pub mfr_desc: String,
    pub hw_desc: String,
    pub sw_desc: String,
    pub serial_num: String,
    pub dp_desc: String,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FlowStatsEntry {
    pub table_id: u8,
    pub of_match: Match,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<Action>,
}

/// Fixed part of a flow stats entry on the wire, before its action list.
pub const FLOW_STATS_ENTRY_LEN: usize = 88;

impl FlowStatsEntry {
    pub fn wire_len(&self) -> usize {
        FLOW_STATS_ENTRY_LEN + actions_wire_len(&self.actions)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AggregateStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TableStatsEntry {
    pub table_id: u8,
    pub name: String,
    pub wildcards: Wildcards,
    pub max_entries: u32,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PortStatsEntry {
    pub port_no: u16,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_frame_err: u64,
    pub rx_over_err: u64,
    pub rx_crc_err: u64,
    pub collisions: u64,
}

pub const PORT_STATS_ENTRY_LEN: usize = 104;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StatsReply {
    Desc(DescStats),
    Flow {
        entries: Vec<FlowStatsEntry>,
        more: bool,
    },
    Aggregate(AggregateStats),
    Table(Vec<TableStatsEntry>),
    Port {
        entries: Vec<PortStatsEntry>,
        more: bool,
    },
}

/// The error (type, code) pairs the proxy emits, by their OF1.0 names.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    ActionBadOutPort,
    RequestBufferUnknown,
    RequestBadStat,
    RequestBadType,
    QueueOpBadPort,
}

impl ErrorKind {
    /// (ofp_error_type, code) on the wire.
    pub fn type_code(self) -> (u16, u16) {
        match self {
            ErrorKind::ActionBadOutPort => (2, 4),
            ErrorKind::RequestBufferUnknown => (1, 8),
            ErrorKind::RequestBadStat => (1, 2),
            ErrorKind::RequestBadType => (1, 1),
            ErrorKind::QueueOpBadPort => (5, 0),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

impl ErrorMsg {
    pub fn new(kind: ErrorKind, data: Vec<u8>) -> Self {
        let (err_type, code) = kind.type_code();
        ErrorMsg {
            err_type,
            code,
            data,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Hello(Vec<u8>),
    Error(ErrorMsg),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    StatsRequest(StatsRequest),
    StatsReply(StatsReply),
    BarrierRequest,
    BarrierReply,
    QueueGetConfigRequest(Vec<u8>),
    /// Anything else (vendor, port-mod, queue config replies, unknown type
    /// codes): kept as raw bytes for error echoing.
    Other { msg_type: u8, body: Vec<u8> },
}

/// One OpenFlow frame: a transaction id and a message body.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Frame {
    pub xid: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(xid: u32, message: Message) -> Self {
        Frame { xid, message }
    }
}
