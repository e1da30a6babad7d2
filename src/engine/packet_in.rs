//! Packet-in classification and delivery.
//!
//! Frames arriving from the fabric are parsed into the twelve-tuple the
//! slice filters speak, then copied to every slice whose filter covers them.
//! Topology probes and transit-port traffic never reach a controller.

use super::Engine;
use crate::wire::{DatapathId, Frame, Match, Message, PacketIn, Wildcards, ETHERTYPE_LLDP};
use smoltcp::wire::{
    ArpPacket, EthernetFrame, EthernetProtocol, Icmpv4Packet, IpProtocol, Ipv4Packet, TcpPacket,
    UdpPacket,
};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// dl_vlan value meaning "untagged" in OF1.0 matches.
const VLAN_NONE: u16 = 0xffff;
const ETHERTYPE_VLAN: u16 = 0x8100;

impl Engine {
    pub(super) fn dispatch_packet_in(&mut self, dpid: DatapathId, pi: PacketIn) {
        let Ok(eth) = EthernetFrame::new_checked(&pi.data[..]) else {
            debug!(%dpid, len = pi.data.len(), "dropping runt packet-in");
            return;
        };
        if u16::from(eth.ethertype()) == ETHERTYPE_LLDP {
            if self.topology.process_lldp(dpid, pi.in_port, &pi.data) {
                return;
            }
        }
        if self.topology.is_transit_port(dpid, pi.in_port) {
            trace!(%dpid, port = pi.in_port, "swallowing packet-in from transit port");
            return;
        }
        let Some(virt) = self.ports.virt_of_phys(dpid, pi.in_port) else {
            debug!(%dpid, port = pi.in_port, "packet-in from unmapped port");
            return;
        };

        let flow = flow_of_frame(&pi.data, virt);
        let buffer_id = self.buffers.store(dpid, pi.data.clone());
        let out = PacketIn {
            buffer_id,
            total_len: pi.total_len,
            in_port: virt,
            reason: pi.reason,
            data: pi.data,
        };
        let mut delivered = 0usize;
        for slice in self.slices_matching(&flow) {
            slice
                .handle
                .send(Frame::new(0, Message::PacketIn(out.clone())));
            delivered += 1;
        }
        if delivered == 0 {
            // Nobody will ever reference the buffer; reclaim it now.
            let _ = self.buffers.take(buffer_id);
        }
    }
}

/// Build the concrete twelve-tuple of a link-layer frame, OF1.0 style:
/// nothing wildcarded, absent layers left at zero, untagged frames carrying
/// the reserved vlan value.
pub(super) fn flow_of_frame(data: &[u8], in_port: u16) -> Match {
    let mut flow = Match {
        wildcards: Wildcards::empty(),
        in_port,
        dl_src: [0; 6],
        dl_dst: [0; 6],
        dl_vlan: VLAN_NONE,
        dl_vlan_pcp: 0,
        dl_type: 0,
        nw_tos: 0,
        nw_proto: 0,
        nw_src: Ipv4Addr::UNSPECIFIED,
        nw_dst: Ipv4Addr::UNSPECIFIED,
        tp_src: 0,
        tp_dst: 0,
    };
    let Ok(eth) = EthernetFrame::new_checked(data) else {
        return flow;
    };
    flow.dl_src = eth.src_addr().0;
    flow.dl_dst = eth.dst_addr().0;

    let mut ethertype = u16::from(eth.ethertype());
    let mut payload = eth.payload();
    if ethertype == ETHERTYPE_VLAN && payload.len() >= 4 {
        let tci = u16::from_be_bytes([payload[0], payload[1]]);
        flow.dl_vlan = tci & 0x0fff;
        flow.dl_vlan_pcp = (tci >> 13) as u8;
        ethertype = u16::from_be_bytes([payload[2], payload[3]]);
        payload = &payload[4..];
    }
    flow.dl_type = ethertype;

    match EthernetProtocol::from(ethertype) {
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(payload) else {
                return flow;
            };
            flow.nw_src = Ipv4Addr::from(ip.src_addr().0);
            flow.nw_dst = Ipv4Addr::from(ip.dst_addr().0);
            flow.nw_tos = ip.dscp() << 2;
            let proto = ip.next_header();
            flow.nw_proto = u8::from(proto);
            // Transport headers are only present in the first fragment.
            if ip.frag_offset() != 0 {
                return flow;
            }
            let l4 = ip.payload();
            match proto {
                IpProtocol::Tcp => {
                    if let Ok(tcp) = TcpPacket::new_checked(l4) {
                        flow.tp_src = tcp.src_port();
                        flow.tp_dst = tcp.dst_port();
                    }
                }
                IpProtocol::Udp => {
                    if let Ok(udp) = UdpPacket::new_checked(l4) {
                        flow.tp_src = udp.src_port();
                        flow.tp_dst = udp.dst_port();
                    }
                }
                IpProtocol::Icmp => {
                    if let Ok(icmp) = Icmpv4Packet::new_checked(l4) {
                        flow.tp_src = u16::from(u8::from(icmp.msg_type()));
                        flow.tp_dst = u16::from(icmp.msg_code());
                    }
                }
                _ => {}
            }
        }
        EthernetProtocol::Arp => {
            if let Ok(arp) = ArpPacket::new_checked(payload) {
                flow.nw_proto = u16::from(arp.operation()) as u8;
                if arp.source_protocol_addr().len() == 4 && arp.target_protocol_addr().len() == 4 {
                    let spa: [u8; 4] = arp.source_protocol_addr().try_into().expect("4 bytes");
                    let tpa: [u8; 4] = arp.target_protocol_addr().try_into().expect("4 bytes");
                    flow.nw_src = Ipv4Addr::from(spa);
                    flow.nw_dst = Ipv4Addr::from(tpa);
                }
            }
        }
        _ => {}
    }
    flow
}
