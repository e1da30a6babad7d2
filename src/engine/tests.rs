//! Engine tests built from channel-backed fake sessions: a fake switch or
//! controller is just the receiving end of a session channel.

use super::xid::ReplyOutcome;
use super::*;
use crate::topology::{Link, StaticTopology};
use crate::wire::{
    Action, AggregateStats, DatapathId, ErrorKind, FlowMod, FlowModCommand, FlowModFlags,
    FlowStatsEntry, Frame, Match, Message, PacketIn, PacketInReason, PacketOut, PortDesc, PortNo,
    PortStatsEntry, PortStatus, PortStatusReason, StatsReply, StatsRequest, SwitchFeatures,
    Wildcards, MAX_FRAME_LEN, NO_BUFFER,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn dp(n: u64) -> DatapathId {
    DatapathId(n)
}

fn engine() -> Engine {
    Engine::new(std::sync::Arc::new(StaticTopology::empty()))
}

fn engine_with_links(links: impl IntoIterator<Item = Link>) -> Engine {
    Engine::new(std::sync::Arc::new(StaticTopology::new(links)))
}

fn features(dpid: DatapathId, ports: &[u16]) -> SwitchFeatures {
    SwitchFeatures {
        datapath_id: dpid,
        n_buffers: 256,
        n_tables: 2,
        capabilities: crate::wire::Capabilities::FLOW_STATS,
        actions: crate::wire::ActionTypes::OUTPUT,
        ports: ports
            .iter()
            .map(|&p| PortDesc::named(p, &format!("eth{p}")))
            .collect(),
    }
}

fn join_switch(
    engine: &mut Engine,
    dpid: DatapathId,
    ports: &[u16],
) -> mpsc::UnboundedReceiver<Frame> {
    let (handle, mut rx) = SessionHandle::channel();
    engine.switch_joined(dpid, &features(dpid, ports), handle);
    // Swallow the set-config pushed at join so tests start clean.
    let initial = drain(&mut rx);
    assert!(matches!(
        initial.first().map(|f| &f.message),
        Some(Message::SetConfig(_))
    ));
    rx
}

fn add_slice(
    engine: &mut Engine,
    dpid: DatapathId,
    filter: Match,
) -> (SliceId, mpsc::UnboundedReceiver<Frame>) {
    let (handle, rx) = SessionHandle::channel();
    let id = engine.add_slice(dpid, filter, handle);
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Run a controller message through the codec and into the engine, the way
/// a live session would.
fn from_controller(engine: &mut Engine, slice: SliceId, xid: u32, message: Message) -> Vec<u8> {
    let raw = Frame::new(xid, message).encode();
    let frame = Frame::decode(&raw).expect("frame must decode");
    engine.controller_message(slice, frame, &raw);
    raw
}

fn match_in_port(port: u16) -> Match {
    let mut m = Match::any();
    m.wildcards -= Wildcards::IN_PORT;
    m.in_port = port;
    m
}

fn filter_dl_type(dl_type: u16) -> Match {
    let mut m = Match::any();
    m.wildcards -= Wildcards::DL_TYPE;
    m.dl_type = dl_type;
    m
}

fn flow_add(of_match: Match, actions: Vec<Action>) -> FlowMod {
    FlowMod {
        of_match,
        cookie: 0,
        command: FlowModCommand::Add,
        idle_timeout: 60,
        hard_timeout: 0,
        priority: 100,
        buffer_id: NO_BUFFER,
        out_port: PortNo::None,
        flags: FlowModFlags::empty(),
        actions,
    }
}

fn eth_frame(ethertype: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 20];
    frame[0..6].copy_from_slice(&[0x02; 6]);
    frame[6..12].copy_from_slice(&[0x0a; 6]);
    frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
    frame
}

fn packet_in(in_port: u16, data: Vec<u8>) -> PacketIn {
    PacketIn {
        buffer_id: 42,
        total_len: data.len() as u16,
        in_port,
        reason: PacketInReason::NoMatch,
        data,
    }
}

// --- port namespace ---

#[test]
fn joined_ports_become_dense_virtual_numbers() {
    let mut engine = engine();
    let (_, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _switch = join_switch(&mut engine, dp(1), &[1, 2]);

    assert_eq!(engine.ports.phys_of_virt(10), Some((dp(1), 1)));
    assert_eq!(engine.ports.phys_of_virt(11), Some((dp(1), 2)));
    let adds = drain(&mut controller);
    assert_eq!(adds.len(), 2);
    for (frame, virt) in adds.iter().zip([10u16, 11]) {
        match &frame.message {
            Message::PortStatus(PortStatus {
                reason: PortStatusReason::Add,
                desc,
            }) => assert_eq!(desc.port_no, virt),
            other => panic!("expected port status add, got {other:?}"),
        }
    }
}

#[test]
fn port_map_stays_injective_across_churn() {
    let mut engine = engine();
    let _switch = join_switch(&mut engine, dp(1), &[1, 2]);
    engine.switch_event(
        dp(1),
        Frame::new(
            0,
            Message::PortStatus(PortStatus {
                reason: PortStatusReason::Delete,
                desc: PortDesc::named(1, "eth1"),
            }),
        ),
    );
    engine.switch_event(
        dp(1),
        Frame::new(
            0,
            Message::PortStatus(PortStatus {
                reason: PortStatusReason::Add,
                desc: PortDesc::named(1, "eth1"),
            }),
        ),
    );
    // The re-added port gets a fresh number; nothing aliases.
    assert_eq!(engine.ports.phys_of_virt(10), None);
    assert_eq!(engine.ports.virt_of_phys(dp(1), 1), Some(12));
    assert_eq!(engine.ports.phys_of_virt(12), Some((dp(1), 1)));
    assert_eq!(engine.ports.phys_of_virt(11), Some((dp(1), 2)));
}

#[test]
fn local_switch_ports_are_not_virtualized() {
    let mut engine = engine();
    let _switch = join_switch(&mut engine, dp(1), &[1, 0xfffe]);
    assert_eq!(engine.ports.len(), 1);
    assert_eq!(engine.ports.virt_of_phys(dp(1), 1), Some(10));
}

// --- flow-mod translation ---

#[test]
fn single_switch_flow_round_trip() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1, 2]);

    from_controller(
        &mut engine,
        slice,
        7,
        Message::FlowMod(flow_add(
            match_in_port(10),
            vec![Action::output(PortNo::Port(11))],
        )),
    );

    let sent = drain(&mut switch);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::FlowMod(fm) => {
            assert_eq!(fm.of_match.in_port, 1);
            assert_eq!(fm.actions, vec![Action::output(PortNo::Port(2))]);
            assert_eq!(fm.buffer_id, NO_BUFFER);
            assert_eq!(fm.out_port, PortNo::None);
        }
        other => panic!("expected flow-mod, got {other:?}"),
    }
}

#[test]
fn cross_switch_flow_follows_the_path() {
    let mut engine = engine_with_links([Link {
        a: (dp(1), 3),
        b: (dp(2), 3),
    }]);
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1, 3]); // virt 10, 11
    let mut sw2 = join_switch(&mut engine, dp(2), &[3, 2]); // virt 12, 13

    let rewrite = Action::SetDlDst([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
    from_controller(
        &mut engine,
        slice,
        8,
        Message::FlowMod(flow_add(
            match_in_port(10),
            vec![rewrite.clone(), Action::output(PortNo::Port(13))],
        )),
    );

    let to_sw1 = drain(&mut sw1);
    assert_eq!(to_sw1.len(), 1);
    match &to_sw1[0].message {
        Message::FlowMod(fm) => {
            assert_eq!(fm.of_match.in_port, 1);
            // Intermediate hop forwards only; the rewrite waits for the exit.
            assert_eq!(fm.actions, vec![Action::output(PortNo::Port(3))]);
        }
        other => panic!("expected flow-mod, got {other:?}"),
    }
    let to_sw2 = drain(&mut sw2);
    assert_eq!(to_sw2.len(), 1);
    match &to_sw2[0].message {
        Message::FlowMod(fm) => {
            assert_eq!(fm.of_match.in_port, 3);
            assert_eq!(
                fm.actions,
                vec![rewrite.clone(), Action::output(PortNo::Port(2))]
            );
        }
        other => panic!("expected flow-mod, got {other:?}"),
    }
}

#[test]
fn flow_to_unknown_port_is_rejected_without_emission() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    let raw = from_controller(
        &mut engine,
        slice,
        9,
        Message::FlowMod(flow_add(
            match_in_port(10),
            vec![Action::output(PortNo::Port(777))],
        )),
    );

    assert!(drain(&mut switch).is_empty());
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 9);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!((err.err_type, err.code), ErrorKind::ActionBadOutPort.type_code());
            assert_eq!(err.data, raw);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn wildcard_delete_is_broadcast() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1]);
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]);

    let mut delete = flow_add(Match::any(), Vec::new());
    delete.command = FlowModCommand::Delete { strict: false };
    from_controller(&mut engine, slice, 3, Message::FlowMod(delete));

    for rx in [&mut sw1, &mut sw2] {
        let sent = drain(rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].message,
            Message::FlowMod(FlowMod {
                command: FlowModCommand::Delete { strict: false },
                ..
            })
        ));
    }
}

#[test]
fn scoped_delete_goes_to_the_owning_switch_only() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1]); // virt 10
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]); // virt 11

    let mut delete = flow_add(match_in_port(11), Vec::new());
    delete.command = FlowModCommand::Delete { strict: true };
    from_controller(&mut engine, slice, 4, Message::FlowMod(delete));

    assert!(drain(&mut sw1).is_empty());
    let sent = drain(&mut sw2);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::FlowMod(fm) => assert_eq!(fm.of_match.in_port, 1),
        other => panic!("expected flow-mod, got {other:?}"),
    }
}

#[test]
fn delete_with_reserved_out_port_is_rejected() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    let mut delete = flow_add(Match::any(), Vec::new());
    delete.command = FlowModCommand::Delete { strict: false };
    delete.out_port = PortNo::Flood;
    from_controller(&mut engine, slice, 5, Message::FlowMod(delete));

    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!((err.err_type, err.code), ErrorKind::RequestBadStat.type_code());
        }
        other => panic!("expected error, got {other:?}"),
    }
}

// --- buffer bridge ---

#[test]
fn buffered_packet_rides_a_packet_out_inline() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _sw1 = join_switch(&mut engine, dp(1), &[1]); // virt 10
    let mut sw2 = join_switch(&mut engine, dp(2), &[2]); // virt 11
    drain(&mut controller);

    let payload = eth_frame(0x0800);
    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, payload.clone()))));

    let delivered = drain(&mut controller);
    assert_eq!(delivered.len(), 1);
    let virtual_buffer = match &delivered[0].message {
        Message::PacketIn(pi) => {
            assert_eq!(pi.in_port, 10);
            assert_eq!(pi.data, payload);
            pi.buffer_id
        }
        other => panic!("expected packet-in, got {other:?}"),
    };

    from_controller(
        &mut engine,
        slice,
        12,
        Message::PacketOut(PacketOut {
            buffer_id: virtual_buffer,
            in_port: PortNo::Port(10),
            actions: vec![Action::output(PortNo::Port(11))],
            data: Vec::new(),
        }),
    );

    let sent = drain(&mut sw2);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::PacketOut(po) => {
            assert_eq!(po.buffer_id, NO_BUFFER);
            assert_eq!(po.data, payload);
            assert_eq!(po.in_port, PortNo::None);
            assert_eq!(po.actions, vec![Action::output(PortNo::Port(2))]);
        }
        other => panic!("expected packet-out, got {other:?}"),
    }
    assert!(engine.buffers.is_empty());
}

#[test]
fn unknown_buffer_id_yields_an_error_and_no_emission() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    let raw = from_controller(
        &mut engine,
        slice,
        13,
        Message::PacketOut(PacketOut {
            buffer_id: 99_999,
            in_port: PortNo::None,
            actions: vec![Action::output(PortNo::Port(10))],
            data: Vec::new(),
        }),
    );

    assert!(drain(&mut switch).is_empty());
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!(
                (err.err_type, err.code),
                ErrorKind::RequestBufferUnknown.type_code()
            );
            assert_eq!(err.data, raw);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn buffered_flow_mod_releases_the_packet_at_the_exit() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1, 2]);
    drain(&mut controller);

    let payload = eth_frame(0x0800);
    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, payload.clone()))));
    let virtual_buffer = match &drain(&mut controller)[0].message {
        Message::PacketIn(pi) => pi.buffer_id,
        other => panic!("expected packet-in, got {other:?}"),
    };

    let mut fm = flow_add(match_in_port(10), vec![Action::output(PortNo::Port(11))]);
    fm.buffer_id = virtual_buffer;
    from_controller(&mut engine, slice, 14, Message::FlowMod(fm));

    let sent = drain(&mut switch);
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0].message, Message::FlowMod(_)));
    match &sent[1].message {
        Message::PacketOut(po) => {
            assert_eq!(po.data, payload);
            assert_eq!(po.buffer_id, NO_BUFFER);
            assert_eq!(po.actions, vec![Action::output(PortNo::Port(2))]);
        }
        other => panic!("expected trailing packet-out, got {other:?}"),
    }
    assert!(engine.buffers.is_empty());
}

// --- stats aggregation ---

#[test]
fn aggregate_fan_in_merges_counters_under_the_original_xid() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switches: Vec<_> = [1u64, 2, 3]
        .iter()
        .map(|&n| (dp(n), join_switch(&mut engine, dp(n), &[1])))
        .collect();
    drain(&mut controller);

    from_controller(
        &mut engine,
        slice,
        77,
        Message::StatsRequest(StatsRequest::Aggregate {
            of_match: Match::any(),
            table_id: 0xff,
            out_port: PortNo::None,
        }),
    );

    let mut fabric_xid = None;
    for (_, rx) in switches.iter_mut() {
        let sent = drain(rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].message,
            Message::StatsRequest(StatsRequest::Aggregate { .. })
        ));
        // One fan-out, one fabric-side xid.
        match fabric_xid {
            None => fabric_xid = Some(sent[0].xid),
            Some(xid) => assert_eq!(sent[0].xid, xid),
        }
    }
    let fabric_xid = fabric_xid.unwrap();
    assert_ne!(fabric_xid, 77);

    // Replies land in arbitrary order.
    let parts = [(5, 500, 2), (0, 0, 0), (1, 100, 1)];
    for ((dpid, _), (p, b, f)) in switches.iter().rev().zip(parts) {
        assert!(drain(&mut controller).is_empty());
        engine.switch_event(
            *dpid,
            Frame::new(
                fabric_xid,
                Message::StatsReply(StatsReply::Aggregate(AggregateStats {
                    packet_count: p,
                    byte_count: b,
                    flow_count: f,
                })),
            ),
        );
    }

    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 77);
    match &replies[0].message {
        Message::StatsReply(StatsReply::Aggregate(agg)) => {
            assert_eq!(agg.packet_count, 6);
            assert_eq!(agg.byte_count, 600);
            assert_eq!(agg.flow_count, 3);
        }
        other => panic!("expected aggregate reply, got {other:?}"),
    }
    assert!(engine.xids.is_empty());
}

#[test]
fn scoped_flow_stats_narrow_to_the_owning_switch() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1]); // virt 10
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]); // virt 11
    drain(&mut controller);

    from_controller(
        &mut engine,
        slice,
        21,
        Message::StatsRequest(StatsRequest::Flow {
            of_match: match_in_port(11),
            table_id: 0xff,
            out_port: PortNo::None,
        }),
    );

    assert!(drain(&mut sw1).is_empty());
    let sent = drain(&mut sw2);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::StatsRequest(StatsRequest::Flow { of_match, .. }) => {
            assert_eq!(of_match.in_port, 1);
        }
        other => panic!("expected flow stats request, got {other:?}"),
    }
}

#[test]
fn flow_stats_replies_come_back_in_virtual_numbers() {
    let mut engine = engine_with_links([Link {
        a: (dp(1), 3),
        b: (dp(2), 3),
    }]);
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1, 3]); // virt 10, 11
    drain(&mut controller);

    from_controller(
        &mut engine,
        slice,
        22,
        Message::StatsRequest(StatsRequest::Flow {
            of_match: Match::any(),
            table_id: 0xff,
            out_port: PortNo::None,
        }),
    );
    let fabric_xid = drain(&mut sw1)[0].xid;

    let edge_flow = FlowStatsEntry {
        table_id: 0,
        of_match: match_in_port(1),
        duration_sec: 1,
        duration_nsec: 0,
        priority: 100,
        idle_timeout: 0,
        hard_timeout: 0,
        cookie: 0,
        packet_count: 4,
        byte_count: 400,
        actions: vec![Action::output(PortNo::Port(3))],
    };
    // Ingress on a port that was never virtualized: internal plumbing,
    // never controller-visible.
    let internal_flow = FlowStatsEntry {
        of_match: match_in_port(5),
        ..edge_flow.clone()
    };
    engine.switch_event(
        dp(1),
        Frame::new(
            fabric_xid,
            Message::StatsReply(StatsReply::Flow {
                entries: vec![edge_flow, internal_flow],
                more: false,
            }),
        ),
    );

    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 22);
    match &replies[0].message {
        Message::StatsReply(StatsReply::Flow { entries, more }) => {
            assert!(!more);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].of_match.in_port, 10);
            assert_eq!(entries[0].actions, vec![Action::output(PortNo::Port(11))]);
        }
        other => panic!("expected flow stats reply, got {other:?}"),
    }
}

#[test]
fn port_stats_drop_unmapped_and_reserved_entries() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1, 2]);
    drain(&mut controller);

    from_controller(
        &mut engine,
        slice,
        23,
        Message::StatsRequest(StatsRequest::Port {
            port_no: PortNo::None,
        }),
    );
    let fabric_xid = drain(&mut switch)[0].xid;

    let entry = |port_no: u16| PortStatsEntry {
        port_no,
        rx_packets: 9,
        ..PortStatsEntry::default()
    };
    engine.switch_event(
        dp(1),
        Frame::new(
            fabric_xid,
            Message::StatsReply(StatsReply::Port {
                entries: vec![entry(1), entry(7), entry(0xfffe)],
                more: false,
            }),
        ),
    );

    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::StatsReply(StatsReply::Port { entries, .. }) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].port_no, 10);
        }
        other => panic!("expected port stats reply, got {other:?}"),
    }
}

#[test]
fn table_stats_are_synthesized_for_one_virtual_table() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    from_controller(&mut engine, slice, 24, Message::StatsRequest(StatsRequest::Table));
    let sent = drain(&mut switch);
    assert_eq!(sent.len(), 1);
    engine.switch_event(
        dp(1),
        Frame::new(
            sent[0].xid,
            Message::StatsReply(StatsReply::Table(vec![])),
        ),
    );

    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 24);
    match &replies[0].message {
        Message::StatsReply(StatsReply::Table(tables)) => {
            assert_eq!(tables.len(), 1);
            assert_eq!(tables[0].name, VIRTUAL_TABLE_NAME);
        }
        other => panic!("expected table stats reply, got {other:?}"),
    }
}

#[test]
fn desc_stats_identify_the_virtual_switch() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    from_controller(&mut engine, slice, 25, Message::StatsRequest(StatsRequest::Desc));
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::StatsReply(StatsReply::Desc(desc)) => {
            assert_eq!(desc.mfr_desc, VIRTUAL_SWITCH_DESC);
        }
        other => panic!("expected description reply, got {other:?}"),
    }
}

#[test]
fn oversized_flow_aggregations_are_chunked_with_one_final_frame() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let entries: Vec<FlowStatsEntry> = (0..800)
        .map(|i| FlowStatsEntry {
            table_id: 0,
            of_match: Match::any(),
            duration_sec: i,
            duration_nsec: 0,
            priority: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            cookie: 0,
            packet_count: 0,
            byte_count: 0,
            actions: Vec::new(),
        })
        .collect();
    engine.deliver_stats(CompletedStats {
        slice,
        controller_xid: 31,
        acc: Accumulator::Flow(entries),
    });

    let replies = drain(&mut controller);
    assert!(replies.len() >= 2);
    let mut finals = 0;
    let mut total = 0;
    for frame in &replies {
        assert_eq!(frame.xid, 31);
        assert!(frame.encode().len() <= MAX_FRAME_LEN);
        match &frame.message {
            Message::StatsReply(StatsReply::Flow { entries, more }) => {
                total += entries.len();
                if !more {
                    finals += 1;
                }
            }
            other => panic!("expected flow stats reply, got {other:?}"),
        }
    }
    assert_eq!(total, 800);
    assert_eq!(finals, 1);
    assert!(matches!(
        &replies.last().unwrap().message,
        Message::StatsReply(StatsReply::Flow { more: false, .. })
    ));
}

// --- xid tracker ---

#[test]
fn stale_records_flush_partial_results_after_the_timeout() {
    let mut tracker = XidTracker::new();
    let xid = tracker.allocate(
        SliceId(1),
        55,
        [dp(1), dp(2)],
        Accumulator::Aggregate(AggregateStats::default()),
    );
    let outcome = tracker.record_reply(
        xid,
        dp(1),
        StatsChunk::Aggregate(AggregateStats {
            packet_count: 3,
            byte_count: 30,
            flow_count: 1,
        }),
        false,
    );
    assert!(matches!(outcome, ReplyOutcome::Partial));

    assert!(tracker.sweep(Instant::now()).is_empty());
    let flushed = tracker.sweep(Instant::now() + XID_TIMEOUT + Duration::from_secs(1));
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].controller_xid, 55);
    match &flushed[0].acc {
        Accumulator::Aggregate(agg) => assert_eq!(agg.packet_count, 3),
        other => panic!("expected aggregate accumulator, got {other:?}"),
    }
    assert!(tracker.is_empty());
}

#[test]
fn chunked_replies_hold_the_pending_switch_until_the_last_chunk() {
    let mut tracker = XidTracker::new();
    let xid = tracker.allocate(SliceId(1), 56, [dp(1)], Accumulator::Flow(Vec::new()));
    let entry = FlowStatsEntry {
        table_id: 0,
        of_match: Match::any(),
        duration_sec: 0,
        duration_nsec: 0,
        priority: 0,
        idle_timeout: 0,
        hard_timeout: 0,
        cookie: 0,
        packet_count: 0,
        byte_count: 0,
        actions: Vec::new(),
    };
    assert!(matches!(
        tracker.record_reply(xid, dp(1), StatsChunk::Flow(vec![entry.clone()]), true),
        ReplyOutcome::Partial
    ));
    match tracker.record_reply(xid, dp(1), StatsChunk::Flow(vec![entry]), false) {
        ReplyOutcome::Complete(completed) => match completed.acc {
            Accumulator::Flow(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected flow accumulator, got {other:?}"),
        },
        _ => panic!("expected completion on the final chunk"),
    }
}

#[test]
fn replies_for_unknown_xids_are_flagged() {
    let mut tracker = XidTracker::new();
    assert!(matches!(
        tracker.record_reply(
            9,
            dp(1),
            StatsChunk::Aggregate(AggregateStats::default()),
            false
        ),
        ReplyOutcome::Unknown
    ));
}

// --- packet-in dispatch ---

#[test]
fn slice_filters_route_packets_by_dl_type() {
    let mut engine = engine();
    let (_, mut ipv4_slice) = add_slice(&mut engine, dp(0x99), filter_dl_type(0x0800));
    let (_, mut ipv6_slice) = add_slice(&mut engine, dp(0x9a), filter_dl_type(0x86dd));
    let _switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut ipv4_slice);
    drain(&mut ipv6_slice);

    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, eth_frame(0x0800)))));
    assert_eq!(drain(&mut ipv4_slice).len(), 1);
    assert!(drain(&mut ipv6_slice).is_empty());

    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, eth_frame(0x86dd)))));
    assert!(drain(&mut ipv4_slice).is_empty());
    assert_eq!(drain(&mut ipv6_slice).len(), 1);

    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, eth_frame(0x0806)))));
    assert!(drain(&mut ipv4_slice).is_empty());
    assert!(drain(&mut ipv6_slice).is_empty());
    // The two delivered packets pin buffers; the unclaimed one does not.
    assert_eq!(engine.buffers.len(), 2);
}

#[test]
fn transit_port_traffic_is_swallowed() {
    let mut engine = engine_with_links([Link {
        a: (dp(1), 3),
        b: (dp(2), 3),
    }]);
    let (_, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _switch = join_switch(&mut engine, dp(1), &[1, 3]);
    drain(&mut controller);

    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(3, eth_frame(0x0800)))));
    assert!(drain(&mut controller).is_empty());
}

#[test]
fn lldp_probes_go_to_the_topology_not_the_controllers() {
    let mut engine = engine();
    let (_, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, eth_frame(0x88cc)))));
    assert!(drain(&mut controller).is_empty());
    assert!(engine.buffers.is_empty());
}

// --- controller-facing surface ---

#[test]
fn echo_replies_carry_the_same_xid_and_payload() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    from_controller(&mut engine, slice, 41, Message::EchoRequest(vec![1, 2, 3]));
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 41);
    assert_eq!(replies[0].message, Message::EchoReply(vec![1, 2, 3]));
}

#[test]
fn features_are_synthesized_from_the_port_map() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _sw1 = join_switch(&mut engine, dp(1), &[1, 2]);
    let _sw2 = join_switch(&mut engine, dp(2), &[7]);
    drain(&mut controller);

    from_controller(&mut engine, slice, 42, Message::FeaturesRequest);
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::FeaturesReply(f) => {
            assert_eq!(f.datapath_id, dp(0x99));
            assert_eq!(f.n_tables, 1);
            assert_eq!(f.n_buffers, 0);
            let ports: Vec<u16> = f.ports.iter().map(|p| p.port_no).collect();
            assert_eq!(ports, vec![10, 11, 12]);
            assert!(f
                .capabilities
                .contains(crate::wire::Capabilities::ARP_MATCH_IP));
        }
        other => panic!("expected features reply, got {other:?}"),
    }
}

#[test]
fn barrier_is_answered_locally() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    from_controller(&mut engine, slice, 43, Message::BarrierRequest);
    assert!(drain(&mut switch).is_empty());
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].xid, 43);
    assert_eq!(replies[0].message, Message::BarrierReply);
}

#[test]
fn switch_bound_messages_from_controllers_are_bad_type() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let raw = from_controller(
        &mut engine,
        slice,
        44,
        Message::PacketIn(packet_in(1, eth_frame(0x0800))),
    );
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!((err.err_type, err.code), ErrorKind::RequestBadType.type_code());
            assert_eq!(err.data, raw);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn queue_config_requests_are_refused() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    from_controller(
        &mut engine,
        slice,
        45,
        Message::QueueGetConfigRequest(vec![0, 1, 0, 0]),
    );
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!((err.err_type, err.code), ErrorKind::QueueOpBadPort.type_code());
        }
        other => panic!("expected error, got {other:?}"),
    }
}

// --- switch lifecycle ---

#[test]
fn flow_removed_is_translated_and_filtered() {
    let mut engine = engine();
    let (_, mut ipv4_slice) = add_slice(&mut engine, dp(0x99), filter_dl_type(0x0800));
    let (_, mut ipv6_slice) = add_slice(&mut engine, dp(0x9a), filter_dl_type(0x86dd));
    let _switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut ipv4_slice);
    drain(&mut ipv6_slice);

    let mut of_match = match_in_port(1);
    of_match.wildcards -= Wildcards::DL_TYPE;
    of_match.dl_type = 0x0800;
    engine.switch_event(
        dp(1),
        Frame::new(
            6,
            Message::FlowRemoved(crate::wire::FlowRemoved {
                of_match,
                cookie: 0,
                priority: 100,
                reason: 0,
                duration_sec: 9,
                duration_nsec: 0,
                idle_timeout: 60,
                packet_count: 12,
                byte_count: 1200,
            }),
        ),
    );

    assert!(drain(&mut ipv6_slice).is_empty());
    let delivered = drain(&mut ipv4_slice);
    assert_eq!(delivered.len(), 1);
    match &delivered[0].message {
        Message::FlowRemoved(fr) => assert_eq!(fr.of_match.in_port, 10),
        other => panic!("expected flow-removed, got {other:?}"),
    }
}

#[test]
fn switch_departure_releases_everything_it_owned() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _sw1 = join_switch(&mut engine, dp(1), &[1]);
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]);
    drain(&mut controller);

    // A buffered packet and a pending aggregation, both tied to switch 1.
    engine.switch_event(dp(1), Frame::new(0, Message::PacketIn(packet_in(1, eth_frame(0x0800)))));
    drain(&mut controller);
    from_controller(
        &mut engine,
        slice,
        78,
        Message::StatsRequest(StatsRequest::Aggregate {
            of_match: Match::any(),
            table_id: 0xff,
            out_port: PortNo::None,
        }),
    );
    let fabric_xid = drain(&mut sw2)[0].xid;
    engine.switch_event(
        dp(2),
        Frame::new(
            fabric_xid,
            Message::StatsReply(StatsReply::Aggregate(AggregateStats {
                packet_count: 2,
                byte_count: 200,
                flow_count: 1,
            })),
        ),
    );
    assert!(drain(&mut controller).is_empty());

    engine.switch_left(dp(1));

    assert!(engine.buffers.is_empty());
    assert!(engine.xids.is_empty());
    assert_eq!(engine.ports.len(), 1);
    let frames = drain(&mut controller);
    // Port teardown announcement plus the now-unblocked aggregation.
    assert!(frames.iter().any(|f| matches!(
        &f.message,
        Message::PortStatus(PortStatus {
            reason: PortStatusReason::Delete,
            ..
        })
    )));
    let agg = frames
        .iter()
        .find(|f| matches!(&f.message, Message::StatsReply(_)))
        .expect("partial aggregation must flush");
    assert_eq!(agg.xid, 78);
}

#[test]
fn slice_removal_discards_its_pending_aggregations() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);

    from_controller(
        &mut engine,
        slice,
        79,
        Message::StatsRequest(StatsRequest::Aggregate {
            of_match: Match::any(),
            table_id: 0xff,
            out_port: PortNo::None,
        }),
    );
    assert_eq!(drain(&mut switch).len(), 1);
    assert_eq!(engine.xids.len(), 1);

    engine.remove_slice(slice);
    assert!(engine.xids.is_empty());
    assert_eq!(engine.slice_count(), 0);
}

// --- packet-out fan-out ---

#[test]
fn flood_packet_out_reaches_every_switch_with_translated_ingress() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1]); // virt 10
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]);

    from_controller(
        &mut engine,
        slice,
        15,
        Message::PacketOut(PacketOut {
            buffer_id: NO_BUFFER,
            in_port: PortNo::Port(10),
            actions: vec![Action::output(PortNo::Flood)],
            data: eth_frame(0x0800),
        }),
    );

    let to_sw1 = drain(&mut sw1);
    assert_eq!(to_sw1.len(), 1);
    match &to_sw1[0].message {
        Message::PacketOut(po) => {
            assert_eq!(po.in_port, PortNo::Port(1));
            assert_eq!(po.actions, vec![Action::output(PortNo::Flood)]);
        }
        other => panic!("expected packet-out, got {other:?}"),
    }
    let to_sw2 = drain(&mut sw2);
    assert_eq!(to_sw2.len(), 1);
    match &to_sw2[0].message {
        Message::PacketOut(po) => {
            assert_eq!(po.in_port, PortNo::None);
            assert_eq!(po.actions, vec![Action::output(PortNo::Flood)]);
        }
        other => panic!("expected packet-out, got {other:?}"),
    }
}

#[test]
fn in_port_packet_out_returns_to_the_origin_switch() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut sw1 = join_switch(&mut engine, dp(1), &[1]); // virt 10
    let mut sw2 = join_switch(&mut engine, dp(2), &[1]);

    from_controller(
        &mut engine,
        slice,
        17,
        Message::PacketOut(PacketOut {
            buffer_id: NO_BUFFER,
            in_port: PortNo::Port(10),
            actions: vec![Action::output(PortNo::InPort)],
            data: eth_frame(0x0800),
        }),
    );

    assert!(drain(&mut sw2).is_empty());
    let sent = drain(&mut sw1);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::PacketOut(po) => {
            assert_eq!(po.in_port, PortNo::Port(1));
            assert_eq!(po.actions, vec![Action::output(PortNo::InPort)]);
        }
        other => panic!("expected packet-out, got {other:?}"),
    }
}

#[test]
fn flow_to_controller_is_a_single_local_hop() {
    let mut engine = engine();
    let (slice, _controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let mut switch = join_switch(&mut engine, dp(1), &[1]);

    from_controller(
        &mut engine,
        slice,
        18,
        Message::FlowMod(flow_add(
            match_in_port(10),
            vec![Action::output(PortNo::Controller)],
        )),
    );

    let sent = drain(&mut switch);
    assert_eq!(sent.len(), 1);
    match &sent[0].message {
        Message::FlowMod(fm) => {
            assert_eq!(fm.of_match.in_port, 1);
            assert_eq!(fm.actions, vec![Action::output(PortNo::Controller)]);
        }
        other => panic!("expected flow-mod, got {other:?}"),
    }
}

#[test]
fn frame_parsing_extracts_the_full_twelve_tuple() {
    let mut frame = Vec::new();
    // ethernet
    frame.extend_from_slice(&[0x02; 6]);
    frame.extend_from_slice(&[0x0a; 6]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    // ipv4, 20-byte header, dscp 46, protocol tcp
    frame.extend_from_slice(&[0x45, 0xb8]);
    frame.extend_from_slice(&40u16.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0x00, 64, 6, 0, 0]);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[10, 0, 0, 2]);
    // tcp
    frame.extend_from_slice(&12345u16.to_be_bytes());
    frame.extend_from_slice(&80u16.to_be_bytes());
    frame.extend_from_slice(&[0; 8]);
    frame.extend_from_slice(&[0x50, 0x02]);
    frame.extend_from_slice(&0xffffu16.to_be_bytes());
    frame.extend_from_slice(&[0; 4]);

    let flow = super::packet_in::flow_of_frame(&frame, 10);
    assert_eq!(flow.in_port, 10);
    assert_eq!(flow.dl_src, [0x0a; 6]);
    assert_eq!(flow.dl_dst, [0x02; 6]);
    assert_eq!(flow.dl_vlan, 0xffff);
    assert_eq!(flow.dl_type, 0x0800);
    assert_eq!(flow.nw_tos, 0xb8);
    assert_eq!(flow.nw_proto, 6);
    assert_eq!(flow.nw_src, std::net::Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(flow.nw_dst, std::net::Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(flow.tp_src, 12345);
    assert_eq!(flow.tp_dst, 80);
    assert!(flow.wildcards.is_empty());
}

#[test]
fn packet_out_to_reserved_target_is_rejected() {
    let mut engine = engine();
    let (slice, mut controller) = add_slice(&mut engine, dp(0x99), Match::any());
    let _switch = join_switch(&mut engine, dp(1), &[1]);
    drain(&mut controller);

    from_controller(
        &mut engine,
        slice,
        16,
        Message::PacketOut(PacketOut {
            buffer_id: NO_BUFFER,
            in_port: PortNo::Port(10),
            actions: vec![Action::output(PortNo::Normal)],
            data: Vec::new(),
        }),
    );
    let replies = drain(&mut controller);
    assert_eq!(replies.len(), 1);
    match &replies[0].message {
        Message::Error(err) => {
            assert_eq!((err.err_type, err.code), ErrorKind::RequestBadStat.type_code());
        }
        other => panic!("expected error, got {other:?}"),
    }
}
