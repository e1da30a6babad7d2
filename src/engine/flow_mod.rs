//! Flow-mod expansion along fabric paths.
//!
//! An install names virtual ports; the fabric needs one flow per traversed
//! switch, with the packet transformations applied only where the flow
//! leaves the fabric. Deletes mirror the handful of shapes controllers
//! actually send; everything else is rejected rather than half-applied.

use super::{Engine, TranslateError};
use crate::topology::PathHop;
use crate::wire::{
    Action, DatapathId, FlowMod, FlowModCommand, Message, PacketOut, PortNo, NO_BUFFER,
};
use tracing::debug;

impl Engine {
    pub(super) fn translate_flow_mod(
        &mut self,
        fm: FlowMod,
    ) -> Result<Vec<(DatapathId, Message)>, TranslateError> {
        match fm.command {
            FlowModCommand::Add | FlowModCommand::Modify { .. } => self.translate_flow_install(fm),
            FlowModCommand::Delete { .. } => self.translate_flow_delete(fm),
        }
    }

    fn translate_flow_install(
        &mut self,
        fm: FlowMod,
    ) -> Result<Vec<(DatapathId, Message)>, TranslateError> {
        // The ingress pins the path; a flow without a resolvable ingress
        // port cannot be placed on the fabric.
        let (in_dpid, in_phys) = self.ports.phys_of_virt_strict(fm.of_match.in_port)?;
        if has_buffer(&fm) && !self.buffers.contains(fm.buffer_id) {
            return Err(TranslateError::UnknownBuffer(fm.buffer_id));
        }

        let mut prefix: Vec<Action> = Vec::new();
        let mut emissions: Vec<(DatapathId, Message)> = Vec::new();
        let mut final_hop: Option<PathHop> = None;
        for action in &fm.actions {
            match action {
                Action::Output { port, .. } => {
                    let (path, apply_everywhere) = match *port {
                        PortNo::Port(v) => {
                            let (out_dpid, out_phys) = self.ports.phys_of_virt_strict(v)?;
                            let path = if in_dpid == out_dpid {
                                vec![PathHop {
                                    dpid: in_dpid,
                                    in_port: in_phys,
                                    out_port: PortNo::Port(out_phys),
                                }]
                            } else {
                                self.topology
                                    .find_path(in_dpid, in_phys, out_dpid, out_phys)
                                    .filter(|hops| !hops.is_empty())
                                    .ok_or(TranslateError::NoPath {
                                        src: in_dpid,
                                        dst: out_dpid,
                                    })?
                            };
                            (path, false)
                        }
                        PortNo::Flood | PortNo::All => {
                            let mut hops = self.topology.flood_paths(in_dpid, in_phys);
                            if hops.is_empty() {
                                hops = vec![PathHop {
                                    dpid: in_dpid,
                                    in_port: in_phys,
                                    out_port: PortNo::Flood,
                                }];
                            }
                            // Broadcast leaves the fabric on every switch, so
                            // the transformations ride along on each hop.
                            (hops, true)
                        }
                        PortNo::InPort => (
                            vec![PathHop {
                                dpid: in_dpid,
                                in_port: in_phys,
                                out_port: PortNo::InPort,
                            }],
                            false,
                        ),
                        PortNo::Controller => (
                            vec![PathHop {
                                dpid: in_dpid,
                                in_port: in_phys,
                                out_port: PortNo::Controller,
                            }],
                            false,
                        ),
                        other => return Err(TranslateError::UnsupportedTarget(other)),
                    };

                    let last = path.len() - 1;
                    for (idx, hop) in path.iter().enumerate() {
                        let actions = if idx == last || apply_everywhere {
                            let mut acts = prefix.clone();
                            acts.push(Action::output(hop.out_port));
                            acts
                        } else {
                            vec![Action::output(hop.out_port)]
                        };
                        let mut of_match = fm.of_match;
                        of_match.in_port = hop.in_port;
                        emissions.push((
                            hop.dpid,
                            Message::FlowMod(FlowMod {
                                of_match,
                                cookie: fm.cookie,
                                command: fm.command,
                                idle_timeout: fm.idle_timeout,
                                hard_timeout: fm.hard_timeout,
                                priority: fm.priority,
                                buffer_id: NO_BUFFER,
                                out_port: PortNo::None,
                                flags: fm.flags,
                                actions,
                            }),
                        ));
                    }
                    final_hop = Some(path[last]);
                }
                Action::Enqueue { port, .. } => {
                    return Err(TranslateError::UnsupportedTarget(*port));
                }
                other => prefix.push(other.clone()),
            }
        }

        // Release the packet the flow was installed for.
        if has_buffer(&fm) {
            let packet = self.buffers.take(fm.buffer_id)?;
            match final_hop {
                Some(hop) => {
                    let mut actions = prefix;
                    actions.push(Action::output(hop.out_port));
                    emissions.push((
                        hop.dpid,
                        Message::PacketOut(PacketOut {
                            buffer_id: NO_BUFFER,
                            in_port: PortNo::None,
                            actions,
                            data: packet.data,
                        }),
                    ));
                }
                // A buffered packet behind a drop rule has nowhere to go.
                None => debug!(buffer_id = fm.buffer_id, "buffered packet consumed by drop flow"),
            }
        }

        Ok(emissions)
    }

    fn translate_flow_delete(
        &mut self,
        fm: FlowMod,
    ) -> Result<Vec<(DatapathId, Message)>, TranslateError> {
        let in_port = PortNo::from_u16(fm.of_match.in_port);
        let shape = (fm.of_match.in_port_wildcarded(), in_port, fm.out_port);
        match shape {
            (true, _, PortNo::None) | (false, PortNo::Local, PortNo::None) => {
                // Fabric-wide delete. A LOCAL ingress means "the virtual
                // switch itself" and has no physical counterpart to pin.
                let mut of_match = fm.of_match;
                of_match.wildcards |= crate::wire::Wildcards::IN_PORT;
                let mut targets = self.switch_ids();
                targets.sort_unstable();
                Ok(targets
                    .into_iter()
                    .map(|dpid| (dpid, Message::FlowMod(delete_on(&fm, of_match))))
                    .collect())
            }
            (false, PortNo::Port(vi), PortNo::None) => {
                let (dpid, phys) = self.ports.phys_of_virt_strict(vi)?;
                let mut of_match = fm.of_match;
                of_match.in_port = phys;
                Ok(vec![(dpid, Message::FlowMod(delete_on(&fm, of_match)))])
            }
            (false, PortNo::Port(vi), PortNo::Port(vo)) => {
                let (in_dpid, in_phys) = self.ports.phys_of_virt_strict(vi)?;
                let (out_dpid, out_phys) = self.ports.phys_of_virt_strict(vo)?;
                let path = self
                    .topology
                    .find_path(in_dpid, in_phys, out_dpid, out_phys)
                    .filter(|hops| !hops.is_empty())
                    .ok_or(TranslateError::NoPath {
                        src: in_dpid,
                        dst: out_dpid,
                    })?;
                Ok(path
                    .into_iter()
                    .map(|hop| {
                        let mut of_match = fm.of_match;
                        of_match.in_port = hop.in_port;
                        (hop.dpid, Message::FlowMod(delete_on(&fm, of_match)))
                    })
                    .collect())
            }
            (_, in_port, out_port) => Err(TranslateError::BadDeleteShape { in_port, out_port }),
        }
    }
}

fn has_buffer(fm: &FlowMod) -> bool {
    fm.buffer_id != NO_BUFFER
}

fn delete_on(fm: &FlowMod, of_match: crate::wire::Match) -> FlowMod {
    FlowMod {
        of_match,
        cookie: fm.cookie,
        command: fm.command,
        idle_timeout: fm.idle_timeout,
        hard_timeout: fm.hard_timeout,
        priority: fm.priority,
        buffer_id: NO_BUFFER,
        out_port: PortNo::None,
        flags: fm.flags,
        actions: Vec::new(),
    }
}
