//! Packet-out expansion: one virtual packet-out becomes one emission per
//! resolved output target.
//!
//! Translation is planned in full before any state is touched, so a rejected
//! action list never half-consumes a buffer.

use super::{Engine, TranslateError};
use crate::wire::{Action, DatapathId, PacketOut, PortNo, NO_BUFFER};
use smallvec::SmallVec;

pub(super) type PacketOutEmissions = SmallVec<[(DatapathId, PacketOut); 4]>;

impl Engine {
    pub(super) fn translate_packet_out(
        &mut self,
        po: PacketOut,
    ) -> Result<PacketOutEmissions, TranslateError> {
        let origin = match po.in_port {
            PortNo::Port(v) => Some(self.ports.phys_of_virt_strict(v)?),
            _ => None,
        };
        if po.buffer_id != NO_BUFFER && !self.buffers.contains(po.buffer_id) {
            return Err(TranslateError::UnknownBuffer(po.buffer_id));
        }

        // Walk the action list, carrying non-output actions forward; every
        // output target becomes one or more per-switch emissions.
        let mut prefix: Vec<Action> = Vec::new();
        let mut plan: SmallVec<[(DatapathId, Vec<Action>); 4]> = SmallVec::new();
        for action in &po.actions {
            match action {
                Action::Output { port, .. } => match *port {
                    PortNo::Port(v) => {
                        let (dpid, phys) = self.ports.phys_of_virt_strict(v)?;
                        plan.push((dpid, with_output(&prefix, PortNo::Port(phys))));
                    }
                    PortNo::Flood | PortNo::All => {
                        let mut targets = self.switch_ids();
                        targets.sort_unstable();
                        if let Some((origin_dpid, _)) = origin {
                            if !targets.contains(&origin_dpid) {
                                targets.push(origin_dpid);
                            }
                        }
                        for dpid in targets {
                            plan.push((dpid, with_output(&prefix, PortNo::Flood)));
                        }
                    }
                    PortNo::InPort => {
                        let (origin_dpid, _) = origin
                            .ok_or(TranslateError::UnsupportedTarget(PortNo::InPort))?;
                        plan.push((origin_dpid, with_output(&prefix, PortNo::InPort)));
                    }
                    other => return Err(TranslateError::UnsupportedTarget(other)),
                },
                Action::Enqueue { port, .. } => {
                    return Err(TranslateError::UnsupportedTarget(*port));
                }
                other => prefix.push(other.clone()),
            }
        }

        // Resolve the payload exactly once, after the plan is known good.
        let data = if po.buffer_id == NO_BUFFER {
            po.data
        } else {
            self.buffers.take(po.buffer_id)?.data
        };

        let emissions = plan
            .into_iter()
            .map(|(dpid, actions)| {
                let in_port = match origin {
                    Some((origin_dpid, phys)) if origin_dpid == dpid => PortNo::Port(phys),
                    _ => PortNo::None,
                };
                (
                    dpid,
                    PacketOut {
                        buffer_id: NO_BUFFER,
                        in_port,
                        actions,
                        data: data.clone(),
                    },
                )
            })
            .collect();
        Ok(emissions)
    }
}

fn with_output(prefix: &[Action], port: PortNo) -> Vec<Action> {
    let mut actions = Vec::with_capacity(prefix.len() + 1);
    actions.extend_from_slice(prefix);
    actions.push(Action::output(port));
    actions
}
