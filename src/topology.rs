//! Fabric topology consulted by the translators.
//!
//! The engine never walks links itself; it asks the resolver for paths and
//! for whether a port is inter-switch transit. `StaticTopology` realizes the
//! interface from an operator-declared link table; a discovering resolver
//! (LLDP emission, link inference) can be dropped in behind the same trait.

use crate::wire::{DatapathId, PortNo};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// One switch traversal on a path: enter at `in_port`, leave at `out_port`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PathHop {
    pub dpid: DatapathId,
    pub in_port: u16,
    pub out_port: PortNo,
}

pub trait Topology: Send + Sync {
    fn add_switch(&self, dpid: DatapathId);
    fn remove_switch(&self, dpid: DatapathId);
    fn add_port(&self, dpid: DatapathId, port: u16);
    fn remove_port(&self, dpid: DatapathId, port: u16);

    /// Hop list carrying traffic from (src switch, src port) to (dst switch,
    /// dst port), or `None` when the switches are not connected. The first
    /// hop enters at `src_port`, the last leaves at `dst_port`.
    fn find_path(
        &self,
        src_dpid: DatapathId,
        src_port: u16,
        dst_dpid: DatapathId,
        dst_port: u16,
    ) -> Option<Vec<PathHop>>;

    /// Best-effort broadcast hops for a flood rooted at the ingress switch.
    /// May be empty; callers degrade to flooding the ingress switch alone.
    fn flood_paths(&self, src_dpid: DatapathId, src_port: u16) -> Vec<PathHop>;

    /// True when the port carries an inter-switch link rather than end hosts.
    fn is_transit_port(&self, dpid: DatapathId, port: u16) -> bool;

    /// Offer an LLDP frame to the resolver. Returns true when the frame was
    /// consumed and must not reach any controller.
    fn process_lldp(&self, dpid: DatapathId, in_port: u16, frame: &[u8]) -> bool;
}

/// An undirected inter-switch link between two (switch, port) endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Link {
    pub a: (DatapathId, u16),
    pub b: (DatapathId, u16),
}

#[derive(Default)]
struct LinkTable {
    /// dpid -> [(local port, peer dpid, peer port)]
    adjacency: FxHashMap<DatapathId, Vec<(u16, DatapathId, u16)>>,
    transit: FxHashSet<(DatapathId, u16)>,
}

/// Link-table topology for a fabric whose wiring is known up front.
pub struct StaticTopology {
    table: RwLock<LinkTable>,
}

impl StaticTopology {
    pub fn new(links: impl IntoIterator<Item = Link>) -> Self {
        let mut table = LinkTable::default();
        for link in links {
            let (a, b) = (link.a, link.b);
            table.adjacency.entry(a.0).or_default().push((a.1, b.0, b.1));
            table.adjacency.entry(b.0).or_default().push((b.1, a.0, a.1));
            table.transit.insert(a);
            table.transit.insert(b);
        }
        StaticTopology {
            table: RwLock::new(table),
        }
    }

    pub fn empty() -> Self {
        StaticTopology::new([])
    }

    /// Breadth-first search returning, per traversed switch, the ingress port
    /// and the egress port toward the next switch.
    fn search(
        &self,
        src_dpid: DatapathId,
        src_port: u16,
        dst_dpid: DatapathId,
        dst_port: u16,
    ) -> Option<Vec<PathHop>> {
        if src_dpid == dst_dpid {
            return Some(vec![PathHop {
                dpid: src_dpid,
                in_port: src_port,
                out_port: PortNo::Port(dst_port),
            }]);
        }
        let table = self.table.read();
        // parent: reached switch -> (previous switch, its egress port, our ingress port)
        let mut parent: FxHashMap<DatapathId, (DatapathId, u16, u16)> = FxHashMap::default();
        let mut queue = VecDeque::from([src_dpid]);
        while let Some(dpid) = queue.pop_front() {
            if dpid == dst_dpid {
                break;
            }
            for &(local, peer, peer_port) in table.adjacency.get(&dpid).into_iter().flatten() {
                if peer != src_dpid && !parent.contains_key(&peer) {
                    parent.insert(peer, (dpid, local, peer_port));
                    queue.push_back(peer);
                }
            }
        }
        // Walk back from the destination, collecting (switch, its ingress,
        // the previous switch's egress), then replay front to back.
        let mut chain: Vec<(DatapathId, u16, u16)> = Vec::new();
        let mut cursor = dst_dpid;
        while cursor != src_dpid {
            let &(prev, prev_egress, ingress) = parent.get(&cursor)?;
            chain.push((cursor, ingress, prev_egress));
            cursor = prev;
        }
        chain.reverse();

        let mut hops = Vec::with_capacity(chain.len() + 1);
        let mut dpid = src_dpid;
        let mut in_port = src_port;
        for &(next, next_ingress, egress) in &chain {
            hops.push(PathHop {
                dpid,
                in_port,
                out_port: PortNo::Port(egress),
            });
            dpid = next;
            in_port = next_ingress;
        }
        hops.push(PathHop {
            dpid,
            in_port,
            out_port: PortNo::Port(dst_port),
        });
        Some(hops)
    }
}

impl Topology for StaticTopology {
    fn add_switch(&self, _dpid: DatapathId) {}

    fn remove_switch(&self, _dpid: DatapathId) {}

    fn add_port(&self, _dpid: DatapathId, _port: u16) {}

    fn remove_port(&self, _dpid: DatapathId, _port: u16) {}

    fn find_path(
        &self,
        src_dpid: DatapathId,
        src_port: u16,
        dst_dpid: DatapathId,
        dst_port: u16,
    ) -> Option<Vec<PathHop>> {
        self.search(src_dpid, src_port, dst_dpid, dst_port)
    }

    fn flood_paths(&self, src_dpid: DatapathId, src_port: u16) -> Vec<PathHop> {
        // Spanning tree rooted at the ingress switch: every reachable switch
        // floods, entering through the port that points back at the root.
        let table = self.table.read();
        let mut hops = vec![PathHop {
            dpid: src_dpid,
            in_port: src_port,
            out_port: PortNo::Flood,
        }];
        let mut seen: FxHashSet<DatapathId> = FxHashSet::from_iter([src_dpid]);
        let mut queue = VecDeque::from([src_dpid]);
        while let Some(dpid) = queue.pop_front() {
            for &(_local, peer, peer_port) in table.adjacency.get(&dpid).into_iter().flatten() {
                if seen.insert(peer) {
                    hops.push(PathHop {
                        dpid: peer,
                        in_port: peer_port,
                        out_port: PortNo::Flood,
                    });
                    queue.push_back(peer);
                }
            }
        }
        hops
    }

    fn is_transit_port(&self, dpid: DatapathId, port: u16) -> bool {
        self.table.read().transit.contains(&(dpid, port))
    }

    fn process_lldp(&self, _dpid: DatapathId, _in_port: u16, _frame: &[u8]) -> bool {
        // The wiring is declared, not discovered; swallow probes so they
        // never surface as controller packet-ins.
        true
    }
}
