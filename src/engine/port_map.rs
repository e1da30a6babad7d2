//! Virtual ⇄ physical port namespace.
//!
//! Controllers only ever see virtual port numbers; the map is the sole
//! authority for both directions of the translation and stays injective by
//! construction.

use super::TranslateError;
use crate::wire::{DatapathId, PortDesc};
use rustc_hash::FxHashMap;
use tracing::warn;

/// Virtual numbering starts above the range OpenFlow tooling habitually
/// treats as special (0 is invalid, low numbers are often local ports).
const FIRST_VIRTUAL_PORT: u16 = 10;

#[derive(Clone, Debug)]
pub struct PortEntry {
    pub dpid: DatapathId,
    pub phys: u16,
    pub desc: PortDesc,
}

#[derive(Default)]
pub struct PortMap {
    next_virt: u16,
    by_virt: FxHashMap<u16, PortEntry>,
    by_phys: FxHashMap<(DatapathId, u16), u16>,
}

impl PortMap {
    pub fn new() -> Self {
        PortMap {
            next_virt: FIRST_VIRTUAL_PORT,
            by_virt: FxHashMap::default(),
            by_phys: FxHashMap::default(),
        }
    }

    /// Register a physical port and hand back its virtual number together
    /// with the descriptor rewritten to carry it. Re-adding an already known
    /// port keeps the existing number.
    pub fn add(&mut self, dpid: DatapathId, phys: u16, desc: PortDesc) -> (u16, PortDesc) {
        if let Some(&virt) = self.by_phys.get(&(dpid, phys)) {
            let rewritten = desc.with_port_no(virt);
            if let Some(entry) = self.by_virt.get_mut(&virt) {
                entry.desc = rewritten.clone();
            }
            return (virt, rewritten);
        }
        let virt = self.next_virt;
        if virt >= 0xff00 {
            warn!(virt, "virtual port allocation ran into the reserved range");
        }
        self.next_virt = self.next_virt.wrapping_add(1);
        let rewritten = desc.with_port_no(virt);
        self.by_virt.insert(
            virt,
            PortEntry {
                dpid,
                phys,
                desc: rewritten.clone(),
            },
        );
        self.by_phys.insert((dpid, phys), virt);
        (virt, rewritten)
    }

    pub fn remove(&mut self, dpid: DatapathId, phys: u16) -> Option<(u16, PortDesc)> {
        let virt = self.by_phys.remove(&(dpid, phys))?;
        let entry = self.by_virt.remove(&virt)?;
        Some((virt, entry.desc))
    }

    /// Drop every port owned by a departing switch, returning what was
    /// removed so callers can announce the deletions.
    pub fn remove_switch(&mut self, dpid: DatapathId) -> Vec<(u16, PortDesc)> {
        let virts: Vec<u16> = self
            .by_virt
            .iter()
            .filter(|(_, entry)| entry.dpid == dpid)
            .map(|(&virt, _)| virt)
            .collect();
        let mut removed = Vec::with_capacity(virts.len());
        for virt in virts {
            if let Some(entry) = self.by_virt.remove(&virt) {
                self.by_phys.remove(&(entry.dpid, entry.phys));
                removed.push((virt, entry.desc));
            }
        }
        removed
    }

    pub fn virt_of_phys(&self, dpid: DatapathId, phys: u16) -> Option<u16> {
        self.by_phys.get(&(dpid, phys)).copied()
    }

    pub fn phys_of_virt(&self, virt: u16) -> Option<(DatapathId, u16)> {
        self.by_virt.get(&virt).map(|e| (e.dpid, e.phys))
    }

    /// Lookup for controller-supplied ports that must exist.
    pub fn phys_of_virt_strict(&self, virt: u16) -> Result<(DatapathId, u16), TranslateError> {
        self.phys_of_virt(virt)
            .ok_or(TranslateError::UnknownPort(virt))
    }

    /// Descriptors of every live virtual port, ordered by virtual number
    /// (feature replies should be stable across requests).
    pub fn descriptors(&self) -> Vec<PortDesc> {
        let mut virts: Vec<u16> = self.by_virt.keys().copied().collect();
        virts.sort_unstable();
        virts
            .into_iter()
            .filter_map(|v| self.by_virt.get(&v).map(|e| e.desc.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_virt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_virt.is_empty()
    }
}
