//! Flat virtual buffer-id namespace bridging per-switch buffers.
//!
//! Switch buffer ids are only meaningful on their own datapath, so the proxy
//! retains the packet bytes itself and hands controllers ids from a single
//! counter. An id is consumed by the first message that references it.

use super::TranslateError;
use crate::wire::DatapathId;
use rustc_hash::FxHashMap;

#[derive(Clone, Debug)]
pub struct BufferedPacket {
    pub data: Vec<u8>,
    pub dpid: DatapathId,
}

#[derive(Default)]
pub struct BufferBridge {
    next_id: u32,
    entries: FxHashMap<u32, BufferedPacket>,
}

impl BufferBridge {
    pub fn new() -> Self {
        BufferBridge::default()
    }

    pub fn store(&mut self, dpid: DatapathId, data: Vec<u8>) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id, BufferedPacket { data, dpid });
        id
    }

    /// Consume a virtual buffer id. Unknown ids are a controller error, not
    /// a proxy invariant violation.
    pub fn take(&mut self, id: u32) -> Result<BufferedPacket, TranslateError> {
        self.entries
            .remove(&id)
            .ok_or(TranslateError::UnknownBuffer(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop every packet retained on behalf of a departing switch.
    pub fn purge_switch(&mut self, dpid: DatapathId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, packet| packet.dpid != dpid);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
