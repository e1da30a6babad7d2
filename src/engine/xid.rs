//! Transaction-id correlation for fanned-out stats requests.
//!
//! A controller request goes out to many switches under one fresh xid; the
//! tracker remembers which switches still owe a reply and folds the replies
//! into an accumulator fixed at allocation time. Records that outlive the
//! timeout are force-completed by the periodic sweep so a dead switch cannot
//! wedge a controller forever.

use super::SliceId;
use crate::wire::{AggregateStats, DatapathId, FlowStatsEntry, PortStatsEntry, TableStatsEntry};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A record whose pending set has not drained by this age is flushed as-is.
pub const XID_TIMEOUT: Duration = Duration::from_secs(180);
/// Cadence of the stale-record sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Per-kind merge state. The variant never changes after allocation.
#[derive(Clone, Debug)]
pub enum Accumulator {
    Flow(Vec<FlowStatsEntry>),
    Aggregate(AggregateStats),
    Table(Vec<TableStatsEntry>),
    Port(Vec<PortStatsEntry>),
}

/// One reply's worth of data, already translated into the virtual namespace.
#[derive(Clone, Debug)]
pub enum StatsChunk {
    Flow(Vec<FlowStatsEntry>),
    Aggregate(AggregateStats),
    Table(Vec<TableStatsEntry>),
    Port(Vec<PortStatsEntry>),
}

struct XidRecord {
    slice: SliceId,
    controller_xid: u32,
    pending: FxHashSet<DatapathId>,
    created_at: Instant,
    acc: Accumulator,
}

/// An aggregation ready for delivery to its source controller.
pub struct CompletedStats {
    pub slice: SliceId,
    pub controller_xid: u32,
    pub acc: Accumulator,
}

pub enum ReplyOutcome {
    Complete(CompletedStats),
    Partial,
    Unknown,
}

#[derive(Default)]
pub struct XidTracker {
    next_xid: u32,
    records: FxHashMap<u32, XidRecord>,
}

impl XidTracker {
    pub fn new() -> Self {
        XidTracker {
            // Keep clear of xid 0, which some stacks treat as "unsolicited".
            next_xid: 1,
            records: FxHashMap::default(),
        }
    }

    /// Allocate a fresh fabric-side xid for a fan-out on behalf of
    /// `(slice, controller_xid)`. An empty pending set is legal; callers
    /// complete such records immediately via [`XidTracker::take`].
    pub fn allocate(
        &mut self,
        slice: SliceId,
        controller_xid: u32,
        pending: impl IntoIterator<Item = DatapathId>,
        acc: Accumulator,
    ) -> u32 {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1).max(1);
        self.records.insert(
            xid,
            XidRecord {
                slice,
                controller_xid,
                pending: pending.into_iter().collect(),
                created_at: Instant::now(),
                acc,
            },
        );
        xid
    }

    /// Fold one switch reply into its record. `more` keeps the switch in the
    /// pending set (chunked flow/port replies); the record completes when the
    /// last pending switch sends its final chunk.
    pub fn record_reply(
        &mut self,
        xid: u32,
        dpid: DatapathId,
        chunk: StatsChunk,
        more: bool,
    ) -> ReplyOutcome {
        let Some(record) = self.records.get_mut(&xid) else {
            return ReplyOutcome::Unknown;
        };
        merge(&mut record.acc, chunk, xid);
        if !more {
            record.pending.remove(&dpid);
        }
        if record.pending.is_empty() {
            let record = self.records.remove(&xid).expect("record just touched");
            ReplyOutcome::Complete(CompletedStats {
                slice: record.slice,
                controller_xid: record.controller_xid,
                acc: record.acc,
            })
        } else {
            ReplyOutcome::Partial
        }
    }

    /// Remove and return a record regardless of its pending set. Used when
    /// the fan-out turned out to be empty.
    pub fn take(&mut self, xid: u32) -> Option<CompletedStats> {
        self.records.remove(&xid).map(|r| CompletedStats {
            slice: r.slice,
            controller_xid: r.controller_xid,
            acc: r.acc,
        })
    }

    /// Flush records older than [`XID_TIMEOUT`], delivering whatever has
    /// accumulated so far.
    pub fn sweep(&mut self, now: Instant) -> Vec<CompletedStats> {
        let stale: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, r)| now.duration_since(r.created_at) > XID_TIMEOUT)
            .map(|(&xid, _)| xid)
            .collect();
        let mut flushed = Vec::with_capacity(stale.len());
        for xid in stale {
            if let Some(record) = self.records.remove(&xid) {
                warn!(
                    xid,
                    pending = record.pending.len(),
                    "stats aggregation timed out, delivering partial result"
                );
                flushed.push(CompletedStats {
                    slice: record.slice,
                    controller_xid: record.controller_xid,
                    acc: record.acc,
                });
            }
        }
        flushed
    }

    /// A switch left: it will never answer. Records it was the last holdout
    /// for complete with what they have.
    pub fn drop_switch(&mut self, dpid: DatapathId) -> Vec<CompletedStats> {
        let drained: Vec<u32> = self
            .records
            .iter_mut()
            .filter_map(|(&xid, record)| {
                record.pending.remove(&dpid);
                record.pending.is_empty().then_some(xid)
            })
            .collect();
        drained
            .into_iter()
            .filter_map(|xid| self.take(xid))
            .collect()
    }

    /// A controller session closed: its replies have nowhere to go.
    pub fn drop_slice(&mut self, slice: SliceId) {
        let before = self.records.len();
        self.records.retain(|_, record| record.slice != slice);
        let dropped = before - self.records.len();
        if dropped > 0 {
            debug!(?slice, dropped, "discarded pending aggregations for closed slice");
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn merge(acc: &mut Accumulator, chunk: StatsChunk, xid: u32) {
    match (acc, chunk) {
        (Accumulator::Flow(entries), StatsChunk::Flow(mut more)) => entries.append(&mut more),
        (Accumulator::Aggregate(total), StatsChunk::Aggregate(part)) => {
            total.packet_count = total.packet_count.wrapping_add(part.packet_count);
            total.byte_count = total.byte_count.wrapping_add(part.byte_count);
            total.flow_count = total.flow_count.wrapping_add(part.flow_count);
        }
        (Accumulator::Port(entries), StatsChunk::Port(mut more)) => entries.append(&mut more),
        // One table is synthesized for the whole fabric; per-switch table
        // stats never reach controllers.
        (Accumulator::Table(_), StatsChunk::Table(_)) => {}
        (_, _) => warn!(xid, "stats reply kind disagrees with its request"),
    }
}
