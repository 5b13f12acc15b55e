//! Per-channel time-sorted event queues.
//!
//! Each channel owns a min-heap of pending transmissions keyed on start
//! time. Dispatch picks the earliest head across all channels through a
//! small secondary heap of heap-tops with lazy invalidation, so every event
//! costs O(log n) instead of a linear scan over channels.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::types::{ChIdx, Transmission};

/// Entry of the dispatch index: one per pushed transmission. An entry is
/// live only while it still matches the head of its channel heap; stale
/// entries are skipped on pop.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeadEntry {
    sta_bits: u64,
    channel: ChIdx,
    id: u64,
}

impl HeadEntry {
    fn new(sta: f64, channel: ChIdx, id: u64) -> Self {
        // Non-negative finite times order correctly through their IEEE bits.
        HeadEntry {
            sta_bits: sta.to_bits(),
            channel,
            id,
        }
    }
}

/// All pending transmissions, grouped per channel.
#[derive(Debug)]
pub struct EventQueues {
    channels: Vec<BinaryHeap<Transmission>>,
    index: BinaryHeap<Reverse<HeadEntry>>,
}

impl EventQueues {
    pub fn new(channel_count: usize) -> Self {
        EventQueues {
            channels: (0..channel_count).map(|_| BinaryHeap::new()).collect(),
            index: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, tx: Transmission) {
        debug_assert!(tx.sta.is_finite() && tx.sta >= 0.0);
        self.index.push(Reverse(HeadEntry::new(tx.sta, tx.channel, tx.id)));
        self.channels[tx.channel].push(tx);
    }

    /// Pop the pending transmission with the smallest start time, ties
    /// broken by channel identifier then insertion order.
    pub fn pop_earliest(&mut self) -> Option<Transmission> {
        while let Some(Reverse(entry)) = self.index.pop() {
            let is_head = self.channels[entry.channel].peek().map(|head| head.id == entry.id).unwrap_or(false);
            if is_head {
                return self.channels[entry.channel].pop();
            }
            // Stale: the referenced transmission is not this channel's head
            // any more (it was popped through a later, smaller entry).
        }
        None
    }

    /// All still-queued transmissions on `channel` whose interval could
    /// overlap [sta, end], excluding `exclude_id`, sorted by (sta, id) so
    /// that collision evaluation visits candidates in a documented order.
    pub fn overlapping(&self, channel: ChIdx, sta: f64, end: f64, exclude_id: u64) -> Vec<&Transmission> {
        let mut hits: Vec<&Transmission> = self.channels[channel].iter().filter(|t| t.id != exclude_id && t.overlaps(sta, end)).collect();
        hits.sort_by(|a, b| a.sta.partial_cmp(&b.sta).unwrap().then(a.id.cmp(&b.id)));
        hits
    }

    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|c| c.is_empty())
    }

    pub fn len(&self) -> usize {
        self.channels.iter().map(|c| c.len()).sum()
    }
}
