//! Core data structures of the simulation.
//!
//! Contains the arena-indexed end-device state, the tagged transmission
//! event, the downlink descriptor tying an ack or command to its destination
//! node, and the suppression bookkeeping the collision engine uses to mark
//! still-queued transmissions as destroyed.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::region::Band;

/// Arena index of an end-device.
pub type NodeIdx = usize;
/// Arena index of a gateway.
pub type GwIdx = usize;
/// Index into the region's unified channel table.
pub type ChIdx = usize;

/// Number of best-SNR observations the ADR controller keeps per device.
pub const ADR_WINDOW: usize = 10;

/// Simple 2D point in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// End-device state.
///
/// Configuration fields are fixed at setup (position, SF, confirmed flag,
/// payload size); the rest is runtime state mutated by the event handlers.
#[derive(Debug, Clone)]
pub struct Node {
    /// Numeric identifier from the terrain file, kept for reporting.
    pub id: u32,
    pub position: Position,
    /// Index into the region's transmit-power ladder.
    pub ptx_index: usize,
    /// Spreading factor, fixed for the whole run.
    pub sf: u8,
    /// Whether uplinks require an acknowledgement.
    pub confirmed: bool,
    /// Application payload size in bytes, fixed per device.
    pub payload: usize,
    /// Mean uplink inter-arrival time in seconds.
    pub period_s: f64,

    /// Monotone unique-uplink counter (FCntUp analogue).
    pub fcnt_up: u64,
    /// Retransmission counter of the in-flight packet.
    pub retr: u8,
    /// Whether the in-flight unique packet reached at least one gateway.
    pub cur_delivered: bool,
    /// Per-band earliest next-allowed transmission time (uplink duty cycle).
    pub ndc: HashMap<Band, f64>,
    /// Channel used by the previous attempt, excluded from the next draw.
    pub last_channel: Option<ChIdx>,
    /// Rolling window of the best received SNR across gateways (last ten).
    pub best_snr: VecDeque<f64>,
    /// ADR power-change awaiting delivery: the new ladder index.
    pub pending_ptx: Option<usize>,
    /// Gateways reachable at the RX2 spreading factor, from SF assignment.
    pub reachable_rx2: Vec<GwIdx>,

    /// Unique uplinks dispatched.
    pub unique: u64,
    /// Unique uplinks that reached at least one gateway.
    pub delivered: u64,
    /// Unique uplinks acknowledged (confirmed traffic only).
    pub acked: u64,
    /// Unique confirmed uplinks dropped after exhausting retries.
    pub dropped: u64,
    /// Unique unconfirmed uplinks that reached no gateway.
    pub dropped_unconfirmed: u64,
    /// Retransmission attempts dispatched.
    pub retransmissions: u64,
    /// Times a wanted downlink found no gateway in either window.
    pub nogw: u64,
    /// Accumulated energy consumption in millijoules.
    pub energy_mj: f64,
}

impl Node {
    pub fn new(id: u32, position: Position, ptx_index: usize, period_s: f64) -> Self {
        Node {
            id,
            position,
            ptx_index,
            sf: 0,
            confirmed: false,
            payload: 0,
            period_s,
            fcnt_up: 0,
            retr: 0,
            cur_delivered: false,
            ndc: HashMap::new(),
            last_channel: None,
            best_snr: VecDeque::with_capacity(ADR_WINDOW),
            pending_ptx: None,
            reachable_rx2: Vec::new(),
            unique: 0,
            delivered: 0,
            dropped: 0,
            dropped_unconfirmed: 0,
            acked: 0,
            retransmissions: 0,
            nogw: 0,
            energy_mj: 0.0,
        }
    }

    /// Push a best-SNR observation, keeping the last `ADR_WINDOW` samples.
    pub fn push_snr_sample(&mut self, snr_db: f64) {
        if self.best_snr.len() >= ADR_WINDOW {
            self.best_snr.pop_front();
        }
        self.best_snr.push_back(snr_db);
    }

    /// Earliest allowed start on a band, or the candidate itself where no
    /// deadline has been recorded.
    pub fn duty_clamp(&self, band: Band, candidate_sta: f64) -> f64 {
        match self.ndc.get(&band) {
            Some(&deadline) => candidate_sta.max(deadline),
            None => candidate_sta,
        }
    }

    /// Fairness of the ack service this device has received so far.
    pub fn ack_fairness(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.acked as f64 / self.delivered as f64
        }
    }
}

/// Which receive window a downlink targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWindow {
    Rx1,
    Rx2,
}

/// Descriptor tying a scheduled downlink to its destination device.
#[derive(Debug, Clone)]
pub struct DownlinkFrame {
    pub dest: NodeIdx,
    pub window: RxWindow,
    /// Acknowledges a confirmed uplink (false for a bare ADR command).
    pub acks: bool,
    /// FCntUp of the uplink being answered.
    pub seq: u64,
    /// ADR power request riding along: the new ladder index.
    pub new_ptx: Option<usize>,
    /// Downlink frame size in bytes.
    pub payload: usize,
}

/// Originator of a transmission.
///
/// An explicit tagged variant instead of encoding the direction in the
/// identifier string: uplinks carry the device and its sequence, downlinks
/// carry the gateway and the full frame descriptor.
#[derive(Debug, Clone)]
pub enum TxKind {
    Uplink { node: NodeIdx, seq: u64, attempt: u8 },
    Downlink { gw: GwIdx, frame: DownlinkFrame },
}

/// One in-flight or pending transmission.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Globally unique, monotonically assigned id; also the equal-time
    /// insertion-order tie-break.
    pub id: u64,
    pub sta: f64,
    pub end: f64,
    pub channel: ChIdx,
    pub sf: u8,
    pub kind: TxKind,
}

impl Transmission {
    pub fn overlaps(&self, sta: f64, end: f64) -> bool {
        self.sta <= end && self.end >= sta
    }
}

// Heap ordering: earliest start first, then insertion order. BinaryHeap is a
// max-heap, so the comparison is reversed.
impl PartialEq for Transmission {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transmission {}

impl PartialOrd for Transmission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transmission {
    fn cmp(&self, other: &Self) -> Ordering {
        other.sta.partial_cmp(&self.sta).unwrap_or(Ordering::Equal).then(other.id.cmp(&self.id))
    }
}

/// Destruction marks for transmissions still sitting in the queues.
///
/// The collision engine evaluates each pair of overlapping transmissions
/// once, when the earlier one is dispatched; outcomes against the later one
/// are recorded here and consumed when that transmission is popped.
#[derive(Debug, Default)]
pub struct Suppression {
    uplinks: HashMap<u64, HashSet<GwIdx>>,
    downlinks: HashSet<u64>,
}

impl Suppression {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an uplink destroyed at one gateway.
    pub fn mark_uplink(&mut self, tx_id: u64, gw: GwIdx) {
        self.uplinks.entry(tx_id).or_default().insert(gw);
    }

    pub fn uplink_suppressed_at(&self, tx_id: u64, gw: GwIdx) -> bool {
        self.uplinks.get(&tx_id).map(|s| s.contains(&gw)).unwrap_or(false)
    }

    /// Mark a downlink destroyed at its destination node.
    pub fn mark_downlink(&mut self, tx_id: u64) {
        self.downlinks.insert(tx_id);
    }

    pub fn downlink_killed(&self, tx_id: u64) -> bool {
        self.downlinks.contains(&tx_id)
    }

    /// Drop all marks for a transmission that has been dispatched.
    pub fn forget(&mut self, tx_id: u64) {
        self.uplinks.remove(&tx_id);
        self.downlinks.remove(&tx_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snr_window_is_bounded() {
        let mut node = Node::new(1, Position { x: 0.0, y: 0.0 }, 4, 10.0);
        for i in 0..15 {
            node.push_snr_sample(i as f64);
        }
        assert_eq!(node.best_snr.len(), ADR_WINDOW);
        assert_eq!(*node.best_snr.front().unwrap(), 5.0);
        assert_eq!(*node.best_snr.back().unwrap(), 14.0);
    }

    #[test]
    fn duty_clamp_honours_recorded_deadline() {
        let mut node = Node::new(1, Position { x: 0.0, y: 0.0 }, 4, 10.0);
        assert_eq!(node.duty_clamp(48, 5.0), 5.0);
        node.ndc.insert(48, 12.5);
        assert_eq!(node.duty_clamp(48, 5.0), 12.5);
        assert_eq!(node.duty_clamp(48, 20.0), 20.0);
        assert_eq!(node.duty_clamp(54, 5.0), 5.0);
    }

    #[test]
    fn transmission_interval_overlap() {
        let tx = Transmission {
            id: 1,
            sta: 10.0,
            end: 12.0,
            channel: 0,
            sf: 7,
            kind: TxKind::Uplink { node: 0, seq: 1, attempt: 0 },
        };
        assert!(tx.overlaps(11.0, 13.0));
        assert!(tx.overlaps(8.0, 10.0));
        assert!(!tx.overlaps(12.1, 14.0));
    }

    #[test]
    fn suppression_marks_are_per_gateway_and_consumed() {
        let mut sup = Suppression::new();
        sup.mark_uplink(7, 0);
        assert!(sup.uplink_suppressed_at(7, 0));
        assert!(!sup.uplink_suppressed_at(7, 1));
        sup.mark_downlink(9);
        assert!(sup.downlink_killed(9));
        sup.forget(7);
        sup.forget(9);
        assert!(!sup.uplink_suppressed_at(7, 0));
        assert!(!sup.downlink_killed(9));
    }
}
