//! Half-duplex gateway state.
//!
//! A gateway tracks three things per the radio model: the single uplink it
//! is committed to demodulating on each channel (the uplink lock), the
//! intervals during which it is transmitting downlinks (and therefore deaf
//! on every channel), and its per-band duty-cycle deadlines and airtime
//! totals for downlink planning and reporting.

use std::collections::HashMap;

use crate::region::Band;
use crate::simulation::types::{ChIdx, Position};

/// The one transmission a gateway is currently receiving on a channel.
#[derive(Debug, Clone, Copy)]
pub struct UplinkLock {
    pub sta: f64,
    pub end: f64,
    pub sf: u8,
}

#[derive(Debug)]
pub struct Gateway {
    /// Letter-sequence identifier from the terrain file (`A`, `B`, .. `AA`).
    pub id: String,
    pub position: Position,
    /// Intervals during which this gateway is transmitting a downlink.
    downlink_busy: Vec<(f64, f64)>,
    /// Per-channel uplink-lock record; at most one active per channel.
    uplink_locks: HashMap<ChIdx, UplinkLock>,
    /// Per-band earliest time the next downlink may start.
    duty_deadline: HashMap<Band, f64>,
    /// Per-band accumulated downlink airtime, for duty-cycle reporting.
    pub dl_airtime: HashMap<Band, f64>,
    /// Acknowledgements and commands sent.
    pub acks_sent: u64,
}

impl Gateway {
    pub fn new(id: String, position: Position) -> Self {
        Gateway {
            id,
            position,
            downlink_busy: Vec::new(),
            uplink_locks: HashMap::new(),
            duty_deadline: HashMap::new(),
            dl_airtime: HashMap::new(),
            acks_sent: 0,
        }
    }

    /// Whether any downlink transmission overlaps [sta, end]. A transmitting
    /// gateway cannot receive on any channel.
    pub fn transmitting_during(&self, sta: f64, end: f64) -> bool {
        self.downlink_busy.iter().any(|&(b_sta, b_end)| b_sta <= end && b_end >= sta)
    }

    /// Whether an active lock on `channel` with the same SF overlaps the
    /// interval, which suppresses a newly arriving co-SF uplink.
    pub fn lock_blocks_uplink(&self, channel: ChIdx, sta: f64, end: f64, sf: u8) -> bool {
        match self.uplink_locks.get(&channel) {
            Some(lock) => lock.sf == sf && lock.sta <= end && lock.end >= sta,
            None => false,
        }
    }

    /// Whether any lock on `channel` overlaps the interval, regardless of
    /// SF. Downlink planning treats a receiving gateway as unavailable on
    /// that carrier.
    pub fn locked_during(&self, channel: ChIdx, sta: f64, end: f64) -> bool {
        match self.uplink_locks.get(&channel) {
            Some(lock) => lock.sta <= end && lock.end >= sta,
            None => false,
        }
    }

    /// Install an uplink-lock record. Pre-emption is not allowed: an active
    /// lock stays in place and the new record is discarded.
    pub fn install_lock(&mut self, channel: ChIdx, lock: UplinkLock) {
        match self.uplink_locks.get(&channel) {
            Some(existing) if existing.end > lock.sta => {}
            _ => {
                self.uplink_locks.insert(channel, lock);
            }
        }
    }

    /// Earliest time the next downlink may start on `band`.
    pub fn duty_deadline(&self, band: Band) -> f64 {
        self.duty_deadline.get(&band).copied().unwrap_or(0.0)
    }

    /// Register a scheduled downlink: purge stale busy intervals, record the
    /// new one and advance the band's duty-cycle deadline by
    /// `multiplier * airtime` past the end of the transmission.
    pub fn schedule_downlink(&mut self, now: f64, sta: f64, end: f64, band: Band, duty_multiplier: Option<f64>) {
        self.downlink_busy.retain(|&(_, b_end)| b_end >= now);
        self.downlink_busy.push((sta, end));
        if let Some(mult) = duty_multiplier {
            let deadline = end + mult * (end - sta);
            self.duty_deadline.insert(band, deadline);
        }
    }

    /// Account a dispatched downlink's airtime against the band total.
    pub fn record_downlink(&mut self, band: Band, airtime: f64) {
        *self.dl_airtime.entry(band).or_insert(0.0) += airtime;
        self.acks_sent += 1;
    }

    #[cfg(test)]
    pub fn active_lock(&self, channel: ChIdx) -> Option<&UplinkLock> {
        self.uplink_locks.get(&channel)
    }
}

/// Generate the letter-sequence identifier of gateway number `n`
/// (0 => `A`, 25 => `Z`, 26 => `AA`).
pub fn gateway_letter_id(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).expect("ASCII letters")
}
