//! Per-device energy accounting.
//!
//! Every uplink costs a short carrier-sensing pad and the TX phase; the two
//! class-A receive windows cost either a full downlink reception or a
//! preamble-length listen, with the MCU idling between the windows. All
//! figures derive from discrete current draws at 3.3 V and accumulate in
//! millijoules.

use crate::region::{RegionPlan, IDLE_CURRENT_MA, RECEIVE_DELAY1, RECEIVE_DELAY2, RX_CURRENT_MA, SUPPLY_V};
use crate::simulation::signal::{cad_time, preamble_time};

/// How the pair of receive windows of one uplink played out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RxOutcome {
    /// A downlink was demodulated in RX1; RX2 is never entered.
    ReceivedRx1 { airtime: f64 },
    /// RX1 was only listened into; a downlink was demodulated in RX2.
    ReceivedRx2 { airtime: f64 },
    /// Both windows opened and closed on preamble listens alone. This also
    /// covers a downlink destroyed at the device: the preamble was detected
    /// but nothing was demodulated.
    Nothing,
}

/// Energy model bound to the region's power ladder.
#[derive(Debug)]
pub struct EnergyModel {
    rx_mw: f64,
    idle_mw: f64,
    /// Radio TX power per ladder index (mW).
    tx_mw: Vec<f64>,
}

impl EnergyModel {
    pub fn new(plan: &RegionPlan) -> Self {
        EnergyModel {
            rx_mw: RX_CURRENT_MA * SUPPLY_V,
            idle_mw: IDLE_CURRENT_MA * SUPPLY_V,
            tx_mw: plan.ptx_current_ma.iter().map(|ma| ma * SUPPLY_V).collect(),
        }
    }

    /// Sensing pad before TX: a two-symbol channel-activity check with the
    /// receiver running.
    pub fn sensing_mj(&self, sf: u8, bw_hz: u32) -> f64 {
        cad_time(sf, bw_hz) * (self.rx_mw + self.idle_mw)
    }

    /// TX phase: radio at the ladder rung plus the MCU.
    pub fn tx_mj(&self, airtime: f64, ptx_index: usize) -> f64 {
        airtime * (self.tx_mw[ptx_index] + self.idle_mw)
    }

    /// Energy of the two receive windows following one uplink.
    ///
    /// `rx1_sf`/`rx1_bw` set the preamble listen length of RX1 (the uplink
    /// data rate), `rx2_sf`/`rx2_bw` that of RX2.
    pub fn rx_windows_mj(&self, outcome: RxOutcome, rx1_sf: u8, rx1_bw: u32, rx2_sf: u8, rx2_bw: u32) -> f64 {
        let rx1_listen = preamble_time(rx1_sf, rx1_bw);
        let rx2_listen = preamble_time(rx2_sf, rx2_bw);
        let bridge = (RECEIVE_DELAY2 - RECEIVE_DELAY1 - rx1_listen).max(0.0);
        match outcome {
            RxOutcome::ReceivedRx1 { airtime } => airtime * (self.rx_mw + self.idle_mw),
            RxOutcome::ReceivedRx2 { airtime } => rx1_listen * (self.rx_mw + self.idle_mw) + bridge * self.idle_mw + airtime * (self.rx_mw + self.idle_mw),
            RxOutcome::Nothing => rx1_listen * (self.rx_mw + self.idle_mw) + bridge * self.idle_mw + rx2_listen * (self.rx_mw + self.idle_mw),
        }
    }
}
