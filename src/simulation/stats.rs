//! Counters, the moving-PDR auto-stop window, and the final report.

use std::collections::VecDeque;
use std::fmt;

use crate::region::{RegionPlan, SF_MIN};
use crate::simulation::gateway::Gateway;
use crate::simulation::types::Node;

/// Number of recent packet-delivery-ratio samples the auto-stop watches.
const PDR_WINDOW: usize = 100;
/// The run may stop early once the window's standard deviation drops here.
const PDR_SETTLED_STDDEV: f64 = 1e-4;

/// Global counters maintained by the event handlers.
#[derive(Debug, Default)]
pub struct Stats {
    /// Uplink attempts dispatched, retransmissions included.
    pub total_tx: u64,
    /// Retransmission attempts dispatched.
    pub total_retx: u64,
    /// Uplink attempts received by at least one gateway.
    pub total_received: u64,
    /// Unique confirmed uplinks acknowledged.
    pub acked: u64,
    /// Unique confirmed uplinks dropped after exhausting retries.
    pub dropped_confirmed: u64,
    /// Unique unconfirmed uplinks that reached no gateway.
    pub dropped_unconfirmed: u64,
    /// Wanted downlinks with no feasible gateway in RX1.
    pub no_rx1: u64,
    /// Wanted downlinks with no feasible gateway in either window.
    pub no_rx1_rx2: u64,
    /// Total downlink airtime across all gateways (seconds).
    pub downlink_time_s: f64,
    pdr_window: VecDeque<f64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the auto-stop window with the current global PDR after a unique
    /// uplink resolved (acked, delivered or dropped).
    pub fn push_pdr_sample(&mut self, pdr: f64) {
        if self.pdr_window.len() >= PDR_WINDOW {
            self.pdr_window.pop_front();
        }
        self.pdr_window.push_back(pdr);
    }

    /// Whether the moving PDR has settled enough to stop the run early.
    pub fn pdr_settled(&self) -> bool {
        if self.pdr_window.len() < PDR_WINDOW {
            return false;
        }
        let samples: Vec<f64> = self.pdr_window.iter().copied().collect();
        stddev(&samples) < PDR_SETTLED_STDDEV
    }
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Everything the final stdout report prints, precomputed.
pub struct SimReport {
    pub elapsed_s: f64,
    pub avg_energy_mj: f64,
    pub min_energy_mj: f64,
    pub max_energy_mj: f64,
    pub total_tx: u64,
    pub total_retx: u64,
    pub total_unique: u64,
    pub stdv_unique: f64,
    pub total_received: u64,
    pub acked: u64,
    pub dropped_confirmed: u64,
    pub dropped_unconfirmed: u64,
    pub confirmed_pdr: f64,
    pub pdr: f64,
    pub prr: f64,
    pub no_rx1: u64,
    pub no_rx1_rx2: u64,
    pub downlink_time_s: f64,
    /// Per gateway: identifier, acks+commands, per-band (band, percentage, limit percentage).
    pub gateways: Vec<(String, u64, Vec<(u8, f64, f64)>)>,
    /// Node population per SF7..SF12.
    pub sf_population: [usize; 6],
    pub avg_sf: f64,
}

impl SimReport {
    pub fn build(elapsed_s: f64, nodes: &[Node], gateways: &[Gateway], stats: &Stats, plan: &RegionPlan) -> Self {
        let energies: Vec<f64> = nodes.iter().map(|n| n.energy_mj).collect();
        let total_unique: u64 = nodes.iter().map(|n| n.unique).sum();
        let uniques: Vec<f64> = nodes.iter().map(|n| n.unique as f64).collect();
        let unique_confirmed: u64 = nodes.iter().filter(|n| n.confirmed).map(|n| n.unique).sum();
        let delivered_unconfirmed: u64 = nodes.iter().filter(|n| !n.confirmed).map(|n| n.delivered).sum();

        let mut sf_population = [0usize; 6];
        for n in nodes {
            sf_population[(n.sf - SF_MIN) as usize] += 1;
        }
        let avg_sf = if nodes.is_empty() {
            0.0
        } else {
            nodes.iter().map(|n| n.sf as f64).sum::<f64>() / nodes.len() as f64
        };

        let gw_lines = gateways
            .iter()
            .map(|gw| {
                let mut bands: Vec<(u8, f64, f64)> = gw
                    .dl_airtime
                    .iter()
                    .filter_map(|(&band, &airtime)| {
                        plan.duty_fraction(band)
                            .map(|limit| (band, 100.0 * airtime / elapsed_s.max(f64::MIN_POSITIVE), 100.0 * limit))
                    })
                    .collect();
                bands.sort_by_key(|&(band, _, _)| band);
                (gw.id.clone(), gw.acks_sent, bands)
            })
            .collect();

        SimReport {
            elapsed_s,
            avg_energy_mj: if energies.is_empty() { 0.0 } else { energies.iter().sum::<f64>() / energies.len() as f64 },
            min_energy_mj: energies.iter().cloned().fold(f64::INFINITY, f64::min),
            max_energy_mj: energies.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            total_tx: stats.total_tx,
            total_retx: stats.total_retx,
            total_unique,
            stdv_unique: stddev(&uniques),
            total_received: stats.total_received,
            acked: stats.acked,
            dropped_confirmed: stats.dropped_confirmed,
            dropped_unconfirmed: stats.dropped_unconfirmed,
            confirmed_pdr: ratio(stats.acked, unique_confirmed),
            pdr: ratio(stats.acked + delivered_unconfirmed, total_unique),
            prr: ratio(stats.total_received, stats.total_tx),
            no_rx1: stats.no_rx1,
            no_rx1_rx2: stats.no_rx1_rx2,
            downlink_time_s: stats.downlink_time_s,
            gateways: gw_lines,
            sf_population,
            avg_sf,
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulation time = {:.2} secs", self.elapsed_s)?;
        writeln!(f, "Avg node consumption = {:.2} mJ", self.avg_energy_mj)?;
        writeln!(f, "Min node consumption = {:.2} mJ", self.min_energy_mj)?;
        writeln!(f, "Max node consumption = {:.2} mJ", self.max_energy_mj)?;
        writeln!(f, "Total number of transmissions = {}", self.total_tx)?;
        writeln!(f, "Total number of re-transmissions = {}", self.total_retx)?;
        writeln!(f, "Total number of unique transmissions = {}", self.total_unique)?;
        writeln!(f, "Stdv of unique transmissions = {:.2}", self.stdv_unique)?;
        writeln!(f, "Total packets received = {}", self.total_received)?;
        writeln!(f, "Total unique packets acknowledged = {}", self.acked)?;
        writeln!(f, "Total confirmed packets dropped = {}", self.dropped_confirmed)?;
        writeln!(f, "Total unconfirmed packets dropped = {}", self.dropped_unconfirmed)?;
        writeln!(f, "Confirmed Packet Delivery Ratio (unique) = {:.5}", self.confirmed_pdr)?;
        writeln!(f, "Packet Delivery Ratio = {:.5}", self.pdr)?;
        writeln!(f, "Packet Reception Ratio = {:.5}", self.prr)?;
        writeln!(f, "No GW available in RX1 = {}", self.no_rx1)?;
        writeln!(f, "No GW available in RX1 or RX2 = {}", self.no_rx1_rx2)?;
        writeln!(f, "Total downlink time = {:.2} secs", self.downlink_time_s)?;
        for (id, acks, bands) in &self.gateways {
            writeln!(f, "GW {} sent out {} acks and commands", id, acks)?;
            for (band, pct, limit) in bands {
                writeln!(f, "GW {} band {} duty cycle = {:.3}% (limit {:.0}%)", id, band, pct, limit)?;
            }
        }
        for (i, count) in self.sf_population.iter().enumerate() {
            writeln!(f, "# of nodes with SF{}: {}", SF_MIN as usize + i, count)?;
        }
        writeln!(f, "Avg SF = {:.2}", self.avg_sf)?;
        Ok(())
    }
}
