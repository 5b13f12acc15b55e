//! Downlink planning: RX window feasibility, gateway selection and ADR.
//!
//! After a received uplink that wants an answer (confirmed traffic, or an
//! ADR power command for unconfirmed traffic), the planner looks for a
//! gateway able to transmit in RX1, falling back to RX2. A gateway is
//! feasible for a window when it is not already transmitting, not committed
//! to an uplink on the downlink carrier, and (on EU868) past its per-band
//! duty-cycle deadline. Which feasible gateway answers is the configured
//! selection policy's call; the URCB and FBS policies may deliberately
//! abstain to leave capacity to worse-served devices.

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::Policy;
use crate::region::{Band, RegionPlan, ADR_BYTES, OVERHEAD_D, RECEIVE_DELAY1, RECEIVE_DELAY2};
use crate::simulation::collision::Reception;
use crate::simulation::gateway::Gateway;
use crate::simulation::signal::{calculate_mean_rssi, AirtimeCalculator, SNR_MARGIN_DB};
use crate::simulation::types::{ChIdx, GwIdx, Node, NodeIdx, RxWindow, Transmission, ADR_WINDOW};

/// A downlink the planner wants scheduled.
#[derive(Debug, Clone)]
pub struct DownlinkPlan {
    pub gw: GwIdx,
    pub window: RxWindow,
    pub channel: ChIdx,
    pub sf: u8,
    pub sta: f64,
    pub airtime: f64,
    pub band: Band,
    pub payload: usize,
}

/// Planner verdict, including the unavailability signals the statistics
/// aggregator counts.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Option<DownlinkPlan>,
    /// RX1 had no feasible gateway.
    pub rx1_unavailable: bool,
    /// Neither window had a feasible gateway.
    pub rx2_unavailable: bool,
    /// A policy chose not to answer although gateways were feasible.
    pub abstained: bool,
}

/// One gateway the selection policies can pick from.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    gw: GwIdx,
    prx_dbm: f64,
}

fn window_feasible(gw: &Gateway, channel: ChIdx, sta: f64, end: f64, band: Band, plan: &RegionPlan) -> bool {
    if gw.transmitting_during(sta, end) {
        return false;
    }
    if gw.locked_during(channel, sta, end) {
        return false;
    }
    if plan.duty_multiplier(band).is_some() && gw.duty_deadline(band) > sta {
        return false;
    }
    true
}

/// Pick the answering gateway for an uplink, or report why none answers.
#[allow(clippy::too_many_arguments)]
pub fn plan_downlink(
    uplink: &Transmission,
    node_idx: NodeIdx,
    nodes: &[Node],
    receptions: &[Reception],
    gateways: &[Gateway],
    plan: &RegionPlan,
    airtimes: &mut AirtimeCalculator,
    policy: Policy,
    abstain_free_threshold: f64,
    adr_rides: bool,
    rng: &mut StdRng,
) -> PlanOutcome {
    let node = &nodes[node_idx];
    let payload = OVERHEAD_D + if adr_rides { ADR_BYTES } else { 0 };

    // RX1: same data rate as the uplink, on the region's answer carrier.
    let rx1_channel = plan.rx1_channel(uplink.channel);
    let rx1_band = plan.band_of(rx1_channel);
    let rx1_sf = uplink.sf;
    let rx1_bw = plan.channels[rx1_channel].bw_hz;
    let rx1_sta = uplink.end + RECEIVE_DELAY1;
    let rx1_airtime = airtimes.airtime(rx1_sf, rx1_bw, payload);

    let rx1_candidates: Vec<Candidate> = receptions
        .iter()
        .filter(|r| window_feasible(&gateways[r.gw], rx1_channel, rx1_sta, rx1_sta + rx1_airtime, rx1_band, plan))
        .map(|r| Candidate { gw: r.gw, prx_dbm: r.prx_dbm })
        .collect();

    if !rx1_candidates.is_empty() {
        return match select_gateway(&rx1_candidates, node, nodes, gateways, rx1_band, policy, abstain_free_threshold, rng) {
            Some(gw) => PlanOutcome {
                plan: Some(DownlinkPlan {
                    gw,
                    window: RxWindow::Rx1,
                    channel: rx1_channel,
                    sf: rx1_sf,
                    sta: rx1_sta,
                    airtime: rx1_airtime,
                    band: rx1_band,
                    payload,
                }),
                rx1_unavailable: false,
                rx2_unavailable: false,
                abstained: false,
            },
            None => PlanOutcome {
                plan: None,
                rx1_unavailable: false,
                rx2_unavailable: false,
                abstained: true,
            },
        };
    }

    // RX2: the dedicated carrier at the region's RX2 data rate. When the
    // uplink ran at a lower SF than RX2, the slower downlink may reach
    // gateways that missed the uplink, so the candidate set broadens to the
    // whole RX2-reachable cache.
    let rx2_channel = plan.rx2_index;
    let rx2_band = plan.band_of(rx2_channel);
    let rx2_sf = plan.rx2_sf;
    let rx2_bw = plan.channels[rx2_channel].bw_hz;
    let rx2_sta = uplink.end + RECEIVE_DELAY2;
    let rx2_airtime = airtimes.airtime(rx2_sf, rx2_bw, payload);

    let mut rx2_pool: Vec<Candidate> = receptions.iter().map(|r| Candidate { gw: r.gw, prx_dbm: r.prx_dbm }).collect();
    if node.sf < rx2_sf {
        let ptx = plan.ptx_ladder_dbm[node.ptx_index];
        for &gw in &node.reachable_rx2 {
            if rx2_pool.iter().all(|c| c.gw != gw) {
                // No demodulation RSSI exists for a gateway that missed the
                // uplink; the mean received power stands in for ranking.
                rx2_pool.push(Candidate {
                    gw,
                    prx_dbm: calculate_mean_rssi(node.position.distance(&gateways[gw].position), ptx),
                });
            }
        }
    }

    let rx2_candidates: Vec<Candidate> = rx2_pool
        .into_iter()
        .filter(|c| window_feasible(&gateways[c.gw], rx2_channel, rx2_sta, rx2_sta + rx2_airtime, rx2_band, plan))
        .collect();

    if rx2_candidates.is_empty() {
        return PlanOutcome {
            plan: None,
            rx1_unavailable: true,
            rx2_unavailable: true,
            abstained: false,
        };
    }

    match select_gateway(&rx2_candidates, node, nodes, gateways, rx2_band, policy, abstain_free_threshold, rng) {
        Some(gw) => PlanOutcome {
            plan: Some(DownlinkPlan {
                gw,
                window: RxWindow::Rx2,
                channel: rx2_channel,
                sf: rx2_sf,
                sta: rx2_sta,
                airtime: rx2_airtime,
                band: rx2_band,
                payload,
            }),
            rx1_unavailable: true,
            rx2_unavailable: false,
            abstained: false,
        },
        None => PlanOutcome {
            plan: None,
            rx1_unavailable: true,
            rx2_unavailable: false,
            abstained: true,
        },
    }
}

/// Apply the configured selection policy to the feasible gateways.
#[allow(clippy::too_many_arguments)]
fn select_gateway(
    candidates: &[Candidate],
    node: &Node,
    nodes: &[Node],
    gateways: &[Gateway],
    band: Band,
    policy: Policy,
    abstain_free_threshold: f64,
    rng: &mut StdRng,
) -> Option<GwIdx> {
    debug_assert!(!candidates.is_empty());
    match policy {
        Policy::Fcfs => Some(candidates[rng.gen_range(0..candidates.len())].gw),
        Policy::Rssi => Some(best_rssi(candidates)),
        Policy::Lb => candidates
            .iter()
            .min_by(|a, b| {
                gateways[a.gw]
                    .duty_deadline(band)
                    .partial_cmp(&gateways[b.gw].duty_deadline(band))
                    .unwrap()
                    .then(a.gw.cmp(&b.gw))
            })
            .map(|c| c.gw),
        Policy::Urcb => {
            let avg_nogw = nodes.iter().map(|n| n.nogw as f64).sum::<f64>() / nodes.len() as f64;
            if (node.nogw as f64) < avg_nogw && free_fraction(candidates, node) > abstain_free_threshold {
                None
            } else {
                Some(best_rssi(candidates))
            }
        }
        Policy::Fbs => {
            let avg_fairness = nodes.iter().map(|n| n.ack_fairness()).sum::<f64>() / nodes.len() as f64;
            if node.ack_fairness() > avg_fairness && free_fraction(candidates, node) > abstain_free_threshold {
                None
            } else {
                Some(best_rssi(candidates))
            }
        }
    }
}

fn best_rssi(candidates: &[Candidate]) -> GwIdx {
    candidates
        .iter()
        .max_by(|a, b| a.prx_dbm.partial_cmp(&b.prx_dbm).unwrap().then(b.gw.cmp(&a.gw)))
        .map(|c| c.gw)
        .expect("non-empty candidate list")
}

/// Fraction of the device's reachable gateways that are free to answer.
fn free_fraction(candidates: &[Candidate], node: &Node) -> f64 {
    if node.reachable_rx2.is_empty() {
        return 1.0;
    }
    candidates.len() as f64 / node.reachable_rx2.len() as f64
}

/// ADR power step: once ten best-SNR samples have accumulated, the margin
/// above the demodulation floor converts into whole 3 dB ladder steps,
/// clamped to the region's ladder bounds. Returns the new ladder index only
/// when it differs from the current one.
pub fn adr_power_step(node: &Node, plan: &RegionPlan) -> Option<usize> {
    if node.best_snr.len() < ADR_WINDOW {
        return None;
    }
    let best = node.best_snr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let gap = best - crate::region::required_snr_db(node.sf) - SNR_MARGIN_DB;
    let steps = (gap / 3.0).floor() as i64;
    let new_index = (node.ptx_index as i64 - steps).clamp(0, plan.ptx_max_index() as i64) as usize;
    if new_index != node.ptx_index {
        Some(new_index)
    } else {
        None
    }
}
