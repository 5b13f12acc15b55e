//! Collision and capture decisions.
//!
//! On every dispatched transmission the engine re-evaluates the radio
//! environment at the relevant receivers: each gateway for an uplink, the
//! destination device for a downlink. Overlapping transmissions on the same
//! channel interact through the capture-threshold matrix; co-SF pairs within
//! the 1 dB window destroy each other, otherwise the stronger captures, and
//! non-orthogonal SF pairs apply the asymmetric margins when full-collision
//! modelling is enabled.
//!
//! Because events are dispatched in start-time order, the later member of an
//! overlapping pair is always still queued when the earlier one is
//! evaluated; its fate is recorded in [`Suppression`] and consumed when it
//! pops.

use rand::rngs::StdRng;

use crate::region::{capture_threshold_db, sensitivity_dbm, RegionPlan};
use crate::simulation::gateway::{Gateway, UplinkLock};
use crate::simulation::queue::EventQueues;
use crate::simulation::signal::{calculate_rssi, preamble_floor};
use crate::simulation::types::{DownlinkFrame, GwIdx, Node, Suppression, Transmission, TxKind};

/// A gateway that successfully demodulated an uplink, with the RSSI it saw.
#[derive(Debug, Clone, Copy)]
pub struct Reception {
    pub gw: GwIdx,
    pub prx_dbm: f64,
}

/// Outcome of one overlapping pair at a single receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    BothSurvive,
    SelDestroyed,
    OtherDestroyed,
    BothDestroyed,
}

/// Capture decision for two time-overlapping transmissions.
///
/// Same SF: within the co-SF window both are destroyed, otherwise the
/// stronger captures. Different SFs are orthogonal unless full-collision
/// modelling is on, in which case each side survives only when its power
/// margin over the other clears the asymmetric matrix entry.
fn capture_outcome(sf_sel: u8, prx_sel: f64, sf_other: u8, prx_other: f64, full_collision: bool) -> PairOutcome {
    if sf_sel == sf_other {
        let window = capture_threshold_db(sf_sel, sf_sel);
        if (prx_sel - prx_other).abs() <= window {
            PairOutcome::BothDestroyed
        } else if prx_sel > prx_other {
            PairOutcome::OtherDestroyed
        } else {
            PairOutcome::SelDestroyed
        }
    } else if full_collision {
        let sel_ok = prx_sel - prx_other >= capture_threshold_db(sf_sel, sf_other);
        let other_ok = prx_other - prx_sel >= capture_threshold_db(sf_other, sf_sel);
        match (sel_ok, other_ok) {
            (true, true) => PairOutcome::BothSurvive,
            (true, false) => PairOutcome::OtherDestroyed,
            (false, true) => PairOutcome::SelDestroyed,
            (false, false) => PairOutcome::BothDestroyed,
        }
    } else {
        PairOutcome::BothSurvive
    }
}

/// Evaluate a dispatched uplink at every gateway.
///
/// Returns the gateways that demodulate the frame, each with its reception
/// RSSI, and installs the corresponding uplink locks. Shadowing samples are
/// drawn per gateway in gateway-id order; interference against queued
/// downlinks is evaluated afterwards at their destination devices.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_uplink(
    sel: &Transmission,
    nodes: &[Node],
    gateways: &mut [Gateway],
    queues: &EventQueues,
    suppression: &mut Suppression,
    plan: &RegionPlan,
    full_collision: bool,
    rng: &mut StdRng,
) -> Vec<Reception> {
    let node_idx = match sel.kind {
        TxKind::Uplink { node, .. } => node,
        TxKind::Downlink { .. } => unreachable!("evaluate_uplink on a downlink"),
    };
    let node = &nodes[node_idx];
    let ptx = plan.ptx_ladder_dbm[node.ptx_index];
    let bw = plan.channels[sel.channel].bw_hz;
    let candidates = queues.overlapping(sel.channel, sel.sta, sel.end, sel.id);

    let mut receptions = Vec::new();
    for gi in 0..gateways.len() {
        let gw_pos = gateways[gi].position;
        let prx_sel = calculate_rssi(node.position.distance(&gw_pos), ptx, rng);

        if suppression.uplink_suppressed_at(sel.id, gi) {
            continue;
        }
        if prx_sel < sensitivity_dbm(sel.sf, bw) {
            continue;
        }
        if gateways[gi].transmitting_during(sel.sta, sel.end) {
            continue;
        }
        if gateways[gi].lock_blocks_uplink(sel.channel, sel.sta, sel.end, sel.sf) {
            continue;
        }

        let mut destroyed = false;
        for cand in &candidates {
            if let TxKind::Uplink { node: other_idx, .. } = cand.kind {
                let other = &nodes[other_idx];
                let prx_other = calculate_rssi(other.position.distance(&gw_pos), plan.ptx_ladder_dbm[other.ptx_index], rng);
                match capture_outcome(sel.sf, prx_sel, cand.sf, prx_other, full_collision) {
                    PairOutcome::BothSurvive => {}
                    PairOutcome::SelDestroyed => destroyed = true,
                    PairOutcome::OtherDestroyed => suppression.mark_uplink(cand.id, gi),
                    PairOutcome::BothDestroyed => {
                        destroyed = true;
                        suppression.mark_uplink(cand.id, gi);
                    }
                }
            }
        }

        if !destroyed {
            receptions.push(Reception { gw: gi, prx_dbm: prx_sel });
            gateways[gi].install_lock(
                sel.channel,
                UplinkLock {
                    sta: sel.sta + preamble_floor(sel.sf, bw),
                    end: sel.end,
                    sf: sel.sf,
                },
            );
        }
    }

    // Queued downlinks sharing the channel: the pair is decided at the
    // downlink's destination device. The uplink's own fate at the gateways
    // is not affected (gateway-side downlink interference is covered by the
    // transmitting-gateway deafness rule).
    for cand in &candidates {
        if let TxKind::Downlink { gw: src_gw, ref frame } = cand.kind {
            if suppression.downlink_killed(cand.id) {
                continue;
            }
            let dest = &nodes[frame.dest];
            let p_sel = calculate_rssi(node.position.distance(&dest.position), ptx, rng);
            let p_dl = calculate_rssi(gateways[src_gw].position.distance(&dest.position), plan.gw_tx_dbm, rng);
            match capture_outcome(cand.sf, p_dl, sel.sf, p_sel, full_collision) {
                PairOutcome::SelDestroyed | PairOutcome::BothDestroyed => suppression.mark_downlink(cand.id),
                PairOutcome::BothSurvive | PairOutcome::OtherDestroyed => {}
            }
        }
    }

    receptions
}

/// Evaluate a dispatched downlink at its destination device.
///
/// Interference sources are all same-channel overlapping transmissions:
/// uplinks of other devices and downlinks of other gateways. Returns the
/// reception RSSI when the frame survives.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_downlink(
    sel: &Transmission,
    frame: &DownlinkFrame,
    nodes: &[Node],
    gateways: &[Gateway],
    queues: &EventQueues,
    suppression: &mut Suppression,
    plan: &RegionPlan,
    full_collision: bool,
    rng: &mut StdRng,
) -> Option<f64> {
    if suppression.downlink_killed(sel.id) {
        return None;
    }
    let src_gw = match sel.kind {
        TxKind::Downlink { gw, .. } => gw,
        TxKind::Uplink { .. } => unreachable!("evaluate_downlink on an uplink"),
    };
    let dest = &nodes[frame.dest];
    let bw = plan.channels[sel.channel].bw_hz;
    let prx_sel = calculate_rssi(gateways[src_gw].position.distance(&dest.position), plan.gw_tx_dbm, rng);
    if prx_sel < sensitivity_dbm(sel.sf, bw) {
        return None;
    }

    let mut destroyed = false;
    for cand in queues.overlapping(sel.channel, sel.sta, sel.end, sel.id) {
        match cand.kind {
            TxKind::Uplink { node: other_idx, .. } => {
                let other = &nodes[other_idx];
                let prx_other = calculate_rssi(other.position.distance(&dest.position), plan.ptx_ladder_dbm[other.ptx_index], rng);
                match capture_outcome(sel.sf, prx_sel, cand.sf, prx_other, full_collision) {
                    PairOutcome::SelDestroyed | PairOutcome::BothDestroyed => destroyed = true,
                    PairOutcome::BothSurvive | PairOutcome::OtherDestroyed => {}
                }
            }
            TxKind::Downlink { gw: other_gw, frame: ref other_frame } => {
                let prx_other = calculate_rssi(gateways[other_gw].position.distance(&dest.position), plan.gw_tx_dbm, rng);
                match capture_outcome(sel.sf, prx_sel, cand.sf, prx_other, full_collision) {
                    PairOutcome::SelDestroyed | PairOutcome::BothDestroyed => destroyed = true,
                    PairOutcome::BothSurvive | PairOutcome::OtherDestroyed => {}
                }
                // The other downlink's fate is decided at its own
                // destination, with this transmission as the interferer.
                if !suppression.downlink_killed(cand.id) {
                    let other_dest = &nodes[other_frame.dest];
                    let p_sel_there = calculate_rssi(gateways[src_gw].position.distance(&other_dest.position), plan.gw_tx_dbm, rng);
                    let p_cand_there = calculate_rssi(gateways[other_gw].position.distance(&other_dest.position), plan.gw_tx_dbm, rng);
                    match capture_outcome(cand.sf, p_cand_there, sel.sf, p_sel_there, full_collision) {
                        PairOutcome::SelDestroyed | PairOutcome::BothDestroyed => suppression.mark_downlink(cand.id),
                        PairOutcome::BothSurvive | PairOutcome::OtherDestroyed => {}
                    }
                }
            }
        }
    }

    if destroyed {
        None
    } else {
        Some(prx_sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::FrequencyPlan;
    use crate::simulation::types::Position;
    use rand::SeedableRng;

    fn plan() -> RegionPlan {
        RegionPlan::new(FrequencyPlan::Eu868)
    }

    fn node_at(id: u32, x: f64, y: f64, sf: u8) -> Node {
        let mut n = Node::new(id, Position { x, y }, 4, 10.0);
        n.sf = sf;
        n.payload = 20;
        n
    }

    fn uplink(id: u64, node: usize, sta: f64, end: f64, channel: usize, sf: u8) -> Transmission {
        Transmission {
            id,
            sta,
            end,
            channel,
            sf,
            kind: TxKind::Uplink { node, seq: 1, attempt: 0 },
        }
    }

    #[test]
    fn co_sf_pair_within_window_destroys_both() {
        assert_eq!(capture_outcome(7, -90.0, 7, -90.5, false), PairOutcome::BothDestroyed);
        assert_eq!(capture_outcome(7, -90.0, 7, -91.0, true), PairOutcome::BothDestroyed);
    }

    #[test]
    fn co_sf_stronger_captures_outside_window() {
        assert_eq!(capture_outcome(7, -80.0, 7, -95.0, false), PairOutcome::OtherDestroyed);
        assert_eq!(capture_outcome(7, -95.0, 7, -80.0, false), PairOutcome::SelDestroyed);
    }

    #[test]
    fn different_sf_is_orthogonal_without_full_collision() {
        assert_eq!(capture_outcome(7, -120.0, 12, -60.0, false), PairOutcome::BothSurvive);
    }

    #[test]
    fn non_orthogonal_margins_are_asymmetric() {
        // SF7 needs -8 dB over SF8; SF8 needs -11 dB over SF7.
        assert_eq!(capture_outcome(7, -90.0, 8, -85.0, true), PairOutcome::BothSurvive);
        // SF7 at -10 dB below the interferer loses, SF8 still fine at +10.
        assert_eq!(capture_outcome(7, -95.0, 8, -85.0, true), PairOutcome::SelDestroyed);
        // SF7 well above the interferer, SF8 now short of its own margin.
        assert_eq!(capture_outcome(7, -75.0, 8, -90.0, true), PairOutcome::OtherDestroyed);
    }

    #[test]
    fn reception_below_sensitivity_is_suppressed() {
        let plan = plan();
        let nodes = vec![node_at(1, 0.0, 0.0, 7)];
        // 200 km away: mean prx ~ -163 dBm, hopeless for SF7 at -124 dBm.
        let mut gateways = vec![Gateway::new("A".into(), Position { x: 200_000.0, y: 0.0 })];
        let queues = EventQueues::new(plan.channels.len());
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(1);
        let sel = uplink(1, 0, 0.0, 0.06, 0, 7);
        let rx = evaluate_uplink(&sel, &nodes, &mut gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert!(rx.is_empty());
        assert!(gateways[0].active_lock(0).is_none());
    }

    #[test]
    fn clean_uplink_is_received_and_locks_the_channel() {
        let plan = plan();
        let nodes = vec![node_at(1, 0.0, 0.0, 7)];
        let mut gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        let queues = EventQueues::new(plan.channels.len());
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(2);
        let sel = uplink(1, 0, 10.0, 10.06, 0, 7);
        let rx = evaluate_uplink(&sel, &nodes, &mut gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].gw, 0);
        let lock = gateways[0].active_lock(0).expect("lock installed");
        assert!(lock.sta > 10.0 && lock.sta < 10.06);
        assert_eq!(lock.sf, 7);
    }

    #[test]
    fn transmitting_gateway_receives_nothing() {
        let plan = plan();
        let nodes = vec![node_at(1, 0.0, 0.0, 7)];
        let mut gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        gateways[0].schedule_downlink(0.0, 9.0, 11.0, 48, Some(99.0));
        let queues = EventQueues::new(plan.channels.len());
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(3);
        let sel = uplink(1, 0, 10.0, 10.06, 0, 7);
        let rx = evaluate_uplink(&sel, &nodes, &mut gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert!(rx.is_empty());
    }

    #[test]
    fn dominant_co_sf_transmission_marks_the_weaker_queued_one() {
        let plan = plan();
        // Node 0 sits next to the gateway, node 1 is 3 km out: a ~39 dB mean
        // power gap, far outside both the co-SF window and shadowing spread.
        let nodes = vec![node_at(1, 90.0, 90.0, 7), node_at(2, 3000.0, 100.0, 7)];
        let mut gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        let mut queues = EventQueues::new(plan.channels.len());
        let weaker = uplink(2, 1, 10.01, 10.07, 0, 7);
        queues.push(weaker);
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(4);
        let sel = uplink(1, 0, 10.0, 10.06, 0, 7);
        let rx = evaluate_uplink(&sel, &nodes, &mut gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert_eq!(rx.len(), 1, "the stronger transmission captures");
        assert!(sup.uplink_suppressed_at(2, 0), "the weaker one is destroyed at the gateway");
    }

    #[test]
    fn orthogonal_sfs_coexist_without_full_collision() {
        let plan = plan();
        let nodes = vec![node_at(1, 90.0, 90.0, 7), node_at(2, 110.0, 110.0, 9)];
        let mut gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        let mut queues = EventQueues::new(plan.channels.len());
        queues.push(uplink(2, 1, 10.01, 10.2, 0, 9));
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(5);
        let sel = uplink(1, 0, 10.0, 10.06, 0, 7);
        let rx = evaluate_uplink(&sel, &nodes, &mut gateways, &queues, &mut sup, &plan, false, &mut rng);
        assert_eq!(rx.len(), 1);
        assert!(!sup.uplink_suppressed_at(2, 0));
    }

    #[test]
    fn downlink_alone_reaches_its_destination() {
        let plan = plan();
        let nodes = vec![node_at(1, 0.0, 0.0, 7)];
        let gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        let queues = EventQueues::new(plan.channels.len());
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(6);
        let frame = DownlinkFrame {
            dest: 0,
            window: crate::simulation::types::RxWindow::Rx1,
            acks: true,
            seq: 1,
            new_ptx: None,
            payload: 13,
        };
        let sel = Transmission {
            id: 5,
            sta: 20.0,
            end: 20.06,
            channel: 0,
            sf: 7,
            kind: TxKind::Downlink { gw: 0, frame: frame.clone() },
        };
        let prx = evaluate_downlink(&sel, &frame, &nodes, &gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert!(prx.is_some());
    }

    #[test]
    fn downlink_dies_under_a_dominant_co_sf_uplink_at_the_destination() {
        let plan = plan();
        // The interfering device sits 7 m from the destination while the
        // answering gateway is ~990 m out: a ~29 dB gap at the destination,
        // far beyond any plausible shadowing swing.
        let nodes = vec![node_at(1, 0.0, 0.0, 12), node_at(2, 5.0, 5.0, 12)];
        let gateways = vec![Gateway::new("A".into(), Position { x: 700.0, y: 700.0 })];
        let mut queues = EventQueues::new(plan.channels.len());
        queues.push(uplink(6, 1, 30.0, 31.5, 3, 12));
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(6);
        let frame = DownlinkFrame {
            dest: 0,
            window: crate::simulation::types::RxWindow::Rx2,
            acks: true,
            seq: 1,
            new_ptx: None,
            payload: 13,
        };
        let sel = Transmission {
            id: 5,
            sta: 30.0,
            end: 31.5,
            channel: 3,
            sf: 12,
            kind: TxKind::Downlink { gw: 0, frame: frame.clone() },
        };
        let verdict = evaluate_downlink(&sel, &frame, &nodes, &gateways, &queues, &mut sup, &plan, true, &mut rng);
        assert!(verdict.is_none());
    }

    #[test]
    fn killed_downlink_fails_without_any_draw() {
        let plan = plan();
        let nodes = vec![node_at(1, 0.0, 0.0, 7)];
        let gateways = vec![Gateway::new("A".into(), Position { x: 100.0, y: 100.0 })];
        let queues = EventQueues::new(plan.channels.len());
        let mut sup = Suppression::new();
        let mut rng = StdRng::seed_from_u64(7);
        let frame = DownlinkFrame {
            dest: 0,
            window: crate::simulation::types::RxWindow::Rx2,
            acks: true,
            seq: 3,
            new_ptx: None,
            payload: 13,
        };
        let sel = Transmission {
            id: 9,
            sta: 30.0,
            end: 30.1,
            channel: 3,
            sf: 12,
            kind: TxKind::Downlink { gw: 0, frame: frame.clone() },
        };
        sup.mark_downlink(9);
        assert!(evaluate_downlink(&sel, &frame, &nodes, &gateways, &queues, &mut sup, &plan, true, &mut rng).is_none());
    }
}
