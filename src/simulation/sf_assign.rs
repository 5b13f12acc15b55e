//! Initial spreading-factor assignment.
//!
//! Each device gets the smallest SF whose mean link budget (shadowing at its
//! mean of zero) clears the receiver sensitivity by the design margin at its
//! best gateway. A device that cannot reach any gateway even at SF12 aborts
//! the run. The same walk records which gateways could deliver an RX2
//! downlink to the device; the downlink planner broadens its candidate set
//! with this cache when the device's uplink SF is below the RX2 SF.

use crate::region::{sensitivity_dbm, RegionPlan, SF_MAX, SF_MIN};
use crate::simulation::gateway::Gateway;
use crate::simulation::signal::{calculate_mean_rssi, SNR_MARGIN_DB};
use crate::simulation::types::{GwIdx, Position};

/// Result of the assignment walk for one device.
#[derive(Debug, Clone)]
pub struct SfAssignment {
    pub sf: u8,
    /// Gateways whose RX2 downlink would reach the device with margin.
    pub reachable_rx2: Vec<GwIdx>,
}

/// Pick the minimum workable SF for a device at `position` transmitting at
/// `ptx_dbm`, or fail with "node unreachable".
pub fn assign_sf(node_id: u32, position: &Position, ptx_dbm: f64, gateways: &[Gateway], plan: &RegionPlan) -> Result<SfAssignment, String> {
    let up_bw = plan.uplink_bw_hz();
    let rx2_bw = plan.channels[plan.rx2_index].bw_hz;

    let mut sf = None;
    'walk: for candidate in SF_MIN..=SF_MAX {
        for gw in gateways {
            let prx = calculate_mean_rssi(position.distance(&gw.position), ptx_dbm);
            if prx >= sensitivity_dbm(candidate, up_bw) + SNR_MARGIN_DB {
                sf = Some(candidate);
                break 'walk;
            }
        }
    }
    let sf = sf.ok_or_else(|| format!("node {} unreachable: no SF up to {} reaches any gateway with {} dB margin", node_id, SF_MAX, SNR_MARGIN_DB))?;

    // Downlink reachability at the RX2 data rate, from the gateway's side.
    let reachable_rx2 = gateways
        .iter()
        .enumerate()
        .filter(|(_, gw)| {
            let prx = calculate_mean_rssi(position.distance(&gw.position), plan.gw_tx_dbm);
            prx >= sensitivity_dbm(plan.rx2_sf, rx2_bw) + SNR_MARGIN_DB
        })
        .map(|(i, _)| i)
        .collect();

    Ok(SfAssignment { sf, reachable_rx2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::FrequencyPlan;

    fn gw_at(x: f64, y: f64) -> Gateway {
        Gateway::new("A".to_string(), Position { x, y })
    }

    #[test]
    fn close_node_gets_the_minimum_sf() {
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        let gateways = vec![gw_at(100.0, 100.0)];
        let a = assign_sf(1, &Position { x: 0.0, y: 0.0 }, 14.0, &gateways, &plan).unwrap();
        assert_eq!(a.sf, 7);
        assert_eq!(a.reachable_rx2, vec![0]);
    }

    #[test]
    fn sf_grows_with_distance() {
        // SF7 at 14 dBm runs out around 510 m; 600 m needs SF8.
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        let gateways = vec![gw_at(600.0, 0.0)];
        let a = assign_sf(1, &Position { x: 0.0, y: 0.0 }, 14.0, &gateways, &plan).unwrap();
        assert_eq!(a.sf, 8);
    }

    #[test]
    fn best_gateway_wins() {
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        let gateways = vec![gw_at(5000.0, 0.0), gw_at(200.0, 0.0)];
        let a = assign_sf(1, &Position { x: 0.0, y: 0.0 }, 14.0, &gateways, &plan).unwrap();
        assert_eq!(a.sf, 7);
        // Only the near gateway can deliver RX2 either.
        assert_eq!(a.reachable_rx2, vec![1]);
    }

    #[test]
    fn hopeless_node_aborts_the_run() {
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        let gateways = vec![gw_at(50_000.0, 0.0)];
        let err = assign_sf(42, &Position { x: 0.0, y: 0.0 }, 14.0, &gateways, &plan).unwrap_err();
        assert!(err.contains("node 42 unreachable"));
    }

    #[test]
    fn assignment_is_minimal_among_reachable_sfs() {
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        for d in [100.0, 450.0, 650.0, 900.0, 1200.0, 2000.0] {
            let gateways = vec![gw_at(d, 0.0)];
            let a = assign_sf(1, &Position { x: 0.0, y: 0.0 }, 14.0, &gateways, &plan).unwrap();
            // The assigned SF reaches...
            let prx = calculate_mean_rssi(d, 14.0);
            assert!(prx >= sensitivity_dbm(a.sf, 125_000) + SNR_MARGIN_DB);
            // ...and no smaller SF does.
            if a.sf > SF_MIN {
                assert!(prx < sensitivity_dbm(a.sf - 1, 125_000) + SNR_MARGIN_DB);
            }
        }
    }
}
