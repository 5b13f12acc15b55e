//! Regional frequency plans and radio constant tables.
//!
//! Provides the EU868 and US915 channel layouts, the sub-band map with its
//! duty-cycle rules, transmit-power ladders with the matching radio current
//! draws, and the fixed LoRa tables: receiver sensitivity by (SF, BW),
//! demodulation-floor SNR by SF, and the inter-SF capture-threshold matrix.

use serde::Deserialize;
use std::fmt;

/// Spreading factors supported by the simulator.
pub const SF_MIN: u8 = 7;
pub const SF_MAX: u8 = 12;

/// MAC overhead added to every uplink payload (bytes).
pub const OVERHEAD_U: usize = 13;
/// MAC overhead of a downlink frame without options (bytes).
pub const OVERHEAD_D: usize = 13;
/// Extra downlink bytes when an ADR power request rides along.
pub const ADR_BYTES: usize = 4;

/// RX1 opens this long after the uplink ends (seconds).
pub const RECEIVE_DELAY1: f64 = 1.0;
/// RX2 opens this long after the uplink ends (seconds).
pub const RECEIVE_DELAY2: f64 = 2.0;

/// Regulatory sub-band of a carrier frequency.
///
/// The numeric values follow the ETSI sub-band numbering used for EU868
/// reporting: 48 is the 1% uplink band (868.0-868.6 MHz), 54 the 10%
/// downlink band (869.4-869.65 MHz). US915 carries no per-band duty cycle
/// and maps everything to `UNREGULATED`.
pub type Band = u8;

pub const BAND_EU_G1: Band = 48;
pub const BAND_EU_G4: Band = 54;
pub const BAND_UNREGULATED: Band = 0;

/// Selected regional frequency plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FrequencyPlan {
    #[serde(rename = "EU868")]
    Eu868,
    #[serde(rename = "US915")]
    Us915,
}

impl fmt::Display for FrequencyPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencyPlan::Eu868 => write!(f, "EU868"),
            FrequencyPlan::Us915 => write!(f, "US915"),
        }
    }
}

/// One carrier the engine can queue transmissions on.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    /// Carrier frequency in MHz.
    pub freq_mhz: f64,
    /// Regulatory sub-band the carrier falls into.
    pub band: Band,
    /// Channel bandwidth in Hz.
    pub bw_hz: u32,
}

/// Everything the engine needs to know about the selected region: the unified
/// channel table (uplink carriers first, then dedicated downlink carriers),
/// RX2 settings, the power ladder and its current draws, and duty-cycle rules.
#[derive(Debug)]
pub struct RegionPlan {
    pub fplan: FrequencyPlan,
    /// All carriers; indices `0..uplink_count` are uplink channels.
    pub channels: Vec<Channel>,
    /// Number of uplink carriers at the head of `channels`.
    pub uplink_count: usize,
    /// Index into `channels` of the RX2 carrier.
    pub rx2_index: usize,
    /// Spreading factor used on RX2.
    pub rx2_sf: u8,
    /// Bandwidth of RX1 downlinks in Hz.
    pub rx1_bw_hz: u32,
    /// Transmit-power ladder in dBm, ascending.
    pub ptx_ladder_dbm: &'static [f64],
    /// Radio TX current draw per ladder index (mA at 3.3 V).
    pub ptx_current_ma: &'static [f64],
    /// Gateway transmit power for downlinks (dBm).
    pub gw_tx_dbm: f64,
    /// Whether per-band duty cycles are enforced at all.
    pub duty_cycle_enforced: bool,
}

const EU868_PTX_DBM: [f64; 5] = [2.0, 5.0, 8.0, 11.0, 14.0];
const EU868_PTX_MA: [f64; 5] = [24.0, 25.0, 25.0, 32.0, 44.0];
const US915_PTX_DBM: [f64; 7] = [2.0, 5.0, 8.0, 11.0, 14.0, 17.0, 20.0];
const US915_PTX_MA: [f64; 7] = [24.0, 25.0, 25.0, 32.0, 44.0, 90.0, 125.0];

impl RegionPlan {
    pub fn new(fplan: FrequencyPlan) -> Self {
        match fplan {
            FrequencyPlan::Eu868 => {
                let mut channels: Vec<Channel> = [868.1, 868.3, 868.5]
                    .iter()
                    .map(|&f| Channel {
                        freq_mhz: f,
                        band: BAND_EU_G1,
                        bw_hz: 125_000,
                    })
                    .collect();
                channels.push(Channel {
                    freq_mhz: 869.525,
                    band: BAND_EU_G4,
                    bw_hz: 125_000,
                });
                RegionPlan {
                    fplan,
                    uplink_count: 3,
                    rx2_index: 3,
                    rx2_sf: 12,
                    rx1_bw_hz: 125_000,
                    channels,
                    ptx_ladder_dbm: &EU868_PTX_DBM,
                    ptx_current_ma: &EU868_PTX_MA,
                    gw_tx_dbm: 14.0,
                    duty_cycle_enforced: true,
                }
            }
            FrequencyPlan::Us915 => {
                let mut channels: Vec<Channel> = (0..64)
                    .map(|k| Channel {
                        freq_mhz: 902.3 + 0.2 * k as f64,
                        band: BAND_UNREGULATED,
                        bw_hz: 125_000,
                    })
                    .collect();
                // Eight 500 kHz downlink carriers: 923.3 + 0.6*i MHz.
                for i in 0..8 {
                    channels.push(Channel {
                        freq_mhz: 923.3 + 0.6 * i as f64,
                        band: BAND_UNREGULATED,
                        bw_hz: 500_000,
                    });
                }
                RegionPlan {
                    fplan,
                    uplink_count: 64,
                    rx2_index: 64,
                    rx2_sf: 12,
                    rx1_bw_hz: 500_000,
                    channels,
                    ptx_ladder_dbm: &US915_PTX_DBM,
                    ptx_current_ma: &US915_PTX_MA,
                    gw_tx_dbm: 27.0,
                    duty_cycle_enforced: false,
                }
            }
        }
    }

    /// Uplink bandwidth in Hz (both regions use 125 kHz uplinks here).
    pub fn uplink_bw_hz(&self) -> u32 {
        125_000
    }

    /// Band of a channel by index.
    pub fn band_of(&self, channel: usize) -> Band {
        self.channels[channel].band
    }

    /// RX1 downlink channel for a given uplink channel.
    ///
    /// EU868 answers on the uplink carrier itself; US915 maps the uplink
    /// index onto the eight dedicated downlink carriers.
    pub fn rx1_channel(&self, uplink_channel: usize) -> usize {
        match self.fplan {
            FrequencyPlan::Eu868 => uplink_channel,
            FrequencyPlan::Us915 => self.uplink_count + uplink_channel % 8,
        }
    }

    /// Duty-cycle deadline multiplier for a band: 99 on 1% bands, 9 on the
    /// 10% band, none where no duty cycle applies.
    pub fn duty_multiplier(&self, band: Band) -> Option<f64> {
        if !self.duty_cycle_enforced {
            return None;
        }
        match band {
            BAND_EU_G1 => Some(99.0),
            BAND_EU_G4 => Some(9.0),
            _ => None,
        }
    }

    /// Allowed airtime fraction of a band, for reporting.
    pub fn duty_fraction(&self, band: Band) -> Option<f64> {
        self.duty_multiplier(band).map(|m| 1.0 / (m + 1.0))
    }

    /// Highest transmit-power ladder index.
    pub fn ptx_max_index(&self) -> usize {
        self.ptx_ladder_dbm.len() - 1
    }
}

/// Receiver sensitivity in dBm by spreading factor and bandwidth.
///
/// Rows are SF7..SF12; columns are 125/250/500 kHz.
const SENSITIVITY_DBM: [[f64; 3]; 6] = [
    [-124.0, -122.0, -116.0],
    [-127.0, -125.0, -119.0],
    [-130.0, -128.0, -122.0],
    [-133.0, -130.0, -125.0],
    [-135.0, -132.0, -128.0],
    [-137.0, -135.0, -129.0],
];

pub fn sensitivity_dbm(sf: u8, bw_hz: u32) -> f64 {
    debug_assert!((SF_MIN..=SF_MAX).contains(&sf));
    let col = match bw_hz {
        125_000 => 0,
        250_000 => 1,
        _ => 2,
    };
    SENSITIVITY_DBM[(sf - SF_MIN) as usize][col]
}

/// Demodulation-floor SNR in dB required per spreading factor.
pub fn required_snr_db(sf: u8) -> f64 {
    match sf {
        7 => -7.5,
        8 => -10.0,
        9 => -12.5,
        10 => -15.0,
        11 => -17.5,
        _ => -20.0,
    }
}

/// Capture-threshold matrix in dB, indexed `[sf_sel - 7][sf_other - 7]`.
///
/// Off-diagonal entries are the power margin the selected transmission needs
/// over a non-orthogonal interferer at the other SF. The diagonal sentinel of
/// 1 dB is the co-SF window: two same-SF transmissions within 1 dB of each
/// other destroy one another, otherwise the stronger captures.
const CAPTURE_THRESHOLDS_DB: [[f64; 6]; 6] = [
    [1.0, -8.0, -9.0, -9.0, -9.0, -9.0],
    [-11.0, 1.0, -11.0, -12.0, -13.0, -13.0],
    [-15.0, -13.0, 1.0, -13.0, -14.0, -15.0],
    [-19.0, -18.0, -17.0, 1.0, -17.0, -18.0],
    [-22.0, -22.0, -21.0, -20.0, 1.0, -20.0],
    [-25.0, -25.0, -25.0, -24.0, -23.0, 1.0],
];

pub fn capture_threshold_db(sf_sel: u8, sf_other: u8) -> f64 {
    CAPTURE_THRESHOLDS_DB[(sf_sel - SF_MIN) as usize][(sf_other - SF_MIN) as usize]
}

/// Radio receive current draw (mA at 3.3 V).
pub const RX_CURRENT_MA: f64 = 11.5;
/// MCU idle current draw (mA at 3.3 V).
pub const IDLE_CURRENT_MA: f64 = 1.5;
/// Supply voltage for all current-to-power conversions.
pub const SUPPLY_V: f64 = 3.3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_table_corners() {
        assert_eq!(sensitivity_dbm(7, 125_000), -124.0);
        assert_eq!(sensitivity_dbm(12, 125_000), -137.0);
        assert_eq!(sensitivity_dbm(12, 500_000), -129.0);
    }

    #[test]
    fn capture_matrix_diagonal_is_sentinel() {
        for sf in SF_MIN..=SF_MAX {
            assert_eq!(capture_threshold_db(sf, sf), 1.0);
        }
        // Off-diagonal margins are negative: a weaker signal can still
        // survive an interferer at another SF.
        assert_eq!(capture_threshold_db(7, 8), -8.0);
        assert_eq!(capture_threshold_db(12, 7), -25.0);
    }

    #[test]
    fn eu868_plan_layout() {
        let plan = RegionPlan::new(FrequencyPlan::Eu868);
        assert_eq!(plan.uplink_count, 3);
        assert_eq!(plan.channels.len(), 4);
        assert_eq!(plan.rx1_channel(1), 1);
        assert_eq!(plan.channels[plan.rx2_index].freq_mhz, 869.525);
        assert_eq!(plan.band_of(0), BAND_EU_G1);
        assert_eq!(plan.band_of(3), BAND_EU_G4);
        assert_eq!(plan.duty_multiplier(BAND_EU_G1), Some(99.0));
        assert_eq!(plan.duty_multiplier(BAND_EU_G4), Some(9.0));
    }

    #[test]
    fn us915_rx1_channel_mapping() {
        let plan = RegionPlan::new(FrequencyPlan::Us915);
        // 903.9 MHz is uplink index 8, which answers on channels_d[0] = 923.3 MHz.
        let up = plan.channels.iter().position(|c| (c.freq_mhz - 903.9).abs() < 1e-9).unwrap();
        assert_eq!(up, 8);
        let down = plan.rx1_channel(up);
        assert_eq!(plan.channels[down].freq_mhz, 923.3);
        assert_eq!(plan.channels[down].bw_hz, 500_000);
        assert!(plan.duty_multiplier(BAND_UNREGULATED).is_none());
    }

    #[test]
    fn required_snr_matches_demodulation_floors() {
        for (sf, expect) in [(7, -7.5), (8, -10.0), (9, -12.5), (10, -15.0), (11, -17.5), (12, -20.0)] {
            assert!((required_snr_db(sf) - expect).abs() < f64::EPSILON);
        }
    }
}
