//! Simulation configuration loading.
//!
//! The tunable constants of a run live in an optional `config.toml` next to
//! the terrain file; every field has a documented default so a bare terrain
//! file is enough to simulate.

use serde::Deserialize;
use std::path::Path;

use crate::region::FrequencyPlan;

/// Gateway-selection policy for downlink planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Policy {
    /// First feasible gateway, uniform tie-break.
    #[serde(rename = "FCFS")]
    Fcfs,
    /// Highest uplink reception RSSI.
    #[serde(rename = "RSSI")]
    Rssi,
    /// Smallest per-band duty-cycle deadline (EU868 only).
    #[serde(rename = "LB")]
    Lb,
    /// RSSI with abstention for under-average no-gateway counts.
    #[serde(rename = "URCB")]
    Urcb,
    /// RSSI with abstention for above-average ack fairness.
    #[serde(rename = "FBS")]
    Fbs,
}

/// Distribution of per-device payload sizes when not fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketSizeDistr {
    Uniform,
    Normal,
}

/// All tunable constants of a simulation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Fraction of devices requiring acknowledgements (0..1).
    pub confirmed_perc: f64,
    /// Enable the non-orthogonal inter-SF capture model.
    pub full_collision: bool,
    /// Retry cap per confirmed packet.
    pub max_retr: u8,
    /// Periodic inter-arrival instead of exponential.
    pub fixed_packet_rate: bool,
    /// Give every device the same payload size.
    pub fixed_packet_size: bool,
    /// Payload size in bytes (exact when fixed, distribution centre otherwise).
    pub packet_size: usize,
    pub packet_size_distr: PacketSizeDistr,
    /// Adaptive data rate: transmit-power adjustment over downlinks.
    pub adr_on: bool,
    /// Duplicate every terrain gateway in place (second demodulation bank).
    pub double_gws: bool,
    pub policy: Policy,
    pub fplan: FrequencyPlan,
    /// RNG seed; derived from entropy when absent.
    pub seed: Option<u64>,
    /// Stop early once the moving packet-delivery ratio settles.
    pub auto_simtime: bool,
    /// Free-gateway fraction above which URCB/FBS abstain.
    pub abstain_free_threshold: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            confirmed_perc: 1.0,
            full_collision: true,
            max_retr: 8,
            fixed_packet_rate: false,
            fixed_packet_size: false,
            packet_size: 16,
            packet_size_distr: PacketSizeDistr::Uniform,
            adr_on: true,
            double_gws: false,
            policy: Policy::Rssi,
            fplan: FrequencyPlan::Eu868,
            seed: None,
            auto_simtime: false,
            abstain_free_threshold: 2.0 / 3.0,
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    ///
    /// # Returns
    /// * `Ok(SimConfig)` if the file was absent, or successfully loaded and valid
    /// * `Err(String)` with a descriptive error message otherwise
    pub fn load(config_path: &Path) -> Result<Self, String> {
        if !config_path.exists() {
            let cfg = SimConfig::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        let content = std::fs::read_to_string(config_path).map_err(|e| format!("Failed to read config file: {}", e))?;
        let cfg: SimConfig = toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Derive the config path from a terrain file path.
    ///
    /// Replaces the terrain filename with "config.toml" in the same directory.
    pub fn config_path_from_terrain(terrain_path: &str) -> std::path::PathBuf {
        let terrain = Path::new(terrain_path);
        terrain.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    /// Reject out-of-range values and inconsistent combinations.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confirmed_perc) {
            return Err(format!("confirmed_perc {} outside 0..1", self.confirmed_perc));
        }
        if self.max_retr == 0 {
            return Err("max_retr must be at least 1".to_string());
        }
        if self.packet_size == 0 || self.packet_size > 250 {
            return Err(format!("packet_size {} outside 1..250", self.packet_size));
        }
        if !(0.0..=1.0).contains(&self.abstain_free_threshold) {
            return Err(format!("abstain_free_threshold {} outside 0..1", self.abstain_free_threshold));
        }
        if self.policy == Policy::Lb && self.fplan == FrequencyPlan::Us915 {
            return Err("least-busy policy needs per-band duty-cycle deadlines, which US915 does not carry".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SimConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.policy, Policy::Rssi);
        assert_eq!(cfg.fplan, FrequencyPlan::Eu868);
        assert!((cfg.abstain_free_threshold - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn parses_a_full_config() {
        let cfg: SimConfig = toml::from_str(
            r#"
            confirmed_perc = 0.5
            full_collision = false
            max_retr = 1
            fixed_packet_rate = true
            fixed_packet_size = true
            packet_size = 51
            packet_size_distr = "normal"
            adr_on = false
            double_gws = true
            policy = "URCB"
            fplan = "US915"
            seed = 42
            auto_simtime = true
            abstain_free_threshold = 0.75
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_retr, 1);
        assert_eq!(cfg.policy, Policy::Urcb);
        assert_eq!(cfg.fplan, FrequencyPlan::Us915);
        assert_eq!(cfg.packet_size_distr, PacketSizeDistr::Normal);
        assert_eq!(cfg.seed, Some(42));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: SimConfig = toml::from_str("policy = \"FCFS\"\n").unwrap();
        assert_eq!(cfg.policy, Policy::Fcfs);
        assert_eq!(cfg.max_retr, 8);
        assert!(cfg.full_collision);
    }

    #[test]
    fn least_busy_under_us915_is_rejected() {
        let cfg: SimConfig = toml::from_str("policy = \"LB\"\nfplan = \"US915\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn range_violations_are_rejected() {
        let mut cfg = SimConfig::default();
        cfg.confirmed_perc = 1.5;
        assert!(cfg.validate().is_err());
        let mut cfg = SimConfig::default();
        cfg.max_retr = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = SimConfig::default();
        cfg.packet_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_path_sits_next_to_the_terrain_file() {
        let p = SimConfig::config_path_from_terrain("scenes/city/terrain.txt");
        assert_eq!(p, Path::new("scenes/city/config.toml"));
        let p = SimConfig::config_path_from_terrain("terrain.txt");
        assert_eq!(p, Path::new("config.toml"));
    }
}
