//! # LoRaWAN Simulator - Main Entry Point
//!
//! Command-line front end for the discrete-event LoRaWAN network simulator.
//!
//! ## Usage
//!
//! ```text
//! lorawan-sim <packets_per_hour> <simulation_time_hours> <terrain_file>
//! ```
//!
//! The terrain file provides the node and gateway population; an optional
//! `config.toml` in the same directory tunes the run (region plan, policy,
//! confirmed fraction, ADR, seed, ...). The aggregate report is written to
//! stdout. The process exits non-zero on unreadable inputs, invalid
//! arguments, inconsistent configuration, or a physically unreachable node.
//!
//! ## Architecture Overview
//!
//! Everything after argument parsing is the single-threaded engine in
//! `simulation::engine`: one logical clock, per-channel event queues, and a
//! pure function of (seed, terrain, configuration) producing the statistics
//! report.

use anyhow::{anyhow, Context};
use env_logger::Builder;
use log::{error, info, LevelFilter};

mod config;
mod region;
mod simulation;
mod terrain;

use config::SimConfig;
use simulation::{SimParams, Simulation};

fn main() {
    // Initialize logging subsystem with appropriate filter levels
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("lorawan_sim"), LevelFilter::Debug)
        .init();

    if let Err(err) = run() {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        return Err(anyhow!("usage: lorawan-sim <packets_per_hour> <simulation_time_hours> <terrain_file>"));
    }
    let packets_per_hour: f64 = args[0].parse().with_context(|| format!("invalid packets_per_hour '{}'", args[0]))?;
    let sim_hours: f64 = args[1].parse().with_context(|| format!("invalid simulation_time_hours '{}'", args[1]))?;
    let terrain_path = &args[2];

    let terrain = terrain::load_terrain(terrain_path)?;
    info!(
        "terrain {}: {:.1} m side, {} nodes, {} gateways",
        terrain_path,
        terrain.side_m,
        terrain.nodes.len(),
        terrain.gateways.len()
    );

    let config_path = SimConfig::config_path_from_terrain(terrain_path);
    let cfg = SimConfig::load(&config_path).map_err(|e| anyhow!(e)).with_context(|| format!("loading {}", config_path.display()))?;

    let params = SimParams { packets_per_hour, sim_hours };
    let mut sim = Simulation::new(cfg, &terrain, params).map_err(|e| anyhow!(e))?;
    let report = sim.run();
    print!("{}", report);
    Ok(())
}
