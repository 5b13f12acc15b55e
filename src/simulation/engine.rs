//! The discrete-event core: arenas, queues, the main loop and the uplink and
//! downlink handlers.
//!
//! One logical clock drives everything. Per iteration the loop pops the
//! earliest pending transmission across all channels, dispatches it to the
//! matching handler, and the handler pushes exactly one follow-up event per
//! device (the next attempt or the next unique uplink), so the queues never
//! drain before the horizon cuts the run.
//!
//! Randomness is funnelled through one seeded generator. Within an uplink
//! event the draw order is fixed: shadowing per gateway in gateway-id order,
//! then policy and delay draws, channel choice last; a seeded run is a pure
//! function of (seed, terrain, configuration).

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};

use crate::config::{PacketSizeDistr, SimConfig};
use crate::region::{RegionPlan, OVERHEAD_U, RECEIVE_DELAY2};
use crate::simulation::collision;
use crate::simulation::downlink;
use crate::simulation::energy::{EnergyModel, RxOutcome};
use crate::simulation::gateway::{gateway_letter_id, Gateway};
use crate::simulation::queue::EventQueues;
use crate::simulation::sf_assign::assign_sf;
use crate::simulation::signal::{noise_floor_dbm, preamble_time, AirtimeCalculator};
use crate::simulation::stats::{SimReport, Stats};
use crate::simulation::types::{DownlinkFrame, Node, NodeIdx, RxWindow, Suppression, Transmission, TxKind};
use crate::terrain::Terrain;

/// Run parameters from the command line.
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    pub packets_per_hour: f64,
    pub sim_hours: f64,
}

#[derive(Debug)]
pub struct Simulation {
    cfg: SimConfig,
    plan: RegionPlan,
    nodes: Vec<Node>,
    gateways: Vec<Gateway>,
    queues: EventQueues,
    suppression: Suppression,
    airtimes: AirtimeCalculator,
    energy: EnergyModel,
    rng: StdRng,
    stats: Stats,
    clock: f64,
    horizon: f64,
    next_tx_id: u64,
    /// Unique uplinks dispatched, for the moving-PDR window.
    unique_dispatched: u64,
    /// Unconfirmed uniques that reached a gateway, for the moving-PDR window.
    delivered_unconfirmed: u64,
    stop: bool,
}

impl Simulation {
    /// Build the arenas from the terrain, assign spreading factors, and
    /// schedule every device's first uplink.
    pub fn new(cfg: SimConfig, terrain: &Terrain, params: SimParams) -> Result<Self, String> {
        cfg.validate()?;
        if params.packets_per_hour <= 0.0 {
            return Err(format!("packets_per_hour must be positive, got {}", params.packets_per_hour));
        }
        if params.sim_hours < 0.0 {
            return Err(format!("simulation_time_hours must be non-negative, got {}", params.sim_hours));
        }

        let plan = RegionPlan::new(cfg.fplan);
        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut gateways: Vec<Gateway> = terrain.gateways.iter().map(|(id, pos)| Gateway::new(id.clone(), *pos)).collect();
        if cfg.double_gws {
            // A second demodulation bank per site, with the letter sequence
            // continuing past the terrain's ids.
            let existing = gateways.len();
            for i in 0..existing {
                let pos = gateways[i].position;
                gateways.push(Gateway::new(gateway_letter_id(existing + i), pos));
            }
        }

        let period_s = 3600.0 / params.packets_per_hour;
        let mut nodes = Vec::with_capacity(terrain.nodes.len());
        for (id, pos) in &terrain.nodes {
            let mut node = Node::new(*id, *pos, plan.ptx_max_index(), period_s);
            node.confirmed = rng.gen_bool(cfg.confirmed_perc);
            node.payload = draw_payload(&cfg, &mut rng);
            let assignment = assign_sf(*id, pos, plan.ptx_ladder_dbm[node.ptx_index], &gateways, &plan)?;
            node.sf = assignment.sf;
            node.reachable_rx2 = assignment.reachable_rx2;
            nodes.push(node);
        }
        info!(
            "initialised {} nodes and {} gateways on {} ({} confirmed)",
            nodes.len(),
            gateways.len(),
            plan.fplan,
            nodes.iter().filter(|n| n.confirmed).count()
        );

        let energy = EnergyModel::new(&plan);
        let queues = EventQueues::new(plan.channels.len());
        let mut sim = Simulation {
            cfg,
            plan,
            nodes,
            gateways,
            queues,
            suppression: Suppression::new(),
            airtimes: AirtimeCalculator::new(),
            energy,
            rng,
            stats: Stats::new(),
            clock: 0.0,
            horizon: params.sim_hours * 3600.0,
            next_tx_id: 0,
            unique_dispatched: 0,
            delivered_unconfirmed: 0,
            stop: false,
        };

        // Stagger the population: the first uplink of each device starts at
        // a uniform offset within one period (or one exponential draw).
        for ni in 0..sim.nodes.len() {
            sim.nodes[ni].fcnt_up = 1;
            let sta = if sim.cfg.fixed_packet_rate {
                sim.rng.gen_range(0.0..period_s)
            } else {
                Exp::new(1.0 / period_s).expect("positive rate").sample(&mut sim.rng)
            };
            sim.schedule_attempt(ni, sta);
        }

        Ok(sim)
    }

    /// Drive the event loop to the horizon (or the auto-stop) and build the
    /// final report.
    pub fn run(&mut self) -> SimReport {
        info!("simulation start: horizon {:.0} s, {} pending events", self.horizon, self.queues.len());
        while let Some(tx) = self.queues.pop_earliest() {
            if tx.sta >= self.horizon {
                self.clock = self.horizon;
                break;
            }
            self.clock = tx.sta;
            match tx.kind {
                TxKind::Uplink { node, seq, attempt } => self.handle_uplink(&tx, node, seq, attempt),
                TxKind::Downlink { gw, ref frame } => {
                    let frame = frame.clone();
                    self.handle_downlink(&tx, gw, &frame);
                }
            }
            if self.stop {
                break;
            }
        }
        info!("simulation end at t = {:.2} s", self.clock);
        SimReport::build(self.clock, &self.nodes, &self.gateways, &self.stats, &self.plan)
    }

    /// Uplink dispatch: duty-cycle bookkeeping, the collision engine, ADR
    /// sampling, downlink planning, and the follow-up event.
    fn handle_uplink(&mut self, tx: &Transmission, ni: NodeIdx, seq: u64, attempt: u8) {
        let airtime = tx.end - tx.sta;
        let band = self.plan.band_of(tx.channel);
        let up_bw = self.plan.channels[tx.channel].bw_hz;

        {
            let node = &mut self.nodes[ni];
            node.last_channel = Some(tx.channel);
            if attempt == 0 {
                node.unique += 1;
                node.cur_delivered = false;
                self.unique_dispatched += 1;
            } else {
                node.retransmissions += 1;
                self.stats.total_retx += 1;
            }
            self.stats.total_tx += 1;
            if let Some(mult) = self.plan.duty_multiplier(band) {
                node.ndc.insert(band, tx.end + mult * airtime);
            }
        }
        let sensing = self.energy.sensing_mj(self.nodes[ni].sf, up_bw);
        let tx_cost = self.energy.tx_mj(airtime, self.nodes[ni].ptx_index);
        self.nodes[ni].energy_mj += sensing + tx_cost;

        let receptions = collision::evaluate_uplink(
            tx,
            &self.nodes,
            &mut self.gateways,
            &self.queues,
            &mut self.suppression,
            &self.plan,
            self.cfg.full_collision,
            &mut self.rng,
        );
        self.suppression.forget(tx.id);

        let confirmed = self.nodes[ni].confirmed;
        if receptions.is_empty() {
            debug!("uplink node {} seq {} attempt {} reached no gateway", self.nodes[ni].id, seq, attempt);
            self.account_rx_windows(ni, RxOutcome::Nothing);
            if confirmed {
                self.retry_or_drop(ni, self.rx2_close(tx.end));
            } else {
                self.nodes[ni].dropped_unconfirmed += 1;
                self.stats.dropped_unconfirmed += 1;
                self.record_unique_resolution();
                self.schedule_next_unique(ni, tx.end);
            }
            return;
        }

        self.stats.total_received += 1;
        if !self.nodes[ni].cur_delivered {
            self.nodes[ni].cur_delivered = true;
            self.nodes[ni].delivered += 1;
        }

        let best_prx = receptions.iter().map(|r| r.prx_dbm).fold(f64::NEG_INFINITY, f64::max);
        self.nodes[ni].push_snr_sample(best_prx - noise_floor_dbm(up_bw));

        let adr_request = if self.cfg.adr_on {
            if let Some(new_index) = downlink::adr_power_step(&self.nodes[ni], &self.plan) {
                self.nodes[ni].pending_ptx = Some(new_index);
            }
            self.nodes[ni].pending_ptx
        } else {
            None
        };

        if !confirmed && adr_request.is_none() {
            self.account_rx_windows(ni, RxOutcome::Nothing);
            self.delivered_unconfirmed += 1;
            self.record_unique_resolution();
            self.schedule_next_unique(ni, tx.end);
            return;
        }

        let outcome = downlink::plan_downlink(
            tx,
            ni,
            &self.nodes,
            &receptions,
            &self.gateways,
            &self.plan,
            &mut self.airtimes,
            self.cfg.policy,
            self.cfg.abstain_free_threshold,
            adr_request.is_some(),
            &mut self.rng,
        );
        if outcome.rx1_unavailable {
            self.stats.no_rx1 += 1;
        }
        if outcome.rx2_unavailable {
            self.stats.no_rx1_rx2 += 1;
            self.nodes[ni].nogw += 1;
        }

        match outcome.plan {
            Some(dplan) => {
                let end = dplan.sta + dplan.airtime;
                self.gateways[dplan.gw].schedule_downlink(self.clock, dplan.sta, end, dplan.band, self.plan.duty_multiplier(dplan.band));
                let frame = DownlinkFrame {
                    dest: ni,
                    window: dplan.window,
                    acks: confirmed,
                    seq,
                    new_ptx: adr_request,
                    payload: dplan.payload,
                };
                let id = self.alloc_tx_id();
                self.queues.push(Transmission {
                    id,
                    sta: dplan.sta,
                    end,
                    channel: dplan.channel,
                    sf: dplan.sf,
                    kind: TxKind::Downlink { gw: dplan.gw, frame },
                });
                if !confirmed {
                    // Fire-and-forget traffic does not wait for the command.
                    self.delivered_unconfirmed += 1;
                    self.record_unique_resolution();
                    self.schedule_next_unique(ni, tx.end);
                }
            }
            None => {
                self.account_rx_windows(ni, RxOutcome::Nothing);
                if confirmed {
                    self.retry_or_drop(ni, self.rx2_close(tx.end));
                } else {
                    self.delivered_unconfirmed += 1;
                    self.record_unique_resolution();
                    self.schedule_next_unique(ni, tx.end);
                }
            }
        }
    }

    /// Downlink dispatch: the collision check at the destination device and
    /// the ack / retry / drop consequences.
    fn handle_downlink(&mut self, tx: &Transmission, gw: usize, frame: &DownlinkFrame) {
        let airtime = tx.end - tx.sta;
        let band = self.plan.band_of(tx.channel);
        self.gateways[gw].record_downlink(band, airtime);
        self.stats.downlink_time_s += airtime;

        let delivered = collision::evaluate_downlink(
            tx,
            frame,
            &self.nodes,
            &self.gateways,
            &self.queues,
            &mut self.suppression,
            &self.plan,
            self.cfg.full_collision,
            &mut self.rng,
        );
        self.suppression.forget(tx.id);

        let ni = frame.dest;
        let outcome = match (frame.window, delivered.is_some()) {
            (RxWindow::Rx1, true) => RxOutcome::ReceivedRx1 { airtime },
            (RxWindow::Rx2, true) => RxOutcome::ReceivedRx2 { airtime },
            (_, false) => RxOutcome::Nothing,
        };
        self.account_rx_windows(ni, outcome);

        if delivered.is_some() {
            if let Some(new_index) = frame.new_ptx {
                debug!("node {} ADR: power index {} -> {}", self.nodes[ni].id, self.nodes[ni].ptx_index, new_index);
                self.nodes[ni].ptx_index = new_index;
                self.nodes[ni].pending_ptx = None;
                self.nodes[ni].best_snr.clear();
            }
            if frame.acks {
                self.nodes[ni].acked += 1;
                self.nodes[ni].retr = 0;
                self.stats.acked += 1;
                self.record_unique_resolution();
                self.schedule_next_unique(ni, tx.end);
            }
        } else if frame.acks {
            let uplink_end = match frame.window {
                RxWindow::Rx1 => tx.sta - crate::region::RECEIVE_DELAY1,
                RxWindow::Rx2 => tx.sta - RECEIVE_DELAY2,
            };
            self.retry_or_drop(ni, self.rx2_close(uplink_end));
        }
    }

    /// Conclude a failed confirmed attempt: retry within the budget, or drop
    /// and start the next unique packet.
    fn retry_or_drop(&mut self, ni: NodeIdx, base_time: f64) {
        if self.nodes[ni].retr < self.cfg.max_retr {
            self.nodes[ni].retr += 1;
            let delay = 2.0 + self.rng.gen_range(0.0..3.0);
            self.schedule_attempt(ni, base_time + delay);
        } else {
            let node = &mut self.nodes[ni];
            node.retr = 0;
            node.dropped += 1;
            self.stats.dropped_confirmed += 1;
            self.record_unique_resolution();
            self.schedule_next_unique(ni, base_time);
        }
    }

    /// Start the next unique packet of a device.
    fn schedule_next_unique(&mut self, ni: NodeIdx, t_ref: f64) {
        {
            let node = &mut self.nodes[ni];
            node.fcnt_up += 1;
            node.retr = 0;
            node.cur_delivered = false;
        }
        let period = if self.cfg.fixed_packet_rate {
            self.nodes[ni].period_s
        } else {
            Exp::new(1.0 / self.nodes[ni].period_s).expect("positive rate").sample(&mut self.rng)
        };
        let jitter = self.rng.gen_range(0.0..1.0);
        self.schedule_attempt(ni, t_ref + period + jitter);
    }

    /// Push one uplink attempt: random channel excluding the previous one,
    /// start clamped by the band's duty-cycle deadline.
    fn schedule_attempt(&mut self, ni: NodeIdx, sta_candidate: f64) {
        let channel = self.pick_channel(ni);
        let band = self.plan.band_of(channel);
        let node = &self.nodes[ni];
        let sta = node.duty_clamp(band, sta_candidate);
        let airtime = self.airtimes.airtime(node.sf, self.plan.channels[channel].bw_hz, node.payload + OVERHEAD_U);
        let (sf, seq, attempt) = (node.sf, node.fcnt_up, node.retr);
        let id = self.alloc_tx_id();
        self.queues.push(Transmission {
            id,
            sta,
            end: sta + airtime,
            channel,
            sf,
            kind: TxKind::Uplink { node: ni, seq, attempt },
        });
    }

    /// Random uplink channel, excluding the one just used.
    fn pick_channel(&mut self, ni: NodeIdx) -> usize {
        let count = self.plan.uplink_count;
        match self.nodes[ni].last_channel {
            Some(last) if count > 1 && last < count => {
                let mut ch = self.rng.gen_range(0..count - 1);
                if ch >= last {
                    ch += 1;
                }
                ch
            }
            _ => self.rng.gen_range(0..count),
        }
    }

    /// When the RX2 window of an uplink ending at `uplink_end` closes for a
    /// device that heard no preamble.
    fn rx2_close(&self, uplink_end: f64) -> f64 {
        let rx2_bw = self.plan.channels[self.plan.rx2_index].bw_hz;
        uplink_end + RECEIVE_DELAY2 + preamble_time(self.plan.rx2_sf, rx2_bw)
    }

    fn account_rx_windows(&mut self, ni: NodeIdx, outcome: RxOutcome) {
        let rx2_bw = self.plan.channels[self.plan.rx2_index].bw_hz;
        let cost = self
            .energy
            .rx_windows_mj(outcome, self.nodes[ni].sf, self.plan.rx1_bw_hz, self.plan.rx2_sf, rx2_bw);
        self.nodes[ni].energy_mj += cost;
    }

    /// Update the moving packet-delivery ratio after a unique uplink
    /// resolved, and trip the auto-stop when it has settled.
    fn record_unique_resolution(&mut self) {
        if self.unique_dispatched == 0 {
            return;
        }
        let pdr = (self.stats.acked + self.delivered_unconfirmed) as f64 / self.unique_dispatched as f64;
        self.stats.push_pdr_sample(pdr);
        if self.cfg.auto_simtime && self.stats.pdr_settled() {
            info!("moving PDR settled at {:.5}, stopping early at t = {:.2} s", pdr, self.clock);
            self.stop = true;
        }
    }

    fn alloc_tx_id(&mut self) -> u64 {
        self.next_tx_id += 1;
        self.next_tx_id
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[cfg(test)]
    pub(crate) fn gateways_mut(&mut self) -> &mut [Gateway] {
        &mut self.gateways
    }
}

/// Per-device payload size at setup time.
fn draw_payload(cfg: &SimConfig, rng: &mut StdRng) -> usize {
    if cfg.fixed_packet_size {
        return cfg.packet_size;
    }
    match cfg.packet_size_distr {
        PacketSizeDistr::Uniform => {
            let low = (cfg.packet_size / 2).max(1);
            let high = (cfg.packet_size * 3 / 2).min(250).max(low);
            rng.gen_range(low..=high)
        }
        PacketSizeDistr::Normal => {
            let normal = Normal::new(cfg.packet_size as f64, cfg.packet_size as f64 / 4.0).expect("invalid normal sigma");
            (normal.sample(rng).round() as i64).clamp(1, 250) as usize
        }
    }
}
