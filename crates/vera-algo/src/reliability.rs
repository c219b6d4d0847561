//! Sequential Monte-Carlo reliability simulation.
//!
//! Component up/down histories are sampled from the two-state Markov model:
//! alternating exponential sojourns with means MTTF (up) and MTTR (down),
//! discretized to whole hours over the study horizon. Each sample is an
//! independent draw; the per-driver PRNG is explicit and seeded from the
//! options, so runs reproduce exactly.
//!
//! Two evaluation modes:
//! - **GenerationAdequacy**: each sampled availability history feeds a
//!   greedy merit-order dispatch (cost-sorted generators, batteries with
//!   state-of-charge bookkeeping); the shortfall integrates into LOLE/ENS.
//! - **GridMetrics**: branch and generator states reshape the island
//!   partition; islands left without a source lose their whole demand for
//!   the duration of the failure block.
//!
//! Common indicators, for reference:
//! ```text
//!   LOLE  = expected energy not supplied per year (MWh/yr)
//!   ENS   = energy not supplied of one sample (MWh)
//!   LOLF  = expected count of loss-of-load events per year
//!   ASAI  = (8760 − SAIDI) / 8760
//! ```

use crate::compiler::{compile_numerical_circuit_at, NumericalCircuit};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use vera_core::{DriverHarness, MultiCircuit, Profile, VgError, VgResult};

/// Evaluation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReliabilityMode {
    /// Generation vs demand with greedy dispatch
    GenerationAdequacy,
    /// Island-aware evaluation with sampled branch outages
    GridMetrics,
}

/// Immutable reliability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityOptions {
    pub mode: ReliabilityMode,
    pub n_samples: usize,
    /// Study horizon in hours
    pub horizon_hours: usize,
    /// PRNG seed; identical seeds reproduce identical samples
    pub seed: u64,
    pub initially_working: bool,
    /// Early stop when the running LOLE mean stabilizes within this
    /// relative tolerance (checked between sample chunks)
    pub early_stop_tol: Option<f64>,
}

impl Default for ReliabilityOptions {
    fn default() -> Self {
        Self {
            mode: ReliabilityMode::GenerationAdequacy,
            n_samples: 100,
            horizon_hours: 8760,
            seed: 42,
            initially_working: true,
            early_stop_tol: None,
        }
    }
}

/// Compose one alternating up/down history (1 h resolution).
/// Returns the availability bit-vector and the number of failures.
pub fn compose_states(
    rng: &mut StdRng,
    mttf: f64,
    mttr: f64,
    horizon: usize,
    initially_working: bool,
) -> (Vec<bool>, usize) {
    // no failure statistics means the component never fails
    if mttf <= 0.0 || mttr <= 0.0 {
        return (vec![true; horizon], 0);
    }

    let mut active = vec![false; horizon];
    let mut n_failures = 0usize;
    let mut up = initially_working;
    let mut a = 0usize;

    while a < horizon {
        let mean = if up { mttf } else { mttr };
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let duration = ((-mean * u.ln()) as usize).max(1);
        let b = (a + duration).min(horizon);
        for slot in active.iter_mut().take(b).skip(a) {
            *slot = up;
        }
        if up && b < horizon {
            n_failures += 1;
        }
        up = !up;
        a = b;
    }

    (active, n_failures)
}

/// Sample one history per component. Row `k` of the result is component
/// `k`'s availability.
pub fn generate_states_matrix(
    rng: &mut StdRng,
    mttf: &[f64],
    mttr: &[f64],
    horizon: usize,
    initially_working: bool,
) -> (Vec<Vec<bool>>, usize) {
    assert_eq!(mttf.len(), mttr.len());
    let mut states = Vec::with_capacity(mttf.len());
    let mut n_failures = 0;
    for k in 0..mttf.len() {
        let (s, n) = compose_states(rng, mttf[k], mttr[k], horizon, initially_working);
        states.push(s);
        n_failures += n;
    }
    (states, n_failures)
}

/// Contiguous runs of time indices during which at least one component is
/// down. Each run is one outage event for downstream analysis.
pub fn find_time_blocks(states: &[Vec<bool>], horizon: usize) -> Vec<Vec<usize>> {
    let mut blocks = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    for t in 0..horizon {
        let any_down = states.iter().any(|row| !row[t]);
        if any_down {
            current.push(t);
        } else if !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Outcome of one greedy dispatch pass.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Energy not supplied per time step (MWh)
    pub unserved: Vec<f64>,
    pub total_cost: f64,
    /// Surplus non-dispatchable energy that had to be spilled (MWh)
    pub curtailment: f64,
}

struct DispatchGen {
    cost: f64,
    dispatchable: bool,
}

struct DispatchBattery {
    pmax: f64,
    enom: f64,
    soc_min: f64,
    eff_charge: f64,
    eff_discharge: f64,
    energy: f64,
}

/// Merit-order dispatch across the horizon. `gen_avail[g][t]` is the
/// available output cap of generator `g` at hour `t` (already masked by the
/// sampled availability).
fn greedy_dispatch(
    load: &[f64],
    gens: &[DispatchGen],
    gen_avail: &[Vec<f64>],
    batteries: &mut [DispatchBattery],
    dt_h: f64,
) -> DispatchOutcome {
    let horizon = load.len();
    let mut unserved = vec![0.0; horizon];
    let mut total_cost = 0.0;
    let mut curtailment = 0.0;

    // must-run units first, then dispatchable units by ascending cost
    let mut order: Vec<usize> = (0..gens.len()).collect();
    order.sort_by(|&a, &b| {
        gens[a]
            .dispatchable
            .cmp(&gens[b].dispatchable)
            .then(gens[a].cost.total_cmp(&gens[b].cost))
    });

    for t in 0..horizon {
        let mut remaining = load[t];
        let mut surplus = 0.0;

        for &g in &order {
            let cap = gen_avail[g][t];
            if cap <= 0.0 {
                continue;
            }
            if gens[g].dispatchable {
                let p = cap.min(remaining.max(0.0));
                remaining -= p;
                total_cost += p * gens[g].cost * dt_h;
            } else {
                // must-run: everything beyond the demand becomes surplus
                let p = cap;
                if p > remaining {
                    surplus += p - remaining.max(0.0);
                    remaining = remaining.min(0.0);
                } else {
                    remaining -= p;
                }
            }
        }

        // batteries discharge against the deficit
        if remaining > 1e-9 {
            for bat in batteries.iter_mut() {
                let e_avail = (bat.energy - bat.soc_min * bat.enom).max(0.0);
                let p_max_energy = e_avail * bat.eff_discharge / dt_h;
                let p = bat.pmax.min(p_max_energy).min(remaining);
                if p > 0.0 {
                    bat.energy -= p * dt_h / bat.eff_discharge;
                    remaining -= p;
                }
            }
        }

        // surplus charges the batteries, leftover is curtailed
        if surplus > 1e-9 {
            for bat in batteries.iter_mut() {
                let room = (bat.enom - bat.energy).max(0.0);
                let p_max_room = room / (bat.eff_charge * dt_h);
                let p = bat.pmax.min(p_max_room).min(surplus);
                if p > 0.0 {
                    bat.energy += p * dt_h * bat.eff_charge;
                    surplus -= p;
                }
            }
            curtailment += surplus * dt_h;
        }

        if remaining > 1e-9 {
            unserved[t] = remaining * dt_h;
        }
    }

    DispatchOutcome {
        unserved,
        total_cost,
        curtailment,
    }
}

/// Aggregated Monte-Carlo results.
#[derive(Debug, Clone)]
pub struct ReliabilityResults {
    /// Energy not supplied per sample (MWh over the horizon)
    pub ens_per_sample: Vec<f64>,
    /// Loss-of-load events per sample
    pub lolf_per_sample: Vec<usize>,
    pub cost_per_sample: Vec<f64>,
    pub curtailment_per_sample: Vec<f64>,
    /// Running mean of ENS after each sample
    pub running_mean: Vec<f64>,
    /// Expected energy not supplied, scaled to one year (MWh/yr)
    pub lole_mwh_per_year: f64,
    pub samples_run: usize,
    pub stopped_early: bool,
    pub cancelled: bool,
}

impl ReliabilityResults {
    fn finalize(&mut self, horizon_hours: usize) {
        let n = self.ens_per_sample.len().max(1);
        let mean_ens: f64 = self.ens_per_sample.iter().sum::<f64>() / n as f64;
        let scale = 8760.0 / horizon_hours.max(1) as f64;
        self.lole_mwh_per_year = mean_ens * scale;
        self.samples_run = self.ens_per_sample.len();
    }

    /// Empirical availability of one sampled history.
    pub fn availability_of(states: &[bool]) -> f64 {
        if states.is_empty() {
            return 1.0;
        }
        states.iter().filter(|&&s| s).count() as f64 / states.len() as f64
    }
}

/// Monte-Carlo reliability driver.
pub struct ReliabilityDriver<'a> {
    pub grid: &'a MultiCircuit,
    pub options: ReliabilityOptions,
    pub harness: DriverHarness,
    pub results: Option<ReliabilityResults>,
}

impl<'a> ReliabilityDriver<'a> {
    pub fn new(grid: &'a MultiCircuit, options: ReliabilityOptions) -> Self {
        Self {
            grid,
            options,
            harness: DriverHarness::new(),
            results: None,
        }
    }

    /// Per-sample RNG stream derived from the driver seed.
    fn sample_rng(&self, sample_idx: usize) -> StdRng {
        StdRng::seed_from_u64(
            self.options
                .seed
                .wrapping_add((sample_idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        )
    }

    /// Aggregate hourly demand over the horizon (profiles when they cover
    /// it, snapshot values otherwise).
    fn hourly_load(&self, horizon: usize) -> Vec<f64> {
        (0..horizon)
            .map(|t| {
                self.grid
                    .loads
                    .iter()
                    .filter(|l| l.active)
                    .map(|l| match &l.p_prof {
                        Some(p) if t < p.len() => p.get(t),
                        _ => l.p.value(),
                    })
                    .sum()
            })
            .collect()
    }

    pub fn run(&mut self) -> VgResult<()> {
        let nc = compile_numerical_circuit_at(self.grid, None)?;
        let horizon = self.options.horizon_hours;
        if horizon == 0 {
            return Err(VgError::MalformedGrid("zero reliability horizon".into()));
        }

        let mut results = ReliabilityResults {
            ens_per_sample: Vec::new(),
            lolf_per_sample: Vec::new(),
            cost_per_sample: Vec::new(),
            curtailment_per_sample: Vec::new(),
            running_mean: Vec::new(),
            lole_mwh_per_year: 0.0,
            samples_run: 0,
            stopped_early: false,
            cancelled: false,
        };

        let load = self.hourly_load(horizon);

        for sample_idx in 0..self.options.n_samples {
            if self.harness.is_cancelled() {
                results.cancelled = true;
                break;
            }
            let mut rng = self.sample_rng(sample_idx);

            let (ens, lolf, cost, curtail) = match self.options.mode {
                ReliabilityMode::GenerationAdequacy => {
                    self.run_adequacy_sample(&nc, &load, horizon, &mut rng)
                }
                ReliabilityMode::GridMetrics => {
                    self.run_grid_sample(&nc, &load, horizon, &mut rng)
                }
            };

            results.ens_per_sample.push(ens);
            results.lolf_per_sample.push(lolf);
            results.cost_per_sample.push(cost);
            results.curtailment_per_sample.push(curtail);
            let n = results.ens_per_sample.len();
            let mean = results.ens_per_sample.iter().sum::<f64>() / n as f64;
            results.running_mean.push(mean);

            self.harness
                .report_progress(sample_idx + 1, self.options.n_samples);

            // convergence of the running mean
            if let Some(tol) = self.options.early_stop_tol {
                let window = 10;
                if n > window {
                    let prev = results.running_mean[n - 1 - window];
                    let denom = mean.abs().max(1e-9);
                    if ((mean - prev) / denom).abs() < tol {
                        results.stopped_early = true;
                        self.harness.report_text(&format!(
                            "running mean stabilized after {n} samples"
                        ));
                        break;
                    }
                }
            }
        }

        results.finalize(horizon);
        self.results = Some(results);
        Ok(())
    }

    /// One GenerationAdequacy sample: availability-masked merit order.
    fn run_adequacy_sample(
        &self,
        nc: &NumericalCircuit,
        load: &[f64],
        horizon: usize,
        rng: &mut StdRng,
    ) -> (f64, usize, f64, f64) {
        let g = &nc.generator_data;
        let ngen = g.len();

        // dispatch runs even on failure-free samples so costs stay comparable
        let (states, _n_failures) = generate_states_matrix(
            rng,
            &g.mttf,
            &g.mttr,
            horizon,
            self.options.initially_working,
        );

        let gens: Vec<DispatchGen> = (0..ngen)
            .map(|i| DispatchGen {
                cost: g.cost[i],
                dispatchable: g.dispatchable[i],
            })
            .collect();
        let gen_avail: Vec<Vec<f64>> = (0..ngen)
            .map(|i| {
                (0..horizon)
                    .map(|t| {
                        if g.active[i] && states[i][t] {
                            if g.dispatchable[i] {
                                g.pmax[i].min(g.snom[i])
                            } else {
                                g.p[i]
                            }
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();

        let b = &nc.battery_data;
        let mut batteries: Vec<DispatchBattery> = (0..b.len())
            .filter(|&i| b.active[i])
            .map(|i| DispatchBattery {
                pmax: b.pmax[i],
                enom: b.enom[i],
                soc_min: b.soc_min[i],
                eff_charge: b.eff_charge[i],
                eff_discharge: b.eff_discharge[i],
                energy: b.soc0[i] * b.enom[i],
            })
            .collect();

        let outcome = greedy_dispatch(load, &gens, &gen_avail, &mut batteries, 1.0);
        let ens: f64 = outcome.unserved.iter().sum();

        // loss-of-load events: contiguous shortfall runs
        let mut lolf = 0usize;
        let mut in_event = false;
        for &u in &outcome.unserved {
            if u > 0.0 && !in_event {
                lolf += 1;
                in_event = true;
            } else if u == 0.0 {
                in_event = false;
            }
        }

        (ens, lolf, outcome.total_cost, outcome.curtailment)
    }

    /// One GridMetrics sample: sampled branch/generator states reshape the
    /// island partition per failure block.
    fn run_grid_sample(
        &self,
        nc: &NumericalCircuit,
        load: &[f64],
        horizon: usize,
        rng: &mut StdRng,
    ) -> (f64, usize, f64, f64) {
        let br = &nc.passive_branch_data;
        let g = &nc.generator_data;

        let (br_states, br_failures) = generate_states_matrix(
            rng,
            &br.mttf,
            &br.mttr,
            horizon,
            self.options.initially_working,
        );
        let (gen_states, gen_failures) = generate_states_matrix(
            rng,
            &g.mttf,
            &g.mttr,
            horizon,
            self.options.initially_working,
        );

        if br_failures + gen_failures == 0 {
            return (0.0, 0, 0.0, 0.0);
        }

        let mut all_states = br_states.clone();
        all_states.extend(gen_states.iter().cloned());
        let blocks = find_time_blocks(&all_states, horizon);

        let mut ens = 0.0;
        let mut lolf = 0usize;

        // total battery backup energy available once per sample
        let b = &nc.battery_data;
        let mut backup_energy: f64 = (0..b.len())
            .filter(|&i| b.active[i])
            .map(|i| (b.soc0[i] - b.soc_min[i]).max(0.0) * b.enom[i] * b.eff_discharge[i])
            .sum();

        for block in &blocks {
            // the block's first hour stands in for the whole outage event
            let t0 = block[0];
            let mut nc_state = nc.clone();
            for k in 0..br.len() {
                nc_state.passive_branch_data.active[k] = br.active[k] && br_states[k][t0];
            }
            for i in 0..g.len() {
                nc_state.generator_data.active[i] = g.active[i] && gen_states[i][t0];
            }

            let labels = nc_state.island_labels();
            let n_islands = labels
                .iter()
                .filter(|&&l| l != usize::MAX)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);

            // per-island source presence and demand share
            let mut island_has_source = vec![false; n_islands];
            for i in 0..g.len() {
                if nc_state.generator_data.active[i] {
                    let l = labels[g.bus[i]];
                    if l != usize::MAX {
                        island_has_source[l] = true;
                    }
                }
            }
            let total_load_now: f64 = {
                let ld = &nc.load_data;
                (0..ld.len())
                    .filter(|&i| ld.active[i])
                    .map(|i| ld.p[i])
                    .sum::<f64>()
                    .max(1e-9)
            };
            let mut dead_share = 0.0;
            let ld = &nc.load_data;
            for i in 0..ld.len() {
                if !ld.active[i] {
                    continue;
                }
                let l = labels[ld.bus[i]];
                if l == usize::MAX || !island_has_source[l] {
                    dead_share += ld.p[i] / total_load_now;
                }
            }

            if dead_share > 0.0 {
                let mut block_ens = 0.0;
                for &t in block {
                    block_ens += load[t] * dead_share; // MWh at 1 h steps
                }
                // batteries inside the dead islands can cover part of it
                let covered = backup_energy.min(block_ens);
                backup_energy -= covered;
                block_ens -= covered;
                if block_ens > 1e-9 {
                    ens += block_ens;
                    lolf += 1;
                }
            }
        }

        (ens, lolf, 0.0, 0.0)
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vera_core::{Battery, Branch, Bus, Gen, Load};

    #[test]
    fn test_bit_vector_availability() {
        // MTTF = 1000 h, MTTR = 10 h over 100 000 h: empirical availability
        // lands within [0.988, 0.992] averaged over 30 samples
        let mut acc = 0.0;
        for s in 0..30 {
            let mut rng = StdRng::seed_from_u64(1000 + s);
            let (states, n_failures) = compose_states(&mut rng, 1000.0, 10.0, 100_000, true);
            assert!(n_failures > 0);
            acc += ReliabilityResults::availability_of(&states);
        }
        let mean = acc / 30.0;
        assert!(
            (0.988..=0.992).contains(&mean),
            "availability out of band: {mean}"
        );
    }

    #[test]
    fn test_compose_states_no_stats_means_always_up() {
        let mut rng = StdRng::seed_from_u64(7);
        let (states, n) = compose_states(&mut rng, 0.0, 10.0, 100, true);
        assert_eq!(n, 0);
        assert!(states.iter().all(|&s| s));
    }

    #[test]
    fn test_find_time_blocks() {
        // component 0 down at t=2..4 and t=7
        let mut s = vec![vec![true; 10]];
        s[0][2] = false;
        s[0][3] = false;
        s[0][7] = false;
        let blocks = find_time_blocks(&s, 10);
        assert_eq!(blocks, vec![vec![2, 3], vec![7]]);
    }

    #[test]
    fn test_seed_reproducibility() {
        let mut grid = MultiCircuit::new("rel");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        grid.add_generator(
            b0,
            Gen::new("G", 100.0)
                .with_p_limits(0.0, 100.0)
                .with_cost(10.0)
                .with_reliability(500.0, 20.0),
        );
        grid.add_load(b0, Load::new("Ld", 80.0, 0.0));

        let options = ReliabilityOptions {
            n_samples: 10,
            horizon_hours: 2000,
            seed: 99,
            ..Default::default()
        };
        let mut d1 = ReliabilityDriver::new(&grid, options.clone());
        d1.run().unwrap();
        let mut d2 = ReliabilityDriver::new(&grid, options);
        d2.run().unwrap();
        assert_eq!(
            d1.results.unwrap().ens_per_sample,
            d2.results.unwrap().ens_per_sample
        );
    }

    #[test]
    fn test_adequacy_single_gen_sheds_on_outage() {
        // one failing generator, no backup: ENS must be positive
        let mut grid = MultiCircuit::new("rel1");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        grid.add_generator(
            b0,
            Gen::new("G", 100.0)
                .with_p_limits(0.0, 100.0)
                .with_cost(5.0)
                .with_reliability(200.0, 50.0),
        );
        grid.add_load(b0, Load::new("Ld", 80.0, 0.0));

        let mut driver = ReliabilityDriver::new(
            &grid,
            ReliabilityOptions {
                n_samples: 20,
                horizon_hours: 5000,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert!(res.lole_mwh_per_year > 0.0);
        assert!(res.lolf_per_sample.iter().any(|&n| n > 0));
    }

    #[test]
    fn test_battery_covers_short_outages() {
        // same grid plus a battery big enough to ride through most repairs
        let build = |with_battery: bool| {
            let mut grid = MultiCircuit::new("rel-bat");
            let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
            grid.add_generator(
                b0,
                Gen::new("G", 100.0)
                    .with_p_limits(0.0, 100.0)
                    .with_cost(5.0)
                    .with_reliability(300.0, 10.0),
            );
            grid.add_load(b0, Load::new("Ld", 50.0, 0.0));
            if with_battery {
                grid.add_battery(
                    b0,
                    Battery::new("Bat", 2000.0)
                        .with_power_limit(60.0)
                        .with_soc(1.0, 0.0),
                );
            }
            let mut driver = ReliabilityDriver::new(
                &grid,
                ReliabilityOptions {
                    n_samples: 15,
                    horizon_hours: 3000,
                    ..Default::default()
                },
            );
            driver.run().unwrap();
            driver.results.unwrap().lole_mwh_per_year
        };
        let without = build(false);
        let with = build(true);
        assert!(with < without, "battery did not help: {with} vs {without}");
    }

    #[test]
    fn test_grid_metrics_mode_islanding() {
        // failing radial branch cuts the load from the only source
        let mut grid = MultiCircuit::new("rel-grid");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        let b1 = grid.add_bus(Bus::new("B1", 132.0));
        grid.add_branch(
            Branch::line("L", b0, b1, 0.01, 0.1)
                .with_rating(100.0)
                .with_reliability(400.0, 30.0),
        );
        grid.add_generator(b0, Gen::new("G", 100.0).with_p_limits(0.0, 100.0));
        grid.add_load(b1, Load::new("Ld", 60.0, 0.0));

        let mut driver = ReliabilityDriver::new(
            &grid,
            ReliabilityOptions {
                mode: ReliabilityMode::GridMetrics,
                n_samples: 10,
                horizon_hours: 4000,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert!(res.lole_mwh_per_year > 0.0);
    }

    #[test]
    fn test_early_stop() {
        let mut grid = MultiCircuit::new("rel-stop");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        grid.add_generator(b0, Gen::new("G", 100.0).with_p_limits(0.0, 100.0));
        grid.add_load(b0, Load::new("Ld", 50.0, 0.0));
        // nothing ever fails, so the mean is flat from the start
        let mut driver = ReliabilityDriver::new(
            &grid,
            ReliabilityOptions {
                n_samples: 500,
                horizon_hours: 100,
                early_stop_tol: Some(1e-6),
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert!(res.stopped_early);
        assert!(res.samples_run < 500);
    }
}
