//! Contingency analysis: snapshot and time series.
//!
//! Each contingency group is applied as one atomic event set to a mutable
//! copy of the compiled circuit (copy-on-write), solved with the configured
//! method, compared against the ratings, optionally mitigated through the
//! automatic protection response (SRAP), and discarded; the base circuit
//! is never touched, so restoration is structural.
//!
//! SRAP: when a post-contingency overload is detected, the generators
//! flagged for protection response are ranked by their PTDF sensitivity to
//! the overloaded branch; the top-N are redispatched greedily within their
//! available headroom and the global power cap, and the flow is
//! re-evaluated.
//!
//! The time-series variant repeats the snapshot procedure per time index
//! and aggregates per-branch statistics across contingencies with Welford's
//! online mean/variance update.

use crate::compiler::{compile_numerical_circuit_at, DeviceRef, NumericalCircuit};
use crate::linear::{LinearAnalysis, LinearAnalysisOptions};
use crate::power_flow::{solve_circuit, PowerFlowOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vera_core::{
    ContingencyGroup, DriverHarness, MultiCircuit, Severity, VgError, VgResult,
};

/// How each contingency is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContingencyMethod {
    /// Full power flow per contingency
    PowerFlow,
    /// Linear flows re-evaluated on the modified circuit
    Linear,
    /// PTDF/LODF superposition without re-solving
    PtdfScan,
}

/// Immutable contingency-analysis configuration.
#[derive(Debug, Clone)]
pub struct ContingencyAnalysisOptions {
    pub method: ContingencyMethod,
    pub pf_options: PowerFlowOptions,
    pub lin_options: LinearAnalysisOptions,
    /// Group uids to analyse; `None` = every group of the grid
    pub contingency_group_uids: Option<Vec<u64>>,
    pub use_srap: bool,
    /// Global cap on redispatched protection power (MW)
    pub srap_max_power: f64,
    /// Number of most sensitive generators eligible per overload
    pub srap_top_n: usize,
    /// Overloads within `[1, 1 + deadband)` of the protection rating are
    /// left unmitigated
    pub srap_deadband: f64,
    /// Loadings below `1 + deadband` are not reported as violations
    pub contingency_deadband: f64,
}

impl Default for ContingencyAnalysisOptions {
    fn default() -> Self {
        Self {
            method: ContingencyMethod::Linear,
            pf_options: PowerFlowOptions::default(),
            lin_options: LinearAnalysisOptions::default(),
            contingency_group_uids: None,
            use_srap: false,
            srap_max_power: 0.0,
            srap_top_n: 5,
            srap_deadband: 0.0,
            contingency_deadband: 0.0,
        }
    }
}

/// One violated branch in one contingency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContingencyReportRow {
    pub time_idx: Option<usize>,
    pub contingency_uid: u64,
    pub contingency_name: String,
    pub branch_name: String,
    pub branch_idx: usize,
    pub flow_mw: f64,
    pub loading: f64,
    /// MW of protection redispatch applied to this overload
    pub srap_power_mw: f64,
    /// Whether the redispatch brought the branch back under its rating
    pub srap_solved: bool,
}

/// Structured accumulation of every violation found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContingencyReport {
    pub rows: Vec<ContingencyReportRow>,
}

impl ContingencyReport {
    pub fn merge(&mut self, other: ContingencyReport) {
        self.rows.extend(other.rows);
    }

    /// Drop every row referencing a deleted contingency group.
    pub fn drop_group(&mut self, group_uid: u64) {
        self.rows.retain(|r| r.contingency_uid != group_uid);
    }

    pub fn worst_loading(&self) -> f64 {
        self.rows.iter().fold(0.0f64, |m, r| m.max(r.loading))
    }
}

/// Snapshot results: per contingency × branch flows and loadings.
#[derive(Debug, Clone)]
pub struct ContingencyAnalysisResults {
    pub con_uids: Vec<u64>,
    pub con_names: Vec<String>,
    pub branch_names: Vec<String>,
    /// `sf[c][k]` (MW)
    pub sf: Vec<Vec<f64>>,
    /// `loading[c][k]` relative to the contingency rating
    pub loading: Vec<Vec<f64>>,
    pub report: ContingencyReport,
    pub srap_used_power_mw: f64,
    pub cancelled: bool,
}

impl ContingencyAnalysisResults {
    fn new(con_uids: Vec<u64>, con_names: Vec<String>, branch_names: Vec<String>) -> Self {
        let ncon = con_uids.len();
        let nbr = branch_names.len();
        Self {
            con_uids,
            con_names,
            branch_names,
            sf: vec![vec![0.0; nbr]; ncon],
            loading: vec![vec![0.0; nbr]; ncon],
            report: ContingencyReport::default(),
            srap_used_power_mw: 0.0,
            cancelled: false,
        }
    }

    /// Drop all results of a deleted contingency group (by uid).
    pub fn drop_group(&mut self, group_uid: u64) {
        if let Some(pos) = self.con_uids.iter().position(|&u| u == group_uid) {
            self.con_uids.remove(pos);
            self.con_names.remove(pos);
            self.sf.remove(pos);
            self.loading.remove(pos);
        }
        self.report.drop_group(group_uid);
    }
}

/// Snapshot contingency driver.
pub struct ContingencyAnalysisDriver<'a> {
    pub grid: &'a MultiCircuit,
    pub options: ContingencyAnalysisOptions,
    pub harness: DriverHarness,
    pub results: Option<ContingencyAnalysisResults>,
}

impl<'a> ContingencyAnalysisDriver<'a> {
    pub fn new(grid: &'a MultiCircuit, options: ContingencyAnalysisOptions) -> Self {
        Self {
            grid,
            options,
            harness: DriverHarness::new(),
            results: None,
        }
    }

    /// Groups selected by the options, defaulting to all.
    fn selected_groups(&self) -> Vec<&'a ContingencyGroup> {
        match &self.options.contingency_group_uids {
            None => self.grid.contingency_groups.iter().collect(),
            Some(uids) => self
                .grid
                .contingency_groups
                .iter()
                .filter(|g| uids.contains(&g.uid))
                .collect(),
        }
    }

    pub fn run(&mut self) -> VgResult<()> {
        let nc = compile_numerical_circuit_at(self.grid, None)?;
        let groups = self.selected_groups();
        let res = run_snapshot(
            &nc,
            &groups,
            &self.options,
            None,
            &mut self.harness,
        )?;
        self.results = Some(res);
        Ok(())
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}

/// Run the snapshot procedure over an already compiled circuit.
pub fn run_snapshot(
    nc: &NumericalCircuit,
    groups: &[&ContingencyGroup],
    options: &ContingencyAnalysisOptions,
    time_idx: Option<usize>,
    harness: &mut DriverHarness,
) -> VgResult<ContingencyAnalysisResults> {
    let mut results = ContingencyAnalysisResults::new(
        groups.iter().map(|g| g.uid).collect(),
        groups.iter().map(|g| g.name.clone()).collect(),
        nc.passive_branch_data.names.clone(),
    );

    let refs = nc.device_refs();
    let mon_idx = nc.passive_branch_data.monitored_indices();

    // base-case linear machinery, reused across contingencies
    let base_island = {
        let mut log = vera_core::Logger::new();
        let mut islands = nc.split_into_islands(true, &mut log);
        harness.logger.extend(log);
        if islands.is_empty() {
            return Err(VgError::MalformedGrid("no solvable islands".into()));
        }
        islands.remove(0)
    };
    let base_lin = LinearAnalysis::new(&base_island, &options.lin_options, &mut harness.logger)?;
    let base_flows = base_lin.get_flows(&base_island.real_power_injections(), &base_island);

    // the base island re-indexed buses/branches; map back to grid indexing
    let br_of_island: Vec<usize> = base_island.passive_branch_data.original_idx.clone();

    for (ic, group) in groups.iter().enumerate() {
        if harness.is_cancelled() {
            results.cancelled = true;
            break;
        }
        harness.report_text(&format!("contingency group '{}'", group.name));
        harness.report_progress(ic, groups.len());

        // copy-on-write application of the event list
        let mut nc_con = nc.clone();
        let mut unknown_devices = 0;
        for ev in &group.events {
            match refs.get(&ev.device_uid) {
                Some(&dref) => nc_con.apply_action(dref, ev.action),
                None => unknown_devices += 1,
            }
        }
        if unknown_devices > 0 {
            harness.logger.add_device_entry(
                Severity::Warning,
                group.uid,
                format!("{unknown_devices} event device(s) not found in the circuit"),
            );
        }

        // evaluate flows on the modified circuit
        let (flows, con_rates) = match options.method {
            ContingencyMethod::PowerFlow => {
                let mut worker = harness.child();
                let pf = solve_circuit(&nc_con, &options.pf_options, &mut worker)?;
                harness.logger.extend(worker.logger);
                let flows: Vec<f64> = pf.sf.iter().map(|s| s.re).collect();
                (flows, effective_con_rates(&nc_con))
            }
            ContingencyMethod::Linear => {
                let mut log = vera_core::Logger::new();
                let mut islands = nc_con.split_into_islands(true, &mut log);
                harness.logger.extend(log);
                let mut flows = vec![0.0; nc_con.nbr()];
                for island in islands.iter_mut() {
                    if island.slack_index().is_none() {
                        continue;
                    }
                    let lin = LinearAnalysis::new(
                        island,
                        &options.lin_options,
                        &mut harness.logger,
                    )?;
                    let f = lin.get_flows(&island.real_power_injections(), island);
                    for (lk, &gk) in island.passive_branch_data.original_idx.iter().enumerate()
                    {
                        flows[gk] = f[lk];
                    }
                }
                (flows, effective_con_rates(&nc_con))
            }
            ContingencyMethod::PtdfScan => {
                // superpose LODF terms of the outaged branches; injection
                // events are projected through the PTDF
                let outaged: Vec<usize> = island_branch_indices_of_group(
                    &br_of_island,
                    group,
                    &refs,
                );
                let mut delta_p = vec![0.0; base_island.nbus()];
                apply_injection_deltas(&base_island, nc, group, &refs, &mut delta_p);

                let mut flows_island = vec![0.0; base_island.nbr()];
                for m in 0..base_island.nbr() {
                    let mut f = base_lin.multi_outage_flow(&base_flows, m, &outaged);
                    // first-order injection correction
                    for (n, &dp) in delta_p.iter().enumerate() {
                        if dp != 0.0 {
                            f += base_lin.ptdf[m][n] * dp;
                        }
                    }
                    flows_island[m] = f;
                }
                for &c in &outaged {
                    flows_island[c] = 0.0;
                }
                let mut flows = vec![0.0; nc.nbr()];
                for (lk, &gk) in br_of_island.iter().enumerate() {
                    flows[gk] = flows_island[lk];
                }
                (flows, effective_con_rates(nc))
            }
        };

        results.sf[ic] = flows.clone();
        for k in 0..nc.nbr() {
            results.loading[ic][k] = flows[k] / (con_rates[k] + 1e-9);
        }

        // violation reporting + SRAP
        for &m in &mon_idx {
            let rate = con_rates[m];
            if rate <= 0.0 {
                continue;
            }
            let loading = flows[m].abs() / rate;
            if loading <= 1.0 + options.contingency_deadband {
                continue;
            }

            let mut flow_after = flows[m];
            let mut srap_power = 0.0;
            let mut srap_solved = false;
            if options.use_srap && loading > 1.0 + options.srap_deadband {
                (flow_after, srap_power) = apply_srap(
                    &base_island,
                    &base_lin,
                    &br_of_island,
                    m,
                    flows[m],
                    options,
                );
                srap_solved = flow_after.abs() <= rate;
                results.srap_used_power_mw += srap_power;
            }

            results.report.rows.push(ContingencyReportRow {
                time_idx,
                contingency_uid: group.uid,
                contingency_name: group.name.clone(),
                branch_name: nc.passive_branch_data.names[m].clone(),
                branch_idx: m,
                flow_mw: flow_after,
                loading: flow_after.abs() / rate,
                srap_power_mw: srap_power,
                srap_solved,
            });
        }
        // nc_con dropped here; the base circuit was never modified
    }

    harness.report_progress(groups.len(), groups.len());
    Ok(results)
}

/// Contingency ratings with the nominal rating as a fallback.
fn effective_con_rates(nc: &NumericalCircuit) -> Vec<f64> {
    let br = &nc.passive_branch_data;
    (0..br.len())
        .map(|k| {
            if br.contingency_rates[k] > 0.0 {
                br.contingency_rates[k]
            } else {
                br.rates[k]
            }
        })
        .collect()
}

/// Island-local indices of the branches outaged by a group.
fn island_branch_indices_of_group(
    br_of_island: &[usize],
    group: &ContingencyGroup,
    refs: &HashMap<u64, DeviceRef>,
) -> Vec<usize> {
    let mut grid_to_island: HashMap<usize, usize> = HashMap::new();
    for (lk, &gk) in br_of_island.iter().enumerate() {
        grid_to_island.insert(gk, lk);
    }
    let mut out = Vec::new();
    for ev in &group.events {
        if let Some(DeviceRef::Branch(gk)) = refs.get(&ev.device_uid) {
            if matches!(
                ev.action,
                vera_core::ContingencyAction::Deactivate
                    | vera_core::ContingencyAction::SetActive(false)
            ) {
                if let Some(&lk) = grid_to_island.get(gk) {
                    out.push(lk);
                }
            }
        }
    }
    out
}

/// Bus-level MW deltas caused by injection events (island indexing).
fn apply_injection_deltas(
    island: &NumericalCircuit,
    nc: &NumericalCircuit,
    group: &ContingencyGroup,
    refs: &HashMap<u64, DeviceRef>,
    delta_p: &mut [f64],
) {
    // map grid bus -> island bus
    let mut island_bus: HashMap<usize, usize> = HashMap::new();
    for (li, &gi) in island.bus_data.original_idx.iter().enumerate() {
        island_bus.insert(gi, li);
    }
    for ev in &group.events {
        let Some(&dref) = refs.get(&ev.device_uid) else {
            continue;
        };
        let (bus, p_now, sign) = match dref {
            DeviceRef::Generator(i) => (
                nc.generator_data.bus[i],
                nc.generator_data.p[i],
                1.0,
            ),
            DeviceRef::Battery(i) => (nc.battery_data.bus[i], nc.battery_data.p[i], 1.0),
            DeviceRef::Load(i) => (nc.load_data.bus[i], nc.load_data.p[i], -1.0),
            DeviceRef::StaticGen(i) => {
                (nc.static_gen_data.bus[i], nc.static_gen_data.p[i], 1.0)
            }
            _ => continue,
        };
        let Some(&li) = island_bus.get(&bus) else {
            continue;
        };
        match ev.action {
            vera_core::ContingencyAction::Deactivate
            | vera_core::ContingencyAction::SetActive(false) => {
                delta_p[li] -= sign * p_now;
            }
            vera_core::ContingencyAction::SetP(p_new) => {
                delta_p[li] += sign * (p_new - p_now);
            }
            vera_core::ContingencyAction::SetActive(true) => {
                delta_p[li] += sign * p_now;
            }
        }
    }
}

/// Greedy protection redispatch against one overloaded branch. Returns the
/// mitigated flow and the MW moved.
fn apply_srap(
    island: &NumericalCircuit,
    lin: &LinearAnalysis,
    br_of_island: &[usize],
    branch_grid_idx: usize,
    flow_mw: f64,
    options: &ContingencyAnalysisOptions,
) -> (f64, f64) {
    // overloaded branch in island indexing
    let Some(m) = br_of_island
        .iter()
        .position(|&gk| gk == branch_grid_idx)
    else {
        return (flow_mw, 0.0);
    };

    let g = &island.generator_data;
    // candidates ranked by |sensitivity| of the overloaded branch
    let mut candidates: Vec<(usize, f64)> = (0..g.len())
        .filter(|&i| g.active[i] && g.srap_enabled[i] && g.dispatchable[i])
        .map(|i| (i, lin.ptdf[m][g.bus[i]]))
        .filter(|(_, s)| s.abs() > 1e-9)
        .collect();
    candidates.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    candidates.truncate(options.srap_top_n);

    let mut flow = flow_mw;
    let mut used = 0.0;
    for (i, sens) in candidates {
        if used >= options.srap_max_power || flow.abs() <= 1e-9 {
            break;
        }
        // lowering the flow requires moving against its sign through the
        // sensitivity; positive delta_p raises the branch flow by sens MW/MW
        let needed = -flow / sens;
        // generator headroom in the helpful direction
        let headroom = if needed >= 0.0 {
            (g.pmax[i] - g.p[i]).max(0.0)
        } else {
            (g.pmin[i] - g.p[i]).min(0.0)
        };
        let budget = options.srap_max_power - used;
        let delta = needed.clamp(-budget, budget).clamp(
            headroom.min(0.0),
            headroom.max(0.0),
        );
        flow += sens * delta;
        used += delta.abs();
    }
    (flow, used)
}

pub mod time_series;
pub use time_series::{
    ContingencyAnalysisTimeSeriesDriver, ContingencyAnalysisTimeSeriesResults,
};

#[cfg(test)]
mod tests {
    use super::*;
    use vera_core::{Branch, Bus, ContingencyGroup, Gen, Load};

    fn ring_with_groups() -> MultiCircuit {
        let mut grid = MultiCircuit::new("ring10");
        let buses: Vec<_> = (0..10)
            .map(|i| {
                let mut b = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    b = b.as_slack();
                }
                grid.add_bus(b)
            })
            .collect();
        for i in 0..10 {
            let j = (i + 1) % 10;
            grid.add_branch(
                Branch::line(format!("L{i}"), buses[i], buses[j], 0.0, 0.1)
                    .with_rating(100.0)
                    .with_contingency_rating(110.0),
            );
        }
        grid.add_generator(buses[0], Gen::new("G", 0.0));
        grid.add_load(buses[5], Load::new("Ld", 80.0, 0.0));

        for k in 0..10 {
            let uid = grid.branches[k].uid;
            grid.add_contingency_group(ContingencyGroup::branch_outage(format!("N-1 L{k}"), uid));
        }
        grid
    }

    #[test]
    fn test_linear_contingency_identity() {
        // linear mode must reproduce Sf0 + LODF[:,c]·Sf0[c] to 1e-9
        let grid = ring_with_groups();
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = vera_core::Logger::new();
        let island = nc.split_into_islands(true, &mut log).remove(0);
        let lin =
            LinearAnalysis::new(&island, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let sf0 = lin.get_flows(&island.real_power_injections(), &island);

        let mut driver = ContingencyAnalysisDriver::new(
            &grid,
            ContingencyAnalysisOptions {
                method: ContingencyMethod::PtdfScan,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();

        for (ic, _) in grid.contingency_groups.iter().enumerate() {
            let c = ic; // group ic outages branch ic
            for m in 0..nc.nbr() {
                if m == c {
                    continue;
                }
                let expected = sf0[m] + lin.lodf[m][c] * sf0[c];
                assert!(
                    (res.sf[ic][m] - expected).abs() < 1e-9,
                    "group {ic}, branch {m}: {} vs {expected}",
                    res.sf[ic][m]
                );
            }
        }
    }

    #[test]
    fn test_restoration_after_run() {
        let grid = ring_with_groups();
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let active_before = nc.passive_branch_data.active.clone();
        let p_before = nc.generator_data.p.clone();

        let groups: Vec<&ContingencyGroup> = grid.contingency_groups.iter().collect();
        let mut harness = DriverHarness::new();
        run_snapshot(
            &nc,
            &groups,
            &ContingencyAnalysisOptions::default(),
            None,
            &mut harness,
        )
        .unwrap();

        // bit-identical state after the run
        assert_eq!(nc.passive_branch_data.active, active_before);
        assert_eq!(nc.generator_data.p, p_before);
    }

    #[test]
    fn test_powerflow_method_reports_overloads() {
        let mut grid = ring_with_groups();
        // tighten ratings so N-1 overloads appear
        for br in grid.branches.iter_mut() {
            br.rate = vera_core::MegavoltAmperes(45.0);
            br.contingency_rate = vera_core::MegavoltAmperes(50.0);
        }
        let mut driver = ContingencyAnalysisDriver::new(
            &grid,
            ContingencyAnalysisOptions {
                method: ContingencyMethod::PowerFlow,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert!(!res.report.rows.is_empty());
        assert!(res.report.worst_loading() > 1.0);
    }

    #[test]
    fn test_srap_reduces_overload() {
        let mut grid = ring_with_groups();
        for br in grid.branches.iter_mut() {
            br.rate = vera_core::MegavoltAmperes(45.0);
            br.contingency_rate = vera_core::MegavoltAmperes(50.0);
        }
        // a protection-enabled generator near the load can relieve flow
        let b7 = grid.buses[7].id;
        grid.add_generator(
            b7,
            Gen::new("G-srap", 0.0)
                .with_p_limits(0.0, 60.0)
                .with_srap(true),
        );

        let base = ContingencyAnalysisOptions {
            method: ContingencyMethod::PtdfScan,
            ..Default::default()
        };
        let mut no_srap = ContingencyAnalysisDriver::new(&grid, base.clone());
        no_srap.run().unwrap();
        let worst_plain = no_srap.results.unwrap().report.worst_loading();

        let mut with_srap = ContingencyAnalysisDriver::new(
            &grid,
            ContingencyAnalysisOptions {
                use_srap: true,
                srap_max_power: 100.0,
                srap_top_n: 3,
                ..base
            },
        );
        with_srap.run().unwrap();
        let res = with_srap.results.unwrap();
        assert!(res.srap_used_power_mw > 0.0);
        assert!(res.report.worst_loading() < worst_plain);
    }

    #[test]
    fn test_cancellation_partial_results() {
        let grid = ring_with_groups();
        let mut driver =
            ContingencyAnalysisDriver::new(&grid, ContingencyAnalysisOptions::default());
        driver.cancel();
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert!(res.cancelled);
        assert!(res.report.rows.is_empty());
    }
}
