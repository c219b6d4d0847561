//! Time-series contingency analysis.
//!
//! Repeats the snapshot procedure per time index and aggregates per-branch
//! overload statistics across contingencies: max loading, overload count,
//! overload sum, and an online mean/std through Welford's update; the
//! one-pass recurrence keeps the aggregation numerically stable without
//! holding the full (time × contingency × branch) cube.

use super::{run_snapshot, ContingencyAnalysisOptions, ContingencyReport};
use crate::compiler::compile_numerical_circuit_at;
use crate::power_flow::time_series::ClusteringResults;
use vera_core::{ContingencyGroup, DriverHarness, MultiCircuit, VgResult};

/// Welford online mean/variance accumulator per (row, col) cell.
#[derive(Debug, Clone)]
pub struct WelfordMat {
    count: Vec<Vec<u64>>,
    mean: Vec<Vec<f64>>,
    m2: Vec<Vec<f64>>,
}

impl WelfordMat {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Self {
            count: vec![vec![0; ncol]; nrow],
            mean: vec![vec![0.0; ncol]; nrow],
            m2: vec![vec![0.0; ncol]; nrow],
        }
    }

    /// Feed one observation row for time `row`.
    pub fn update(&mut self, row: usize, values: &[f64]) {
        for (c, &v) in values.iter().enumerate() {
            self.count[row][c] += 1;
            let delta = v - self.mean[row][c];
            self.mean[row][c] += delta / self.count[row][c] as f64;
            let delta2 = v - self.mean[row][c];
            self.m2[row][c] += delta * delta2;
        }
    }

    pub fn mean(&self) -> &Vec<Vec<f64>> {
        &self.mean
    }

    pub fn std_dev(&self) -> Vec<Vec<f64>> {
        self.m2
            .iter()
            .zip(self.count.iter())
            .map(|(m2_row, n_row)| {
                m2_row
                    .iter()
                    .zip(n_row.iter())
                    .map(|(&m2, &n)| if n > 1 { (m2 / n as f64).sqrt() } else { 0.0 })
                    .collect()
            })
            .collect()
    }
}

/// Aggregated per-time, per-branch statistics.
#[derive(Debug, Clone)]
pub struct ContingencyAnalysisTimeSeriesResults {
    pub time_indices: Vec<usize>,
    pub branch_names: Vec<String>,
    pub con_names: Vec<String>,
    /// `max_loading[t][k]`: worst |loading| across contingencies
    pub max_loading: Vec<Vec<f64>>,
    /// `max_flows[t][k]` (MW)
    pub max_flows: Vec<Vec<f64>>,
    /// Overload count per time step (loading > 1 across contingencies)
    pub overload_count: Vec<usize>,
    /// `sum_overload[t][k]`: overload magnitudes accumulated
    pub sum_overload: Vec<Vec<f64>>,
    /// Welford mean of the overload per (time, branch)
    pub mean_overload: Vec<Vec<f64>>,
    /// Welford std of the overload per (time, branch)
    pub std_dev_overload: Vec<Vec<f64>>,
    pub report: ContingencyReport,
    pub srap_used_power_mw: f64,
    pub cancelled: bool,
}

/// Time-series contingency driver.
pub struct ContingencyAnalysisTimeSeriesDriver<'a> {
    pub grid: &'a MultiCircuit,
    pub options: ContingencyAnalysisOptions,
    pub clustering: Option<ClusteringResults>,
    pub harness: DriverHarness,
    pub results: Option<ContingencyAnalysisTimeSeriesResults>,
}

impl<'a> ContingencyAnalysisTimeSeriesDriver<'a> {
    pub fn new(grid: &'a MultiCircuit, options: ContingencyAnalysisOptions) -> Self {
        Self {
            grid,
            options,
            clustering: None,
            harness: DriverHarness::new(),
            results: None,
        }
    }

    pub fn with_clustering(mut self, clustering: ClusteringResults) -> Self {
        self.clustering = Some(clustering);
        self
    }

    pub fn run(&mut self) -> VgResult<()> {
        let nt = self.grid.time_len();
        if nt == 0 {
            return Err(vera_core::VgError::MalformedGrid(
                "time-series contingency run without a time axis".into(),
            ));
        }
        let time_indices: Vec<usize> = match &self.clustering {
            Some(c) => c.representative_indices.clone(),
            None => (0..nt).collect(),
        };

        let groups: Vec<&ContingencyGroup> = match &self.options.contingency_group_uids {
            None => self.grid.contingency_groups.iter().collect(),
            Some(uids) => self
                .grid
                .contingency_groups
                .iter()
                .filter(|g| uids.contains(&g.uid))
                .collect(),
        };

        let nbr = self.grid.branch_count();
        let n_steps = time_indices.len();
        let mut welford = WelfordMat::new(n_steps, nbr);

        let mut results = ContingencyAnalysisTimeSeriesResults {
            time_indices: time_indices.clone(),
            branch_names: self.grid.branch_names(),
            con_names: groups.iter().map(|g| g.name.clone()).collect(),
            max_loading: vec![vec![0.0; nbr]; n_steps],
            max_flows: vec![vec![0.0; nbr]; n_steps],
            overload_count: vec![0; n_steps],
            sum_overload: vec![vec![0.0; nbr]; n_steps],
            mean_overload: Vec::new(),
            std_dev_overload: Vec::new(),
            report: ContingencyReport::default(),
            srap_used_power_mw: 0.0,
            cancelled: false,
        };

        for (it, &t) in time_indices.iter().enumerate() {
            if self.harness.is_cancelled() {
                results.cancelled = true;
                break;
            }
            self.harness
                .report_text(&format!("contingencies at time index {t}"));
            self.harness.report_progress(it, n_steps);

            let nc = compile_numerical_circuit_at(self.grid, Some(t))?;
            let res_t = run_snapshot(&nc, &groups, &self.options, Some(t), &mut self.harness)?;
            if res_t.cancelled {
                results.cancelled = true;
            }

            for (ic, _) in groups.iter().enumerate() {
                let mut overloading = vec![0.0; nbr];
                for k in 0..nbr {
                    let loading = res_t.loading[ic][k].abs();
                    let flow = res_t.sf[ic][k];
                    if loading > results.max_loading[it][k] {
                        results.max_loading[it][k] = loading;
                        results.max_flows[it][k] = flow;
                    }
                    if loading > 1.0 {
                        overloading[k] = loading;
                        results.overload_count[it] += 1;
                        results.sum_overload[it][k] += loading;
                    }
                }
                welford.update(it, &overloading);
            }

            results.srap_used_power_mw += res_t.srap_used_power_mw;
            results.report.merge(res_t.report);
        }

        results.mean_overload = welford.mean().clone();
        results.std_dev_overload = welford.std_dev();
        self.results = Some(results);
        Ok(())
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contingency::ContingencyMethod;
    use vera_core::{
        Branch, Bus, ContingencyGroup, DenseProfile, Gen, Load, NumProfile, TimeAxis,
    };

    fn ts_grid(nt: usize) -> MultiCircuit {
        let t0 = chrono::Utc::now();
        let mut grid = MultiCircuit::new("ts-con").with_time_axis(TimeAxis::hourly(t0, nt));
        let b: Vec<_> = (0..4)
            .map(|i| {
                let mut bus = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    bus = bus.as_slack();
                }
                grid.add_bus(bus)
            })
            .collect();
        for i in 0..4 {
            let j = (i + 1) % 4;
            grid.add_branch(
                Branch::line(format!("L{i}"), b[i], b[j], 0.0, 0.1).with_rating(40.0),
            );
        }
        grid.add_generator(b[0], Gen::new("G", 0.0));
        let mut load = Load::new("Ld", 50.0, 0.0);
        load.p_prof = Some(NumProfile::Dense(DenseProfile::new(
            (0..nt).map(|t| 30.0 + 15.0 * t as f64).collect(),
        )));
        grid.add_load(b[2], load);
        for k in 0..4 {
            let uid = grid.branches[k].uid;
            grid.add_contingency_group(ContingencyGroup::branch_outage(format!("N-1 L{k}"), uid));
        }
        grid
    }

    #[test]
    fn test_ts_aggregation_grows_with_load() {
        let grid = ts_grid(3);
        let mut driver = ContingencyAnalysisTimeSeriesDriver::new(
            &grid,
            ContingencyAnalysisOptions {
                method: ContingencyMethod::PtdfScan,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();

        assert_eq!(res.time_indices.len(), 3);
        // max loading over the grid grows with the load profile
        let worst_per_t: Vec<f64> = res
            .max_loading
            .iter()
            .map(|row| row.iter().fold(0.0f64, |m, &v| m.max(v)))
            .collect();
        assert!(worst_per_t[2] > worst_per_t[0]);
        // Welford stats have the expected shape
        assert_eq!(res.mean_overload.len(), 3);
        assert_eq!(res.mean_overload[0].len(), grid.branch_count());
    }

    #[test]
    fn test_ts_report_carries_time_index() {
        let grid = ts_grid(2);
        let mut driver = ContingencyAnalysisTimeSeriesDriver::new(
            &grid,
            ContingencyAnalysisOptions {
                method: ContingencyMethod::PtdfScan,
                ..Default::default()
            },
        );
        driver.run().unwrap();
        let res = driver.results.unwrap();
        for row in &res.report.rows {
            assert!(row.time_idx.is_some());
        }
    }

    #[test]
    fn test_welford_mean_std() {
        let mut w = WelfordMat::new(1, 1);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.update(0, &[v]);
        }
        assert!((w.mean()[0][0] - 5.0).abs() < 1e-12);
        assert!((w.std_dev()[0][0] - 2.0).abs() < 1e-12);
    }
}
