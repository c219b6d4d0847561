//! Time-series power flow.
//!
//! One snapshot per time index: project the profiles, compile, solve, store.
//! Snapshots are independent given the grid, so the loop fans out over a
//! thread pool; results are written by time index, never by completion
//! order, which keeps the output deterministic under any worker count.
//!
//! With a clustering result attached, only the representative indices are
//! solved and each carries its sample probability.

use super::{solve_circuit, PowerFlowOptions, PowerFlowResults};
use crate::compiler::compile_numerical_circuit_at;
use num_complex::Complex64;
use vera_core::{DriverHarness, Logger, MultiCircuit, VgError, VgResult};

/// Representative time steps plus their sampled probabilities.
#[derive(Debug, Clone)]
pub struct ClusteringResults {
    pub representative_indices: Vec<usize>,
    pub sample_probabilities: Vec<f64>,
}

/// Per-time results; row `k` corresponds to `time_indices[k]`.
#[derive(Debug, Clone)]
pub struct PowerFlowTimeSeriesResults {
    pub time_indices: Vec<usize>,
    /// Probability weight per solved step (uniform without clustering)
    pub probabilities: Vec<f64>,
    pub converged: Vec<bool>,
    pub voltage: Vec<Vec<Complex64>>,
    pub sf: Vec<Vec<Complex64>>,
    pub st: Vec<Vec<Complex64>>,
    pub losses: Vec<Vec<Complex64>>,
    pub loading: Vec<Vec<f64>>,
    pub cancelled: bool,
}

impl PowerFlowTimeSeriesResults {
    /// Fraction of solved steps that converged.
    pub fn convergence_rate(&self) -> f64 {
        if self.converged.is_empty() {
            return 0.0;
        }
        self.converged.iter().filter(|&&c| c).count() as f64 / self.converged.len() as f64
    }

    /// Maximum branch loading across all solved steps.
    pub fn max_loading(&self) -> f64 {
        self.loading
            .iter()
            .flat_map(|row| row.iter())
            .fold(0.0f64, |m, &v| m.max(v))
    }
}

/// Time-series driver with the uniform surface.
pub struct PowerFlowTimeSeriesDriver<'a> {
    pub grid: &'a MultiCircuit,
    pub options: PowerFlowOptions,
    pub clustering: Option<ClusteringResults>,
    pub harness: DriverHarness,
    pub results: Option<PowerFlowTimeSeriesResults>,
}

impl<'a> PowerFlowTimeSeriesDriver<'a> {
    pub fn new(grid: &'a MultiCircuit, options: PowerFlowOptions) -> Self {
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

    fn planned_indices(&self) -> VgResult<(Vec<usize>, Vec<f64>)> {
        let nt = self.grid.time_len();
        if nt == 0 {
            return Err(VgError::MalformedGrid(
                "time-series run on a grid without a time axis".into(),
            ));
        }
        match &self.clustering {
            Some(c) => Ok((
                c.representative_indices.clone(),
                c.sample_probabilities.clone(),
            )),
            None => Ok(((0..nt).collect(), vec![1.0 / nt as f64; nt])),
        }
    }

    /// Blocks until all planned steps are solved or cancellation is seen.
    pub fn run(&mut self) -> VgResult<()> {
        let (indices, probabilities) = self.planned_indices()?;
        let total = indices.len();
        self.harness.report_text("time series power flow");

        let step_results = self.solve_steps(&indices)?;

        let mut results = PowerFlowTimeSeriesResults {
            time_indices: indices,
            probabilities,
            converged: Vec::with_capacity(total),
            voltage: Vec::with_capacity(total),
            sf: Vec::with_capacity(total),
            st: Vec::with_capacity(total),
            losses: Vec::with_capacity(total),
            loading: Vec::with_capacity(total),
            cancelled: false,
        };

        for (k, step) in step_results.into_iter().enumerate() {
            match step {
                Some((res, log)) => {
                    self.harness.logger.extend(log);
                    results.converged.push(res.converged);
                    results.voltage.push(res.voltage);
                    results.sf.push(res.sf);
                    results.st.push(res.st);
                    results.losses.push(res.losses);
                    results.loading.push(res.loading);
                }
                None => {
                    // cancelled before this step was taken
                    results.cancelled = true;
                    results.time_indices.truncate(k);
                    results.probabilities.truncate(k);
                    break;
                }
            }
            self.harness.report_progress(k + 1, total);
        }

        self.results = Some(results);
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn solve_steps(
        &self,
        indices: &[usize],
    ) -> VgResult<Vec<Option<(PowerFlowResults, Logger)>>> {
        use rayon::prelude::*;
        let out: Vec<Option<(PowerFlowResults, Logger)>> = indices
            .par_iter()
            .map(|&t| self.solve_one(t))
            .collect();
        Ok(out)
    }

    #[cfg(not(feature = "parallel"))]
    fn solve_steps(
        &self,
        indices: &[usize],
    ) -> VgResult<Vec<Option<(PowerFlowResults, Logger)>>> {
        Ok(indices.iter().map(|&t| self.solve_one(t)).collect())
    }

    fn solve_one(&self, t: usize) -> Option<(PowerFlowResults, Logger)> {
        if self.harness.is_cancelled() {
            return None;
        }
        let mut worker = self.harness.child();
        let res = compile_numerical_circuit_at(self.grid, Some(t))
            .and_then(|nc| solve_circuit(&nc, &self.options, &mut worker));
        match res {
            Ok(r) => Some((r, worker.logger)),
            Err(e) => {
                let mut log = worker.logger;
                log.add_error(format!("t = {t}: {e}"));
                let nbus = self.grid.bus_count();
                let nbr = self.grid.branch_count();
                Some((
                    PowerFlowResults::empty(nbus, nbr, self.grid.generators.len()),
                    log,
                ))
            }
        }
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vera_core::{Branch, Bus, DenseProfile, Gen, Load, NumProfile, TimeAxis};

    fn profiled_grid(nt: usize) -> MultiCircuit {
        let t0 = chrono::Utc::now();
        let mut grid = MultiCircuit::new("ts").with_time_axis(TimeAxis::hourly(t0, nt));
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        grid.add_branch(Branch::line("L", b1, b2, 0.01, 0.1).with_rating(100.0));
        grid.add_generator(b1, Gen::new("G", 0.0));
        let mut load = Load::new("Ld", 30.0, 5.0);
        load.p_prof = Some(NumProfile::Dense(DenseProfile::new(
            (0..nt).map(|t| 20.0 + 5.0 * t as f64).collect(),
        )));
        grid.add_load(b2, load);
        grid
    }

    #[test]
    fn test_time_series_follows_profile() {
        let grid = profiled_grid(4);
        let mut driver = PowerFlowTimeSeriesDriver::new(&grid, PowerFlowOptions::default());
        driver.run().unwrap();
        let res = driver.results.unwrap();

        assert_eq!(res.time_indices, vec![0, 1, 2, 3]);
        assert!(res.converged.iter().all(|&c| c));
        // flows track the growing load
        for w in res.sf.windows(2) {
            assert!(w[1][0].re > w[0][0].re);
        }
        assert!((res.sf[0][0].re - 20.0).abs() < 1.0);
        assert!((res.sf[3][0].re - 35.0).abs() < 1.0);
    }

    #[test]
    fn test_clustering_only_solves_representatives() {
        let grid = profiled_grid(6);
        let clustering = ClusteringResults {
            representative_indices: vec![1, 4],
            sample_probabilities: vec![0.5, 0.5],
        };
        let mut driver = PowerFlowTimeSeriesDriver::new(&grid, PowerFlowOptions::default())
            .with_clustering(clustering);
        driver.run().unwrap();
        let res = driver.results.unwrap();
        assert_eq!(res.time_indices, vec![1, 4]);
        assert_eq!(res.voltage.len(), 2);
    }

    #[test]
    fn test_missing_time_axis_is_error() {
        let mut grid = MultiCircuit::new("no-axis");
        let b = grid.add_bus(Bus::new("B", 132.0).as_slack());
        grid.add_generator(b, Gen::new("G", 0.0));
        let mut driver = PowerFlowTimeSeriesDriver::new(&grid, PowerFlowOptions::default());
        assert!(driver.run().is_err());
    }
}
