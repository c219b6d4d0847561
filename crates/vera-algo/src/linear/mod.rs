//! Linear sensitivity factors: PTDF and LODF.
//!
//! ## PTDF (bus → branch)
//!
//! With the slack column pinned to zero, `PTDF[k,n]` is the MW that appear
//! on branch `k` per MW injected at bus `n`:
//! ```text
//!   X = B_bus⁻¹ (reduced, slack removed)
//!   PTDF[k,n] = (X[F_k,n] − X[T_k,n]) / x_k
//! ```
//! The inverse is never formed explicitly as such; the reduced matrix is
//! factorized once and solved against unit columns.
//!
//! ## LODF (branch outage → branch)
//!
//! `LODF[m,c]` is the extra flow on `m` when `c` trips, per MW of `c`'s
//! pre-outage flow (textbook closed form over transfer PTDFs). The diagonal
//! is −1. When the denominator `1 − PTDF_transfer[c]` vanishes the outage
//! would island the grid: the column is zeroed and the contingency flagged
//! as non-representable.

pub mod scan;

use crate::compiler::NumericalCircuit;
use crate::sparse::{factorize, from_triplets, lu_solve};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vera_core::{Logger, VgError};

pub use scan::{linear_contingency_scan, LinearScanResults, OverloadRecord};

/// Errors from sensitivity-factor computation.
#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error("PTDF needs at least 2 buses")]
    TooFewBuses,

    #[error("island has no slack bus")]
    NoSlack,

    #[error("susceptance matrix factorization failed: {0}")]
    Singular(String),
}

impl From<SensitivityError> for VgError {
    fn from(err: SensitivityError) -> Self {
        match err {
            SensitivityError::NoSlack => VgError::NoSlackInIsland { island: 0 },
            SensitivityError::Singular(msg) => VgError::SingularJacobian(msg),
            other => VgError::MalformedGrid(other.to_string()),
        }
    }
}

/// Linear-analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearAnalysisOptions {
    /// Spread the slack over all buses instead of a single reference column
    pub distributed_slack: bool,
    /// Zero PTDF entries below this magnitude
    pub ptdf_threshold: f64,
    /// Zero LODF entries below this magnitude
    pub lodf_threshold: f64,
}

impl Default for LinearAnalysisOptions {
    fn default() -> Self {
        Self {
            distributed_slack: false,
            ptdf_threshold: 1e-10,
            lodf_threshold: 1e-10,
        }
    }
}

/// PTDF + LODF over one compiled island.
#[derive(Debug, Clone)]
pub struct LinearAnalysis {
    /// `ptdf[k][n]`: branches × buses
    pub ptdf: Vec<Vec<f64>>,
    /// `lodf[m][c]`: branches × branches
    pub lodf: Vec<Vec<f64>>,
    /// Branch contingencies found non-representable (islanding outages)
    pub non_representable: Vec<usize>,
    nbus: usize,
    nbr: usize,
}

impl LinearAnalysis {
    /// Build both factor matrices for a compiled circuit.
    pub fn new(
        nc: &NumericalCircuit,
        options: &LinearAnalysisOptions,
        logger: &mut Logger,
    ) -> Result<Self, SensitivityError> {
        let nbus = nc.nbus();
        let nbr = nc.nbr();
        if nbus < 2 {
            return Err(SensitivityError::TooFewBuses);
        }
        let slack = nc.slack_index().ok_or(SensitivityError::NoSlack)?;

        let br = &nc.passive_branch_data;

        // reduced susceptance matrix (slack removed)
        let mut red_of = vec![usize::MAX; nbus];
        let mut n_red = 0;
        for i in 0..nbus {
            if i != slack {
                red_of[i] = n_red;
                n_red += 1;
            }
        }
        let mut triplets = Vec::new();
        for k in 0..nbr {
            if !br.active[k] {
                continue;
            }
            let (f, t) = (br.f[k], br.t[k]);
            let x = br.x[k].abs().max(1e-6);
            let b = 1.0 / (x * br.tap_module[k]);
            if red_of[f] != usize::MAX {
                triplets.push((red_of[f], red_of[f], b));
            }
            if red_of[t] != usize::MAX {
                triplets.push((red_of[t], red_of[t], b));
            }
            if red_of[f] != usize::MAX && red_of[t] != usize::MAX {
                triplets.push((red_of[f], red_of[t], -b));
                triplets.push((red_of[t], red_of[f], -b));
            }
        }
        let b_red = from_triplets(n_red, n_red, &triplets);
        let lu = factorize(&b_red);

        // X = B⁻¹ extended with a zero slack row/column, one solve per bus
        let mut x_cols: Vec<Vec<f64>> = Vec::with_capacity(nbus);
        for n in 0..nbus {
            if n == slack {
                x_cols.push(vec![0.0; nbus]);
                continue;
            }
            let mut e = vec![0.0; n_red];
            e[red_of[n]] = 1.0;
            let sol =
                lu_solve(&lu, &e).map_err(|err| SensitivityError::Singular(err.to_string()))?;
            let mut full = vec![0.0; nbus];
            for i in 0..nbus {
                if red_of[i] != usize::MAX {
                    full[i] = sol[red_of[i]];
                }
            }
            x_cols.push(full);
        }

        let mut ptdf = vec![vec![0.0; nbus]; nbr];
        for k in 0..nbr {
            if !br.active[k] {
                continue;
            }
            let x = br.x[k].abs().max(1e-6);
            let scale = 1.0 / (x * br.tap_module[k]);
            for (n, col) in x_cols.iter().enumerate() {
                let v = (col[br.f[k]] - col[br.t[k]]) * scale;
                ptdf[k][n] = if v.abs() < options.ptdf_threshold {
                    0.0
                } else {
                    v
                };
            }
        }

        if options.distributed_slack {
            // every injection is balanced by all buses equally
            for row in ptdf.iter_mut() {
                let mean: f64 = row.iter().sum::<f64>() / nbus as f64;
                for v in row.iter_mut() {
                    *v -= mean;
                }
            }
        }

        // LODF from the transfer PTDFs
        let mut lodf = vec![vec![0.0; nbr]; nbr];
        let mut non_representable = Vec::new();
        for c in 0..nbr {
            if !br.active[c] {
                continue;
            }
            let (fc, tc) = (br.f[c], br.t[c]);
            let denom = 1.0 - (ptdf[c][fc] - ptdf[c][tc]);
            if denom.abs() < 1e-8 {
                // islanding outage: zero the column, keep the diagonal
                for (m, row) in lodf.iter_mut().enumerate() {
                    row[c] = if m == c { -1.0 } else { 0.0 };
                }
                non_representable.push(c);
                logger.add_warning(format!(
                    "contingency on branch '{}' is non-representable (islanding)",
                    br.names[c]
                ));
                continue;
            }
            for m in 0..nbr {
                if m == c {
                    lodf[m][c] = -1.0;
                    continue;
                }
                if !br.active[m] {
                    continue;
                }
                let num = ptdf[m][fc] - ptdf[m][tc];
                let v = num / denom;
                lodf[m][c] = if v.abs() < options.lodf_threshold {
                    0.0
                } else {
                    v
                };
            }
        }

        Ok(Self {
            ptdf,
            lodf,
            non_representable,
            nbus,
            nbr,
        })
    }

    pub fn nbus(&self) -> usize {
        self.nbus
    }

    pub fn nbr(&self) -> usize {
        self.nbr
    }

    /// Linear branch flows (MW) for a bus injection vector (MW), with HVDC
    /// transfers superposed at their terminals.
    pub fn get_flows(&self, p_bus_mw: &[f64], nc: &NumericalCircuit) -> Vec<f64> {
        let mut p = p_bus_mw.to_vec();
        let h = &nc.hvdc_data;
        for i in 0..h.len() {
            if h.active[i] {
                p[h.f[i]] -= h.pset[i];
                p[h.t[i]] += h.pset[i];
            }
        }
        self.ptdf
            .iter()
            .map(|row| row.iter().zip(p.iter()).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Post-outage flow on `m` after tripping `c`:
    /// `Sf_m + LODF[m,c] · Sf_c`.
    pub fn post_outage_flow(&self, flows: &[f64], m: usize, c: usize) -> f64 {
        flows[m] + self.lodf[m][c] * flows[c]
    }

    /// Multi-contingency linear composition: the first-order flow change of
    /// several simultaneous branch outages is the sum of their LODF terms.
    pub fn multi_outage_flow(&self, flows: &[f64], m: usize, outaged: &[usize]) -> f64 {
        let mut f = flows[m];
        for &c in outaged {
            if c != m {
                f += self.lodf[m][c] * flows[c];
            }
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_numerical_circuit_at;
    use vera_core::{Branch, Bus, Gen, Load, MultiCircuit};

    fn triangle() -> NumericalCircuit {
        let mut grid = MultiCircuit::new("tri");
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        let b3 = grid.add_bus(Bus::new("B3", 132.0));
        grid.add_branch(Branch::line("L12", b1, b2, 0.0, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L23", b2, b3, 0.0, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L13", b1, b3, 0.0, 0.2).with_rating(100.0));
        grid.add_generator(b1, Gen::new("G", 0.0));
        grid.add_load(b3, Load::new("Ld", 60.0, 0.0));
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        nc.split_into_islands(true, &mut log).remove(0)
    }

    #[test]
    fn test_slack_column_is_zero() {
        let nc = triangle();
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let slack = nc.slack_index().unwrap();
        for k in 0..lin.nbr() {
            assert_eq!(lin.ptdf[k][slack], 0.0);
        }
    }

    #[test]
    fn test_lodf_diagonal_is_minus_one() {
        let nc = triangle();
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        for c in 0..lin.nbr() {
            assert_eq!(lin.lodf[c][c], -1.0);
        }
    }

    #[test]
    fn test_lodf_matches_resolve() {
        // tripping L23 forces all of bus-3 demand through L13:
        // linear identity Sf_m + LODF·Sf_c must match the re-solved grid
        let nc = triangle();
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let p = nc.real_power_injections();
        let flows = lin.get_flows(&p, &nc);

        let mut nc_out = nc.clone();
        nc_out.passive_branch_data.active[1] = false; // trip L23
        let mut log2 = Logger::new();
        let lin_out =
            LinearAnalysis::new(&nc_out, &LinearAnalysisOptions::default(), &mut log2).unwrap();
        let flows_out = lin_out.get_flows(&p, &nc_out);

        for m in [0usize, 2] {
            let predicted = lin.post_outage_flow(&flows, m, 1);
            assert!(
                (predicted - flows_out[m]).abs() < 1e-9,
                "branch {m}: predicted {predicted}, resolved {}",
                flows_out[m]
            );
        }
    }

    #[test]
    fn test_radial_outage_non_representable() {
        // a radial spur: tripping it islands the load
        let mut grid = MultiCircuit::new("radial");
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        let b3 = grid.add_bus(Bus::new("B3", 132.0));
        grid.add_branch(Branch::line("L12", b1, b2, 0.0, 0.1));
        grid.add_branch(Branch::line("L23", b2, b3, 0.0, 0.1));
        grid.add_generator(b1, Gen::new("G", 0.0));
        grid.add_load(b3, Load::new("Ld", 10.0, 0.0));
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        let island = nc.split_into_islands(true, &mut log).remove(0);

        let lin =
            LinearAnalysis::new(&island, &LinearAnalysisOptions::default(), &mut log).unwrap();
        // both branches are radial here
        assert_eq!(lin.non_representable.len(), 2);
        assert!(log.warnings().count() >= 2);
        // zeroed column apart from the diagonal
        assert_eq!(lin.lodf[0][1], 0.0);
        assert_eq!(lin.lodf[1][1], -1.0);
    }

    #[test]
    fn test_distributed_slack_rows_sum_to_zero() {
        let nc = triangle();
        let mut log = Logger::new();
        let options = LinearAnalysisOptions {
            distributed_slack: true,
            ..Default::default()
        };
        let lin = LinearAnalysis::new(&nc, &options, &mut log).unwrap();
        for row in &lin.ptdf {
            let sum: f64 = row.iter().sum();
            assert!(sum.abs() < 1e-9);
        }
    }
}
