//! Fast linear N−1 contingency scan.
//!
//! The hot loop of contingency screening: for every monitored branch `m`
//! and every single-branch contingency `c`,
//! ```text
//!   Sf_c[m] = Sbr0[m] + LODF[m,c] · Sbr0[c]
//! ```
//! against the contingency rating. The outer loop over monitored branches
//! is data-parallel; each worker produces the full row for its branch, so
//! writes never overlap and the output is deterministic for any worker
//! count.

use super::LinearAnalysis;
use crate::compiler::NumericalCircuit;
use serde::{Deserialize, Serialize};

/// One overload found by the scan. `contingency = None` marks a
/// pre-contingency (base case) overload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverloadRecord {
    /// Monitored branch index
    pub branch: usize,
    /// Outaged branch index, or `None` for the base case
    pub contingency: Option<usize>,
    /// Flow after the outage (MW)
    pub flow_mw: f64,
    /// Flow over the applicable rating
    pub loading: f64,
}

/// Scan output: per (contingency, monitored branch) flows and loadings,
/// plus the overload report.
#[derive(Debug, Clone)]
pub struct LinearScanResults {
    /// Contingency branch indices, one per scanned outage
    pub contingency_branches: Vec<usize>,
    /// `flows[c][m]`: post-outage flow (MW), row per contingency
    pub flows: Vec<Vec<f64>>,
    /// `loadings[c][m]`: `flow / contingency_rate`
    pub loadings: Vec<Vec<f64>>,
    pub overloads: Vec<OverloadRecord>,
}

/// Run the scan. `mon_idx` are the monitored branch indices,
/// `con_idx` the candidate single-branch contingencies.
pub fn linear_contingency_scan(
    nc: &NumericalCircuit,
    lin: &LinearAnalysis,
    p_bus_mw: &[f64],
    mon_idx: &[usize],
    con_idx: &[usize],
) -> LinearScanResults {
    let sbr0 = lin.get_flows(p_bus_mw, nc);

    // per monitored branch: one row of post-contingency flows + overloads
    let per_branch: Vec<(usize, Vec<f64>, Vec<f64>, Vec<OverloadRecord>)> =
        scan_rows(nc, lin, &sbr0, mon_idx, con_idx);

    // reshape rows (per m) into contingency-major matrices
    let ncon = con_idx.len();
    let nbr = nc.nbr();
    let mut flows = vec![vec![0.0; nbr]; ncon];
    let mut loadings = vec![vec![0.0; nbr]; ncon];
    let mut overloads = Vec::new();
    for (m, row_flows, row_loadings, row_over) in per_branch {
        for ci in 0..ncon {
            flows[ci][m] = row_flows[ci];
            loadings[ci][m] = row_loadings[ci];
        }
        overloads.extend(row_over);
    }
    // deterministic report order
    overloads.sort_by(|a, b| (a.branch, a.contingency).cmp(&(b.branch, b.contingency)));

    LinearScanResults {
        contingency_branches: con_idx.to_vec(),
        flows,
        loadings,
        overloads,
    }
}

fn scan_one(
    nc: &NumericalCircuit,
    lin: &LinearAnalysis,
    sbr0: &[f64],
    m: usize,
    con_idx: &[usize],
) -> (usize, Vec<f64>, Vec<f64>, Vec<OverloadRecord>) {
    let br = &nc.passive_branch_data;
    let rate = br.rates[m];
    let con_rate = if br.contingency_rates[m] > 0.0 {
        br.contingency_rates[m]
    } else {
        rate
    };
    let mut row_flows = vec![0.0; con_idx.len()];
    let mut row_loadings = vec![0.0; con_idx.len()];
    let mut over = Vec::new();

    if rate > 0.0 && sbr0[m].abs() > rate {
        // already overloaded before any outage
        over.push(OverloadRecord {
            branch: m,
            contingency: None,
            flow_mw: sbr0[m],
            loading: sbr0[m].abs() / rate,
        });
        for ci in 0..con_idx.len() {
            row_flows[ci] = sbr0[m];
            row_loadings[ci] = sbr0[m] / (rate + 1e-9);
        }
        return (m, row_flows, row_loadings, over);
    }

    for (ci, &c) in con_idx.iter().enumerate() {
        let sf_c = if c == m {
            0.0
        } else {
            sbr0[m] + lin.lodf[m][c] * sbr0[c]
        };
        row_flows[ci] = sf_c;
        row_loadings[ci] = sf_c / (con_rate + 1e-9);
        if con_rate > 0.0 && sf_c.abs() > con_rate {
            over.push(OverloadRecord {
                branch: m,
                contingency: Some(c),
                flow_mw: sf_c,
                loading: sf_c.abs() / con_rate,
            });
        }
    }
    (m, row_flows, row_loadings, over)
}

#[cfg(feature = "parallel")]
fn scan_rows(
    nc: &NumericalCircuit,
    lin: &LinearAnalysis,
    sbr0: &[f64],
    mon_idx: &[usize],
    con_idx: &[usize],
) -> Vec<(usize, Vec<f64>, Vec<f64>, Vec<OverloadRecord>)> {
    use rayon::prelude::*;
    mon_idx
        .par_iter()
        .map(|&m| scan_one(nc, lin, sbr0, m, con_idx))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn scan_rows(
    nc: &NumericalCircuit,
    lin: &LinearAnalysis,
    sbr0: &[f64],
    mon_idx: &[usize],
    con_idx: &[usize],
) -> Vec<(usize, Vec<f64>, Vec<f64>, Vec<OverloadRecord>)> {
    mon_idx
        .iter()
        .map(|&m| scan_one(nc, lin, sbr0, m, con_idx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_numerical_circuit_at;
    use crate::linear::LinearAnalysisOptions;
    use vera_core::{Branch, Bus, Gen, Load, Logger, MultiCircuit};

    fn ring(n: usize, rate: f64) -> NumericalCircuit {
        let mut grid = MultiCircuit::new("ring");
        let buses: Vec<_> = (0..n)
            .map(|i| {
                let mut b = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    b = b.as_slack();
                }
                grid.add_bus(b)
            })
            .collect();
        for i in 0..n {
            let j = (i + 1) % n;
            grid.add_branch(
                Branch::line(format!("L{i}"), buses[i], buses[j], 0.0, 0.1).with_rating(rate),
            );
        }
        grid.add_generator(buses[0], Gen::new("G", 0.0));
        grid.add_load(buses[n / 2], Load::new("Ld", 80.0, 0.0));
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        nc.split_into_islands(true, &mut log).remove(0)
    }

    #[test]
    fn test_scan_matches_linear_identity() {
        let nc = ring(10, 100.0);
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let p = nc.real_power_injections();
        let sbr0 = lin.get_flows(&p, &nc);

        let mon: Vec<usize> = (0..nc.nbr()).collect();
        let con: Vec<usize> = (0..nc.nbr()).collect();
        let res = linear_contingency_scan(&nc, &lin, &p, &mon, &con);

        // exact linear algebra identity, to 1e-9
        for (ci, &c) in con.iter().enumerate() {
            for &m in &mon {
                if m == c {
                    continue;
                }
                let expected = sbr0[m] + lin.lodf[m][c] * sbr0[c];
                assert!(
                    (res.flows[ci][m] - expected).abs() < 1e-9,
                    "m={m} c={c}: {} vs {expected}",
                    res.flows[ci][m]
                );
            }
        }
    }

    #[test]
    fn test_scan_finds_post_contingency_overloads() {
        // a ring loaded near the limit: dropping one line overloads another
        let nc = ring(6, 45.0);
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let p = nc.real_power_injections();
        let mon: Vec<usize> = (0..nc.nbr()).collect();
        let con: Vec<usize> = (0..nc.nbr()).collect();
        let res = linear_contingency_scan(&nc, &lin, &p, &mon, &con);

        assert!(
            !res.overloads.is_empty(),
            "expected post-contingency overloads on a ring near its limit"
        );
        for o in &res.overloads {
            assert!(o.loading > 1.0);
        }
    }

    #[test]
    fn test_base_case_overload_recorded() {
        let nc = ring(4, 10.0); // far below the 80 MW demand
        let mut log = Logger::new();
        let lin = LinearAnalysis::new(&nc, &LinearAnalysisOptions::default(), &mut log).unwrap();
        let p = nc.real_power_injections();
        let mon: Vec<usize> = (0..nc.nbr()).collect();
        let con: Vec<usize> = (0..nc.nbr()).collect();
        let res = linear_contingency_scan(&nc, &lin, &p, &mon, &con);
        assert!(res
            .overloads
            .iter()
            .any(|o| o.contingency.is_none()));
    }
}
