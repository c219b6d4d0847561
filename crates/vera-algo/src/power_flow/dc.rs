//! Linear (DC) power flow.
//!
//! Classic approximations: flat voltage magnitudes, small angles, lossless
//! branches. With the slack angle pinned to zero, `B·θ = P` is one sparse
//! solve and the branch flows follow as `Pf = (θ_F − θ_T − φ) / (x·m)`.
//! No iteration is involved.

use super::{IslandResults, PowerFlowOptions};
use crate::compiler::{BusType, NumericalCircuit};
use crate::sparse::{from_triplets, solve_sparse};
use num_complex::Complex64;
use vera_core::{DriverHarness, VgResult};

/// Solve one island with the DC approximation.
pub fn solve_island_dc(
    nc: &NumericalCircuit,
    _options: &PowerFlowOptions,
    harness: &mut DriverHarness,
) -> VgResult<IslandResults> {
    let nbus = nc.nbus();
    let br = &nc.passive_branch_data;
    let slack = nc.slack_index().unwrap_or(0);

    // reduced index map without the slack
    let mut red_of = vec![usize::MAX; nbus];
    let mut n_red = 0;
    for i in 0..nbus {
        if i != slack {
            red_of[i] = n_red;
            n_red += 1;
        }
    }

    // susceptance matrix from 1/(x·m), with the phase-shift injections
    // moved to the right-hand side
    let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
    let mut p_shift = vec![0.0; nbus];
    for k in 0..br.len() {
        if !br.active[k] {
            continue;
        }
        let f = br.f[k];
        let t = br.t[k];
        if !nc.bus_data.active[f] || !nc.bus_data.active[t] {
            continue;
        }
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
        // a phase shifter injects ±φ·b at its terminals
        let shift = br.tap_phase[k];
        if shift != 0.0 {
            p_shift[f] -= shift * b;
            p_shift[t] += shift * b;
        }
    }

    let p_inj: Vec<f64> = nc
        .real_power_injections()
        .iter()
        .map(|p| p / nc.sbase)
        .collect();

    let mut rhs = vec![0.0; n_red];
    for i in 0..nbus {
        if red_of[i] != usize::MAX {
            rhs[red_of[i]] = p_inj[i] - p_shift[i];
        }
    }

    let theta_red = if n_red > 0 {
        let b_mat = from_triplets(n_red, n_red, &triplets);
        solve_sparse(&b_mat, &rhs)?
    } else {
        Vec::new()
    };

    let mut theta = vec![0.0; nbus];
    for i in 0..nbus {
        if red_of[i] != usize::MAX {
            theta[i] = theta_red[red_of[i]];
        }
    }

    let voltage: Vec<Complex64> = theta
        .iter()
        .map(|&a| Complex64::from_polar(1.0, a))
        .collect();

    // branch real flows
    let nbr = br.len();
    let mut sf = vec![Complex64::new(0.0, 0.0); nbr];
    let mut st = vec![Complex64::new(0.0, 0.0); nbr];
    for k in 0..nbr {
        if !br.active[k] {
            continue;
        }
        let x = br.x[k].abs().max(1e-6);
        let pf = (theta[br.f[k]] - theta[br.t[k]] - br.tap_phase[k]) / (x * br.tap_module[k]);
        sf[k] = Complex64::new(pf * nc.sbase, 0.0);
        st[k] = -sf[k];
    }

    // slack picks up the balance
    let mut sbus: Vec<Complex64> = p_inj
        .iter()
        .map(|&p| Complex64::new(p * nc.sbase, 0.0))
        .collect();
    let balance: f64 = p_inj.iter().sum::<f64>() * nc.sbase;
    sbus[slack] -= Complex64::new(balance, 0.0);

    harness.report_text("linear power flow solved");

    Ok(IslandResults {
        converged: true,
        iterations: 1,
        error: 0.0,
        voltage,
        sbus,
        sf,
        st,
        bus_types: nc.bus_data.bus_types.clone(),
        gen_q: vec![0.0; nc.generator_data.len()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_numerical_circuit_at;
    use vera_core::{Branch, Bus, Gen, Load, Logger, MultiCircuit};

    #[test]
    fn test_two_bus_dc() {
        let mut grid = MultiCircuit::new("dc2");
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        grid.add_branch(Branch::line("L", b1, b2, 0.0, 0.1).with_rating(100.0));
        grid.add_generator(b1, Gen::new("G", 0.0));
        grid.add_load(b2, Load::new("Ld", 50.0, 0.0));

        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        let islands = nc.split_into_islands(true, &mut log);
        let mut harness = DriverHarness::new();
        let res =
            solve_island_dc(&islands[0], &PowerFlowOptions::default(), &mut harness).unwrap();

        assert!(res.converged);
        // θ2 = −P·x = −0.05 rad; Pf = 50 MW exactly
        assert!((res.voltage[1].arg() + 0.05).abs() < 1e-9);
        assert!((res.sf[0].re - 50.0).abs() < 1e-9);
        // |V| = 1 everywhere in DC
        assert!(res.voltage.iter().all(|v| (v.norm() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_flow_split_in_parallel_paths() {
        // two parallel lines with x and 2x: flows split 2:1
        let mut grid = MultiCircuit::new("par");
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        grid.add_branch(Branch::line("La", b1, b2, 0.0, 0.1));
        grid.add_branch(Branch::line("Lb", b1, b2, 0.0, 0.2));
        grid.add_generator(b1, Gen::new("G", 0.0));
        grid.add_load(b2, Load::new("Ld", 90.0, 0.0));

        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        let islands = nc.split_into_islands(true, &mut log);
        let mut harness = DriverHarness::new();
        let res =
            solve_island_dc(&islands[0], &PowerFlowOptions::default(), &mut harness).unwrap();

        assert!((res.sf[0].re - 60.0).abs() < 1e-9);
        assert!((res.sf[1].re - 30.0).abs() < 1e-9);
    }
}
