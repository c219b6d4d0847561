//! Ward (standard) equivalent.
//!
//! With the admittance matrix sliced over the external/boundary partition
//! and the pre-reduction voltages `V⁰`:
//! ```text
//!   Y_eq = Y_BE · Y_EE⁻¹ · Y_EB
//!   I_eq = −Y_BE · Y_EE⁻¹ · (Y_EB·V_B + Y_EE·V_E)
//!   S_eq = V_B ⊙ conj(I_eq) · Sbase
//! ```
//! The equivalent lands at the boundary as a shunt per bus (row sum of
//! `Y_eq`), a series reactance per off-diagonal pair (upper triangle), and
//! a compensation load carrying `S_eq`; the external buses then disappear.
//!
//! Reference: Bandler, El-Kady & Centkowski, "Review of the Ward class of
//! external equivalents for power systems" (1983).

use super::get_reduction_sets;
use crate::admittance::build_admittances;
use crate::compiler::compile_numerical_circuit_at;
use crate::sparse::{dense_solve_cx, slice_dense_cx};
use num_complex::Complex64;
use vera_core::{Branch, Load, Logger, MultiCircuit, Shunt, VgError, VgResult};

/// Tikhonov fallback weight when `Y_EE` is numerically singular.
const REGULARIZATION: f64 = 1e-8;

/// Reduce `grid` in place, eliminating the buses at `reduction_bus_indices`
/// while preserving the flows seen by the retained set. `v0` are the
/// pre-reduction voltages (one per bus, p.u.).
pub fn ward_standard_reduction(
    grid: &mut MultiCircuit,
    reduction_bus_indices: &[usize],
    v0: &[Complex64],
    logger: &mut Logger,
) -> VgResult<()> {
    let nc = compile_numerical_circuit_at(grid, None)?;
    if v0.len() != nc.nbus() {
        return Err(VgError::MalformedGrid(format!(
            "voltage vector length {} != bus count {}",
            v0.len(),
            nc.nbus()
        )));
    }

    let sets = get_reduction_sets(&nc, reduction_bus_indices);
    let ne = sets.external.len();
    let nb = sets.boundary.len();

    if ne == 0 {
        logger.add_info("nothing to reduce");
        return Ok(());
    }
    if sets.internal.is_empty() {
        logger.add_info("nothing to keep, reduction skipped");
        return Ok(());
    }
    if nb == 0 {
        logger.add_info("external and retained sets are disjoint, reduction skipped");
        return Ok(());
    }

    let adm = build_admittances(&nc);
    let y_be = slice_dense_cx(&adm.ybus, &sets.boundary, &sets.external);
    let y_eb = slice_dense_cx(&adm.ybus, &sets.external, &sets.boundary);
    let y_ee = slice_dense_cx(&adm.ybus, &sets.external, &sets.external);

    let v_b: Vec<Complex64> = sets.boundary.iter().map(|&i| v0[i]).collect();
    let v_e: Vec<Complex64> = sets.external.iter().map(|&i| v0[i]).collect();

    // rhs = [Y_EB | I_E], both solved through the same Y_EE factorization
    // I_E = Y_EB·V_B + Y_EE·V_E
    let mut i_e = vec![Complex64::new(0.0, 0.0); ne];
    for i in 0..ne {
        for j in 0..nb {
            i_e[i] += y_eb[i][j] * v_b[j];
        }
        for j in 0..ne {
            i_e[i] += y_ee[i][j] * v_e[j];
        }
    }
    let mut rhs: Vec<Vec<Complex64>> = (0..ne)
        .map(|i| {
            let mut row = y_eb[i].clone();
            row.push(i_e[i]);
            row
        })
        .collect();

    if dense_solve_cx(&y_ee, &mut rhs).is_err() {
        // fall back to a regularized solve
        logger.add_warning(
            "Y_EE is numerically singular; using a regularized (pseudo-inverse) solve",
        );
        let mut y_reg = y_ee.clone();
        for (i, row) in y_reg.iter_mut().enumerate() {
            row[i] += Complex64::new(REGULARIZATION, 0.0);
        }
        rhs = (0..ne)
            .map(|i| {
                let mut row = y_eb[i].clone();
                row.push(i_e[i]);
                row
            })
            .collect();
        dense_solve_cx(&y_reg, &mut rhs)?;
    }

    // Y_eq = Y_BE · (Y_EE⁻¹ Y_EB);  I_eq = −Y_BE · (Y_EE⁻¹ I_E)
    let mut y_eq = vec![vec![Complex64::new(0.0, 0.0); nb]; nb];
    let mut i_eq = vec![Complex64::new(0.0, 0.0); nb];
    for i in 0..nb {
        for e in 0..ne {
            let ybe = y_be[i][e];
            for j in 0..nb {
                y_eq[i][j] += ybe * rhs[e][j];
            }
            i_eq[i] -= ybe * rhs[e][nb];
        }
    }

    // S_eq = V_B ⊙ conj(I_eq) in MVA
    let s_eq: Vec<Complex64> = (0..nb)
        .map(|i| v_b[i] * i_eq[i].conj() * grid.sbase)
        .collect();

    // boundary bus ids before any deletion
    let boundary_ids: Vec<vera_core::BusId> = sets
        .boundary
        .iter()
        .map(|&i| grid.buses[i].id)
        .collect();

    // (a) shunts: diagonal minus the off-diagonal row sum
    for i in 0..nb {
        let mut off_sum = Complex64::new(0.0, 0.0);
        for j in 0..nb {
            if j != i {
                off_sum += y_eq[i][j];
            }
        }
        let ysh = y_eq[i][i] - off_sum;
        if ysh.norm() > 1e-12 {
            grid.add_shunt(
                boundary_ids[i],
                Shunt::new(
                    format!("ward_shunt_{}", grid.buses[sets.boundary[i]].name),
                    ysh.re * grid.sbase,
                    ysh.im * grid.sbase,
                ),
            );
        }
    }

    // (b) series reactances for the upper-triangular off-diagonal pairs
    for i in 0..nb {
        for j in 0..i {
            let y = y_eq[i][j];
            if y.norm() < 1e-12 {
                continue;
            }
            let z = y.inv();
            grid.add_branch(
                Branch::series_reactance(
                    format!(
                        "ward_eq_{}_{}",
                        grid.buses[sets.boundary[i]].name, grid.buses[sets.boundary[j]].name
                    ),
                    boundary_ids[i],
                    boundary_ids[j],
                    z.re,
                    z.im,
                )
                .with_rating(9999.0),
            );
        }
    }

    // (c) compensation loads carrying S_eq
    for i in 0..nb {
        grid.add_load(
            boundary_ids[i],
            Load::new(
                format!("ward_comp_{}", grid.buses[sets.boundary[i]].name),
                s_eq[i].re,
                s_eq[i].im,
            ),
        );
    }

    // delete the external buses (cascades to their devices)
    let external_ids: Vec<vera_core::BusId> =
        sets.external.iter().map(|&i| grid.buses[i].id).collect();
    for id in external_ids {
        grid.delete_bus(id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_flow::{PowerFlowDriver, PowerFlowOptions};
    use vera_core::{Bus, Gen};

    /// Four-bus chain with the last bus external. The equivalent must keep
    /// the internal flows within 0.5 % of their pre-reduction values.
    #[test]
    fn test_ward_preserves_internal_flows() {
        let mut grid = MultiCircuit::new("ward4");
        let b: Vec<_> = (0..4)
            .map(|i| {
                let mut bus = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    bus = bus.as_slack();
                }
                grid.add_bus(bus)
            })
            .collect();
        grid.add_branch(Branch::line("L01", b[0], b[1], 0.01, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L12", b[1], b[2], 0.01, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L23", b[2], b[3], 0.01, 0.1).with_rating(100.0));
        grid.add_generator(b[0], Gen::new("G", 0.0).with_vset(1.0));
        grid.add_load(b[1], Load::new("Ld1", 20.0, 5.0));
        grid.add_load(b[3], Load::new("Ld3", 15.0, 3.0));

        // pre-reduction power flow
        let mut pre = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
        pre.run().unwrap();
        let pre_res = pre.results.unwrap();
        assert!(pre_res.converged);
        let pf_l01_pre = pre_res.sf[0].re;
        let pf_l12_pre = pre_res.sf[1].re;

        // reduce bus 3
        let mut logger = Logger::new();
        ward_standard_reduction(&mut grid, &[3], &pre_res.voltage, &mut logger).unwrap();
        assert_eq!(grid.bus_count(), 3);
        // the external load went away, a compensation load appeared
        assert!(grid.loads.iter().any(|l| l.name.starts_with("ward_comp")));

        // post-reduction power flow on the reduced grid
        let mut post = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
        post.run().unwrap();
        let post_res = post.results.unwrap();
        assert!(post_res.converged);

        let pf_l01_post = post_res.sf[0].re;
        let pf_l12_post = post_res.sf[1].re;
        assert!(
            (pf_l01_post - pf_l01_pre).abs() < 0.005 * pf_l01_pre.abs(),
            "L01: {pf_l01_pre} -> {pf_l01_post}"
        );
        assert!(
            (pf_l12_post - pf_l12_pre).abs() < 0.005 * pf_l12_pre.abs(),
            "L12: {pf_l12_pre} -> {pf_l12_post}"
        );
    }

    #[test]
    fn test_ward_single_boundary_identity() {
        // E = {bus3} behind a single boundary bus: the shunt equals the
        // boundary-external admittance composition analytically
        let mut grid = MultiCircuit::new("ward-scalar");
        let b: Vec<_> = (0..3)
            .map(|i| {
                let mut bus = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    bus = bus.as_slack();
                }
                grid.add_bus(bus)
            })
            .collect();
        grid.add_branch(Branch::line("L01", b[0], b[1], 0.0, 0.2));
        grid.add_branch(Branch::line("L12", b[1], b[2], 0.0, 0.4));
        grid.add_generator(b[0], Gen::new("G", 0.0));
        grid.add_load(b[2], Load::new("Ld", 10.0, 0.0));

        let mut pre = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
        pre.run().unwrap();
        let v0 = pre.results.unwrap().voltage;
        let mut logger = Logger::new();
        ward_standard_reduction(&mut grid, &[2], &v0, &mut logger).unwrap();

        // single boundary bus (B1): Y_eq = Y_BE Y_EE⁻¹ Y_EB
        // Y_BE = Y_EB = -1/z, Y_EE = 1/z -> Y_eq = -1/z... net shunt is
        // Y_eq row sum = Y_eq[0][0] = y_be*y_eb/y_ee = 1/z * (-1)*(-1)...
        let y = Complex64::new(0.0, 0.4).inv();
        let expected = (-y) * y.inv() * (-y); // = y
        let shunt = grid
            .shunts
            .iter()
            .find(|s| s.name.starts_with("ward_shunt"))
            .expect("equivalent shunt");
        assert!((shunt.b.value() / grid.sbase - expected.im).abs() < 1e-9);

        // lossless lines: the compensation load carries the external 10 MW
        let comp = grid
            .loads
            .iter()
            .find(|l| l.name.starts_with("ward_comp"))
            .expect("compensation load");
        assert!(
            (comp.p.value() - 10.0).abs() < 1e-3,
            "comp P = {}",
            comp.p.value()
        );
    }

    #[test]
    fn test_nothing_to_reduce() {
        let mut grid = MultiCircuit::new("noop");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        grid.add_generator(b0, Gen::new("G", 0.0));
        let v0 = vec![Complex64::new(1.0, 0.0)];
        let mut logger = Logger::new();
        ward_standard_reduction(&mut grid, &[], &v0, &mut logger).unwrap();
        assert_eq!(grid.bus_count(), 1);
    }
}
