//! Newton–Raphson positive-sequence power flow.
//!
//! Mismatch `F(x) = S_calc(V) − S_spec`, unknowns `x = (θ_non-slack, |V|_PQ)`.
//! The Jacobian is assembled analytically from the sparse `Ybus` pattern
//! (no finite differences):
//!
//! ```text
//!   ∂P_i/∂θ_j = V_i V_j (G_ij sin θ_ij − B_ij cos θ_ij)      (j ≠ i)
//!   ∂P_i/∂θ_i = −Q_i − B_ii V_i²
//!   ∂P_i/∂V_j = V_i (G_ij cos θ_ij + B_ij sin θ_ij)          (j ≠ i)
//!   ∂P_i/∂V_i = P_i/V_i + G_ii V_i
//!   ∂Q_i/∂θ_j = −V_i V_j (G_ij cos θ_ij + B_ij sin θ_ij)     (j ≠ i)
//!   ∂Q_i/∂θ_i = P_i − G_ii V_i²
//!   ∂Q_i/∂V_j = V_i (G_ij sin θ_ij − B_ij cos θ_ij)          (j ≠ i)
//!   ∂Q_i/∂V_i = Q_i/V_i − B_ii V_i
//! ```
//!
//! Controls run at iteration boundaries in a bounded outer loop:
//! reactive limits (PV↔PQ with recovery), discrete tap modules, and
//! remote-voltage coalescing. A backtracking line search halves the Newton
//! step (up to depth 4) whenever the new mismatch exceeds the previous one
//! by more than the configured factor.
//!
//! Reference: Tinney & Hart, "Power Flow Solution by Newton's Method",
//! IEEE Trans. PAS-86 (1967). DOI: 10.1109/TPAS.1967.291823

use super::{IslandResults, PowerFlowOptions};
use crate::admittance::{build_admittances, AdmittanceMatrices};
use crate::compiler::{BusType, NumericalCircuit};
use crate::sparse::{csr_mat_vec_cx, factorize, lu_solve};
use num_complex::Complex64;
use sprs::TriMat;
use std::collections::HashMap;
use vera_core::{DriverHarness, Severity, VgResult};

const BACKTRACK_DEPTH: usize = 4;
const TAP_STEP: f64 = 0.00625;
const TAP_MIN: f64 = 0.9;
const TAP_MAX: f64 = 1.1;

/// Solve one island. `flat_start` forces |V| = 1 ∠0 everywhere.
pub fn solve_island_newton(
    nc: &NumericalCircuit,
    options: &PowerFlowOptions,
    flat_start: bool,
    harness: &mut DriverHarness,
) -> VgResult<IslandResults> {
    let mut nc_work = nc.clone(); // taps may move
    let nbus = nc_work.nbus();

    // per-bus voltage set points from controlling machines
    let mut vset = vec![1.0; nbus];
    let mut bus_types = nc_work.bus_data.bus_types.clone();
    apply_voltage_setpoints(&nc_work, options, &mut vset, &mut bus_types, harness);

    // initial state
    let mut vm: Vec<f64> = (0..nbus)
        .map(|i| {
            if !flat_start && bus_types[i] != BusType::PQ {
                vset[i]
            } else {
                1.0
            }
        })
        .collect();
    let mut va = vec![0.0; nbus];

    let mut s_spec: Vec<Complex64> = nc_work
        .power_injections()
        .iter()
        .map(|s| *s / nc_work.sbase)
        .collect();

    // generator Q limits aggregated per bus (p.u.)
    let (qmin_bus, qmax_bus) = aggregate_q_limits(&nc_work);

    let mut adm = build_admittances(&nc_work);
    let mut iterations_total = 0;
    let mut error = f64::INFINITY;
    let mut converged = false;
    // Qmax-limited buses eligible to recover PV status
    let mut q_limited: HashMap<usize, f64> = HashMap::new();

    for _outer in 0..options.max_outer_loop.max(1) {
        if harness.is_cancelled() {
            break;
        }

        let inner = newton_inner(
            &adm, &s_spec, &bus_types, &mut vm, &mut va, options,
        )?;
        iterations_total += inner.iterations;
        error = inner.error;
        converged = inner.converged;

        if !converged {
            break;
        }

        let mut switched = false;

        // 1. reactive limits on PV buses
        if options.control_q {
            let scalc = calc_power(&adm, &vm, &va);
            for i in 0..nbus {
                match bus_types[i] {
                    BusType::PV => {
                        let q = scalc[i].im;
                        if q > qmax_bus[i] {
                            bus_types[i] = BusType::PQ;
                            s_spec[i] = Complex64::new(s_spec[i].re, qmax_bus[i]);
                            q_limited.insert(i, qmax_bus[i]);
                            switched = true;
                            harness.logger.add_device_entry(
                                Severity::Info,
                                nc_work.bus_data.uid[i],
                                format!("PV→PQ at Qmax ({:.2} p.u.)", qmax_bus[i]),
                            );
                        } else if q < qmin_bus[i] {
                            bus_types[i] = BusType::PQ;
                            s_spec[i] = Complex64::new(s_spec[i].re, qmin_bus[i]);
                            q_limited.insert(i, qmin_bus[i]);
                            switched = true;
                            harness.logger.add_device_entry(
                                Severity::Info,
                                nc_work.bus_data.uid[i],
                                format!("PV→PQ at Qmin ({:.2} p.u.)", qmin_bus[i]),
                            );
                        }
                    }
                    BusType::PQ => {
                        // recovery: a limited bus whose voltage moved past the
                        // set point again has headroom
                        if let Some(&qfix) = q_limited.get(&i) {
                            let recovers = (qfix == qmax_bus[i] && vm[i] > vset[i])
                                || (qfix == qmin_bus[i] && vm[i] < vset[i]);
                            if recovers {
                                bus_types[i] = BusType::PV;
                                vm[i] = vset[i];
                                q_limited.remove(&i);
                                switched = true;
                            }
                        }
                    }
                    BusType::Slack => {}
                }
            }
        }

        // 2. discrete tap-module control toward the to-side voltage target
        if options.control_taps_modules {
            let br = &mut nc_work.passive_branch_data;
            let mut tap_moved = false;
            for k in 0..br.len() {
                if !br.active[k] || !br.tap_module_control[k] {
                    continue;
                }
                let vt = vm[br.t[k]];
                let target = br.tap_vset[k];
                if (vt - target).abs() < 2.0 * TAP_STEP {
                    continue;
                }
                let old = br.tap_module[k];
                // raising the tap lowers the to-side voltage
                let new = if vt > target { old + TAP_STEP } else { old - TAP_STEP };
                let new = new.clamp(TAP_MIN, TAP_MAX);
                if (new - old).abs() > 0.0 {
                    br.tap_module[k] = new;
                    tap_moved = true;
                }
            }
            if tap_moved {
                adm = build_admittances(&nc_work);
                switched = true;
            }
        }

        // 3. continuous phase control toward the from-side power target
        if options.control_taps_phase {
            let voltage: Vec<Complex64> = (0..nbus)
                .map(|i| Complex64::from_polar(vm[i], va[i]))
                .collect();
            let (sf, _) = branch_flows_of(&nc_work, &adm, &voltage);
            let br = &mut nc_work.passive_branch_data;
            let mut phase_moved = false;
            for k in 0..br.len() {
                if !br.active[k] || !br.tap_phase_control[k] {
                    continue;
                }
                let pf = sf[k].re;
                let target = br.tap_pset[k];
                if (pf - target).abs() < 0.5 {
                    continue;
                }
                // dPf/dφ ≈ -V²/x on the system base
                let x = br.x[k].abs().max(1e-6);
                let sens = -nc_work.sbase / x;
                let step = ((target - pf) / sens).clamp(-0.05, 0.05);
                if step.abs() > 1e-6 {
                    br.tap_phase[k] += step;
                    phase_moved = true;
                }
            }
            if phase_moved {
                adm = build_admittances(&nc_work);
                switched = true;
            }
        }

        if !switched {
            break;
        }
    }

    // distributed slack: move the slack balance onto dispatchable machines
    // proportionally to their nominal power, then one more Newton pass
    if converged && options.distributed_slack {
        if let Some(slack) = bus_types.iter().position(|&t| t == BusType::Slack) {
            let scalc = calc_power(&adm, &vm, &va);
            let delta_mw = (scalc[slack].re - s_spec[slack].re) * nc_work.sbase;
            let g = &mut nc_work.generator_data;
            let total_snom: f64 = (0..g.len())
                .filter(|&i| g.active[i] && g.dispatchable[i] && !g.is_external[i])
                .map(|i| g.snom[i])
                .sum();
            if total_snom > 0.0 && delta_mw.abs() > 1e-6 {
                for i in 0..g.len() {
                    if g.active[i] && g.dispatchable[i] && !g.is_external[i] {
                        g.p[i] += delta_mw * g.snom[i] / total_snom;
                    }
                }
                s_spec = nc_work
                    .power_injections()
                    .iter()
                    .map(|s| *s / nc_work.sbase)
                    .collect();
                let inner = newton_inner(&adm, &s_spec, &bus_types, &mut vm, &mut va, options)?;
                iterations_total += inner.iterations;
                error = inner.error;
                converged = inner.converged;
            }
        }
    }

    // final quantities
    let scalc = calc_power(&adm, &vm, &va);
    let voltage: Vec<Complex64> = (0..nbus)
        .map(|i| Complex64::from_polar(vm[i], va[i]))
        .collect();
    let (sf, st) = branch_flows_of(&nc_work, &adm, &voltage);
    let sbus: Vec<Complex64> = scalc.iter().map(|s| *s * nc_work.sbase).collect();
    let gen_q = allocate_generator_q(&nc_work, &scalc, &bus_types);

    Ok(IslandResults {
        converged,
        iterations: iterations_total,
        error,
        voltage,
        sbus,
        sf,
        st,
        bus_types,
        gen_q,
    })
}

/// Propagate machine voltage set points onto their controlled buses.
/// Remote-voltage control coalesces targets whose controlled bus differs
/// from the machine terminal.
fn apply_voltage_setpoints(
    nc: &NumericalCircuit,
    options: &PowerFlowOptions,
    vset: &mut [f64],
    bus_types: &mut [BusType],
    harness: &mut DriverHarness,
) {
    let g = &nc.generator_data;
    for i in 0..g.len() {
        if !g.active[i] || !g.controllable[i] {
            continue;
        }
        let target = if options.control_remote_voltage {
            g.remote_bus[i].unwrap_or(g.bus[i])
        } else {
            g.bus[i]
        };
        if vset[target] != 1.0 && (vset[target] - g.vset[i]).abs() > 1e-9 {
            harness.logger.add_device_entry(
                Severity::Warning,
                g.uid[i],
                format!(
                    "conflicting voltage set points at bus '{}' ({} vs {})",
                    nc.bus_data.names[target], vset[target], g.vset[i]
                ),
            );
        }
        vset[target] = g.vset[i];
        if bus_types[target] == BusType::PQ {
            bus_types[target] = BusType::PV;
        }
    }
    let b = &nc.battery_data;
    for i in 0..b.len() {
        if b.active[i] {
            vset[b.bus[i]] = b.vset[i];
        }
    }
}

/// Aggregate generator/battery reactive limits per bus (p.u.).
fn aggregate_q_limits(nc: &NumericalCircuit) -> (Vec<f64>, Vec<f64>) {
    let nbus = nc.nbus();
    let mut qmin = vec![0.0; nbus];
    let mut qmax = vec![0.0; nbus];
    let mut has_machine = vec![false; nbus];

    let g = &nc.generator_data;
    for i in 0..g.len() {
        if g.active[i] {
            qmin[g.bus[i]] += g.qmin[i] / nc.sbase;
            qmax[g.bus[i]] += g.qmax[i] / nc.sbase;
            has_machine[g.bus[i]] = true;
        }
    }
    let b = &nc.battery_data;
    for i in 0..b.len() {
        if b.active[i] {
            qmin[b.bus[i]] += b.qmin[i] / nc.sbase;
            qmax[b.bus[i]] += b.qmax[i] / nc.sbase;
            has_machine[b.bus[i]] = true;
        }
    }
    for i in 0..nbus {
        if !has_machine[i] {
            qmin[i] = f64::NEG_INFINITY;
            qmax[i] = f64::INFINITY;
        }
    }
    // loads shift the net bus window
    let l = &nc.load_data;
    for i in 0..l.len() {
        if l.active[i] && has_machine[l.bus[i]] {
            qmin[l.bus[i]] -= l.q[i] / nc.sbase;
            qmax[l.bus[i]] -= l.q[i] / nc.sbase;
        }
    }
    (qmin, qmax)
}

pub(crate) struct InnerResult {
    pub(crate) converged: bool,
    pub(crate) iterations: usize,
    pub(crate) error: f64,
}

/// Plain NR iteration over the current bus classification. Also reused by
/// the unbalanced solver, where each "bus" is one phase node.
pub(crate) fn newton_inner(
    adm: &AdmittanceMatrices,
    s_spec: &[Complex64],
    bus_types: &[BusType],
    vm: &mut [f64],
    va: &mut [f64],
    options: &PowerFlowOptions,
) -> VgResult<InnerResult> {
    let nbus = vm.len();

    let p_idx: Vec<usize> = (0..nbus)
        .filter(|&i| bus_types[i] != BusType::Slack)
        .collect();
    let q_idx: Vec<usize> = (0..nbus)
        .filter(|&i| bus_types[i] == BusType::PQ)
        .collect();
    let n_p = p_idx.len();
    let n_q = q_idx.len();
    let n_vars = n_p + n_q;

    if n_vars == 0 {
        return Ok(InnerResult {
            converged: true,
            iterations: 0,
            error: 0.0,
        });
    }

    let mut row_of_p = vec![usize::MAX; nbus];
    for (k, &i) in p_idx.iter().enumerate() {
        row_of_p[i] = k;
    }
    let mut row_of_q = vec![usize::MAX; nbus];
    for (k, &i) in q_idx.iter().enumerate() {
        row_of_q[i] = k;
    }

    let mismatch_norm = |vm: &[f64], va: &[f64]| -> (Vec<f64>, f64) {
        let scalc = calc_power(adm, vm, va);
        let mut f = vec![0.0; n_vars];
        let mut norm = 0.0f64;
        for (k, &i) in p_idx.iter().enumerate() {
            f[k] = s_spec[i].re - scalc[i].re;
            norm = norm.max(f[k].abs());
        }
        for (k, &i) in q_idx.iter().enumerate() {
            f[n_p + k] = s_spec[i].im - scalc[i].im;
            norm = norm.max(f[n_p + k].abs());
        }
        (f, norm)
    };

    let (mut f, mut norm) = mismatch_norm(vm, va);
    if norm < options.tolerance {
        return Ok(InnerResult {
            converged: true,
            iterations: 0,
            error: norm,
        });
    }

    for iter in 1..=options.max_iter {
        let scalc = calc_power(adm, vm, va);
        let jac = assemble_jacobian(
            adm, vm, va, &scalc, &p_idx, &q_idx, &row_of_p, &row_of_q,
        );
        let lu = factorize(&jac);
        let delta = lu_solve(&lu, &f)?;

        // backtracking line search on the step length
        let va_old = va.to_vec();
        let vm_old = vm.to_vec();
        let mut alpha = 1.0;
        let mut accepted = false;
        for _ in 0..=BACKTRACK_DEPTH {
            for (k, &i) in p_idx.iter().enumerate() {
                va[i] = va_old[i] + alpha * delta[k];
            }
            for (k, &i) in q_idx.iter().enumerate() {
                vm[i] = vm_old[i] + alpha * delta[n_p + k];
            }
            let (f_new, norm_new) = mismatch_norm(vm, va);
            if options.backtracking_parameter <= 0.0
                || norm_new <= norm * (1.0 + options.backtracking_parameter)
            {
                f = f_new;
                norm = norm_new;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        if !accepted {
            // keep the shortest step
            let (f_new, norm_new) = mismatch_norm(vm, va);
            f = f_new;
            norm = norm_new;
        }

        if norm < options.tolerance {
            return Ok(InnerResult {
                converged: true,
                iterations: iter,
                error: norm,
            });
        }
    }

    Ok(InnerResult {
        converged: false,
        iterations: options.max_iter,
        error: norm,
    })
}

/// `S_calc = V ⊙ conj(Ybus · V)` in p.u.
pub fn calc_power(adm: &AdmittanceMatrices, vm: &[f64], va: &[f64]) -> Vec<Complex64> {
    let v: Vec<Complex64> = vm
        .iter()
        .zip(va.iter())
        .map(|(&m, &a)| Complex64::from_polar(m, a))
        .collect();
    let iy = csr_mat_vec_cx(&adm.ybus, &v);
    v.iter().zip(iy.iter()).map(|(vi, ii)| vi * ii.conj()).collect()
}

/// Branch flows (MVA) at the from/to ends from the branch primitives:
/// `Sf_k = V_f · conj(yff_k V_f + yft_k V_t)`, and symmetrically for `St`.
pub fn branch_flows_of(
    nc: &NumericalCircuit,
    adm: &AdmittanceMatrices,
    voltage: &[Complex64],
) -> (Vec<Complex64>, Vec<Complex64>) {
    let br = &nc.passive_branch_data;
    let nbr = br.len();
    let mut sf = vec![Complex64::new(0.0, 0.0); nbr];
    let mut st = vec![Complex64::new(0.0, 0.0); nbr];
    for k in 0..nbr {
        let vf = voltage[br.f[k]];
        let vt = voltage[br.t[k]];
        let if_ = adm.yff[k] * vf + adm.yft[k] * vt;
        let it_ = adm.ytf[k] * vf + adm.ytt[k] * vt;
        sf[k] = vf * if_.conj() * nc.sbase;
        st[k] = vt * it_.conj() * nc.sbase;
    }
    (sf, st)
}

/// Sparse Jacobian assembly over the Ybus pattern.
#[allow(clippy::too_many_arguments)]
fn assemble_jacobian(
    adm: &AdmittanceMatrices,
    vm: &[f64],
    va: &[f64],
    scalc: &[Complex64],
    p_idx: &[usize],
    q_idx: &[usize],
    row_of_p: &[usize],
    row_of_q: &[usize],
) -> sprs::CsMat<f64> {
    let n_p = p_idx.len();
    let n_q = q_idx.len();
    let n_vars = n_p + n_q;
    let mut tri = TriMat::new((n_vars, n_vars));

    for (i, row) in adm.ybus.outer_iterator().enumerate() {
        let pi = row_of_p[i];
        let qi = row_of_q[i];
        if pi == usize::MAX && qi == usize::MAX {
            continue;
        }
        let p_i = scalc[i].re;
        let q_i = scalc[i].im;

        for (j, y) in row.iter() {
            let g = y.re;
            let b = y.im;
            let theta = va[i] - va[j];
            let (sin_t, cos_t) = theta.sin_cos();

            if i == j {
                if pi != usize::MAX {
                    // dP_i/dθ_i
                    tri.add_triplet(pi, pi, -q_i - b * vm[i] * vm[i]);
                    if qi != usize::MAX {
                        // dP_i/dV_i
                        tri.add_triplet(pi, n_p + qi, p_i / vm[i] + g * vm[i]);
                    }
                }
                if qi != usize::MAX {
                    // dQ_i/dθ_i
                    tri.add_triplet(n_p + qi, pi, p_i - g * vm[i] * vm[i]);
                    // dQ_i/dV_i
                    tri.add_triplet(n_p + qi, n_p + qi, q_i / vm[i] - b * vm[i]);
                }
            } else {
                let pj = row_of_p[j];
                let qj = row_of_q[j];
                if pi != usize::MAX {
                    if pj != usize::MAX {
                        tri.add_triplet(pi, pj, vm[i] * vm[j] * (g * sin_t - b * cos_t));
                    }
                    if qj != usize::MAX {
                        tri.add_triplet(pi, n_p + qj, vm[i] * (g * cos_t + b * sin_t));
                    }
                }
                if qi != usize::MAX {
                    if pj != usize::MAX {
                        tri.add_triplet(
                            n_p + qi,
                            pj,
                            -vm[i] * vm[j] * (g * cos_t + b * sin_t),
                        );
                    }
                    if qj != usize::MAX {
                        tri.add_triplet(n_p + qi, n_p + qj, vm[i] * (g * sin_t - b * cos_t));
                    }
                }
            }
        }
    }
    tri.to_csc()
}

/// Distribute the per-bus reactive balance onto the machines at each bus,
/// proportionally to their nominal power.
fn allocate_generator_q(
    nc: &NumericalCircuit,
    scalc: &[Complex64],
    bus_types: &[BusType],
) -> Vec<f64> {
    let g = &nc.generator_data;
    let mut load_q = vec![0.0; nc.nbus()];
    let l = &nc.load_data;
    for i in 0..l.len() {
        if l.active[i] {
            load_q[l.bus[i]] += l.q[i];
        }
    }
    let mut snom_sum = vec![0.0; nc.nbus()];
    for i in 0..g.len() {
        if g.active[i] {
            snom_sum[g.bus[i]] += g.snom[i];
        }
    }
    let mut gen_q = vec![0.0; g.len()];
    for i in 0..g.len() {
        if !g.active[i] {
            continue;
        }
        let bus = g.bus[i];
        if bus_types[bus] == BusType::PQ && !g.controllable[i] {
            continue;
        }
        let q_bus = scalc[bus].im * nc.sbase + load_q[bus];
        let share = if snom_sum[bus] > 0.0 {
            g.snom[i] / snom_sum[bus]
        } else {
            1.0
        };
        gen_q[i] = q_bus * share;
    }
    gen_q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_numerical_circuit_at;
    use vera_core::{Branch, Bus, Gen, Load, MultiCircuit};

    fn five_bus() -> MultiCircuit {
        // small meshed grid with two machines
        let mut grid = MultiCircuit::new("five");
        let b: Vec<_> = (0..5)
            .map(|i| {
                let mut bus = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    bus = bus.as_slack();
                }
                grid.add_bus(bus)
            })
            .collect();
        grid.add_branch(Branch::line("L01", b[0], b[1], 0.02, 0.06).with_charging(0.06));
        grid.add_branch(Branch::line("L02", b[0], b[2], 0.08, 0.24).with_charging(0.05));
        grid.add_branch(Branch::line("L12", b[1], b[2], 0.06, 0.18).with_charging(0.04));
        grid.add_branch(Branch::line("L13", b[1], b[3], 0.06, 0.18).with_charging(0.04));
        grid.add_branch(Branch::line("L14", b[1], b[4], 0.04, 0.12).with_charging(0.03));
        grid.add_branch(Branch::line("L23", b[2], b[3], 0.01, 0.03).with_charging(0.02));
        grid.add_branch(Branch::line("L34", b[3], b[4], 0.08, 0.24).with_charging(0.05));
        grid.add_generator(b[0], Gen::new("G0", 0.0).with_vset(1.06).with_snom(250.0));
        grid.add_generator(
            b[1],
            Gen::new("G1", 40.0)
                .with_vset(1.045)
                .with_snom(100.0)
                .with_q_limits(-40.0, 50.0),
        );
        grid.add_load(b[1], Load::new("Ld1", 20.0, 10.0));
        grid.add_load(b[2], Load::new("Ld2", 45.0, 15.0));
        grid.add_load(b[3], Load::new("Ld3", 40.0, 5.0));
        grid.add_load(b[4], Load::new("Ld4", 60.0, 10.0));
        grid
    }

    #[test]
    fn test_five_bus_converges() {
        let grid = five_bus();
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut harness = DriverHarness::new();
        let mut log = Logger::new();
        let islands = nc.split_into_islands(true, &mut log);
        assert_eq!(islands.len(), 1);

        let res = solve_island_newton(
            &islands[0],
            &PowerFlowOptions::default(),
            false,
            &mut harness,
        )
        .unwrap();
        assert!(res.converged);
        assert!(res.iterations <= 10);
        assert!(res.error < 1e-6);

        // PV bus magnitude held at its set point
        let b1 = islands[0]
            .bus_data
            .names
            .iter()
            .position(|n| n == "B1")
            .unwrap();
        assert!((res.voltage[b1].norm() - 1.045).abs() < 1e-9);
    }

    use vera_core::Logger;

    #[test]
    fn test_q_limit_switching() {
        // tighten G1's Q limit so the unconstrained solution violates it
        let mut grid = five_bus();
        grid.generators[1].qmax = vera_core::Megavars(5.0);
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        let islands = nc.split_into_islands(true, &mut log);
        let mut harness = DriverHarness::new();

        let options = PowerFlowOptions::default().with_q_control(true);
        let res =
            solve_island_newton(&islands[0], &options, false, &mut harness).unwrap();
        assert!(res.converged);

        let b1 = islands[0]
            .bus_data
            .names
            .iter()
            .position(|n| n == "B1")
            .unwrap();
        // the bus lost voltage control: it ends below its set point
        assert_eq!(res.bus_types[b1], BusType::PQ);
        assert!(res.voltage[b1].norm() < 1.045);
    }

    #[test]
    fn test_power_balance_invariant() {
        let grid = five_bus();
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let mut log = Logger::new();
        let islands = nc.split_into_islands(true, &mut log);
        let mut harness = DriverHarness::new();
        let res = solve_island_newton(
            &islands[0],
            &PowerFlowOptions::default(),
            false,
            &mut harness,
        )
        .unwrap();

        let total_inj: Complex64 = res.sbus.iter().sum();
        let total_loss: Complex64 = res
            .sf
            .iter()
            .zip(res.st.iter())
            .map(|(f, t)| f + t)
            .sum();
        assert!(
            (total_inj - total_loss).norm() < 1e-4 * 100.0,
            "balance residual: {}",
            (total_inj - total_loss).norm()
        );
    }
}
