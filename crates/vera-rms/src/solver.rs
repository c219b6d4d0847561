//! DAE block solver: flatten, compile, integrate.
//!
//! The solver flattens a block tree (C2), compiles the residuals and the
//! four Jacobian blocks once (C1), and integrates the semi-explicit DAE
//! `{ẋ = f(x,y); 0 = g(x,y)}` with implicit Euler or the trapezoidal rule.
//!
//! Each step solves for `(x_{n+1}, y_{n+1})` with Newton over the residual
//! ```text
//!   x_{n+1} − xₙ − γh·f(x_{n+1},y_{n+1}) − (1−γ)h·f(xₙ,yₙ) = 0
//!   g(x_{n+1}, y_{n+1}) = 0
//! ```
//! (`γ = 1` implicit Euler, `γ = ½` trapezoid), using the block Jacobian
//! ```text
//!   [ I − γh·J11   −γh·J12 ]
//!   [ J21            J22   ]
//! ```
//! packed as one sparse 2×2 block CSC and factorized with LU. The
//! factorization is reused across Newton iterations within a step and
//! rebuilt on slow convergence or after a parameter event.

use crate::block::{Block, FlatSystem};
use crate::symbolic::{Var, VarUid};
use crate::tape::{compile_expressions, compile_jacobian, SlotMap, SparseJacobian, Tape};
use faer::prelude::SpSolver;
use faer::solvers::PartialPivLu;
use faer::{FaerMat, Mat};
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use vera_core::{DriverHarness, VgError, VgResult};

/// One scheduled parameter discontinuity.
#[derive(Debug, Clone)]
pub struct RmsEvent {
    pub t: f64,
    pub param_uid: VarUid,
    pub value: f64,
}

/// Event list kept sorted by time.
#[derive(Debug, Clone, Default)]
pub struct RmsEvents {
    events: Vec<RmsEvent>,
}

impl RmsEvents {
    pub fn new(mut events: Vec<RmsEvent>) -> Self {
        events.sort_by(|a, b| a.t.total_cmp(&b.t));
        Self { events }
    }

    pub fn add(&mut self, t: f64, param_uid: VarUid, value: f64) {
        self.events.push(RmsEvent { t, param_uid, value });
        self.events.sort_by(|a, b| a.t.total_cmp(&b.t));
    }

    /// Events with `t_event ∈ (t_prev, t_now]`.
    pub fn between(&self, t_prev: f64, t_now: f64) -> impl Iterator<Item = &RmsEvent> {
        self.events
            .iter()
            .filter(move |e| e.t > t_prev && e.t <= t_now)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Integration scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    ImplicitEuler,
    Trapezoid,
}

/// Immutable RMS simulation configuration.
#[derive(Debug, Clone)]
pub struct RmsOptions {
    pub t0: f64,
    pub t_end: f64,
    /// Step size (s)
    pub h: f64,
    pub method: IntegrationMethod,
    pub newton_tol: f64,
    pub newton_max_iter: usize,
    pub verbose: u8,
}

impl Default for RmsOptions {
    fn default() -> Self {
        Self {
            t0: 0.0,
            t_end: 1.0,
            h: 0.01,
            method: IntegrationMethod::ImplicitEuler,
            newton_tol: 1e-8,
            newton_max_iter: 20,
            verbose: 0,
        }
    }
}

impl RmsOptions {
    pub fn with_horizon(mut self, t0: f64, t_end: f64, h: f64) -> Self {
        self.t0 = t0;
        self.t_end = t_end;
        self.h = h;
        self
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }
}

/// Simulated trajectory. Row `k` of `x` is the full variable vector
/// (states then algebraics, in flattening order) at `t[k]`.
#[derive(Debug, Clone)]
pub struct RmsSolution {
    pub t: Vec<f64>,
    pub x: Vec<Vec<f64>>,
    pub converged: bool,
    pub cancelled: bool,
    pub newton_iterations: usize,
}

/// Compiled DAE system ready for repeated integration.
pub struct BlockSolver {
    flat: FlatSystem,
    slots: SlotMap,
    time_var: Var,
    n_state: usize,
    n_alg: usize,
    f_tape: Tape,
    g_tape: Tape,
    j11: SparseJacobian,
    j12: SparseJacobian,
    j21: SparseJacobian,
    j22: SparseJacobian,
}

impl BlockSolver {
    /// Flatten `block` and compile residuals and Jacobians.
    pub fn new(block: &Block, time_var: Var) -> VgResult<Self> {
        let flat = block.flatten()?;

        let mut slots = SlotMap::new();
        let mut i = 0usize;
        for v in flat.state_vars.iter().chain(flat.algebraic_vars.iter()) {
            slots.vars.insert(v.uid, i);
            i += 1;
        }
        for (j, p) in flat.parameters.iter().enumerate() {
            slots.params.insert(p.uid, j);
        }
        slots.time = Some(time_var.uid);

        let f_tape = compile_expressions(&flat.state_eqs, &slots).map_err(VgError::from)?;
        let g_tape = compile_expressions(&flat.algebraic_eqs, &slots).map_err(VgError::from)?;
        let j11 = compile_jacobian(&flat.state_eqs, &flat.state_vars, &slots)
            .map_err(VgError::from)?;
        let j12 = compile_jacobian(&flat.state_eqs, &flat.algebraic_vars, &slots)
            .map_err(VgError::from)?;
        let j21 = compile_jacobian(&flat.algebraic_eqs, &flat.state_vars, &slots)
            .map_err(VgError::from)?;
        let j22 = compile_jacobian(&flat.algebraic_eqs, &flat.algebraic_vars, &slots)
            .map_err(VgError::from)?;

        let n_state = flat.n_state();
        let n_alg = flat.n_alg();

        Ok(Self {
            flat,
            slots,
            time_var,
            n_state,
            n_alg,
            f_tape,
            g_tape,
            j11,
            j12,
            j21,
            j22,
        })
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    pub fn n_alg(&self) -> usize {
        self.n_alg
    }

    pub fn n_vars(&self) -> usize {
        self.n_state + self.n_alg
    }

    pub fn n_params(&self) -> usize {
        self.flat.parameters.len()
    }

    pub fn flat(&self) -> &FlatSystem {
        &self.flat
    }

    pub fn time_var(&self) -> &Var {
        &self.time_var
    }

    /// Position of a variable inside `x`. The uid→index map is the only
    /// supported way to address entries.
    pub fn var_index(&self, var: &Var) -> Option<usize> {
        self.slots.vars.get(&var.uid).copied()
    }

    pub fn param_index(&self, var: &Var) -> Option<usize> {
        self.slots.params.get(&var.uid).copied()
    }

    /// Build the initial variable vector from a uid→value mapping; unmapped
    /// entries start at zero.
    pub fn build_state_vector(&self, mapping: &HashMap<VarUid, f64>) -> Vec<f64> {
        let mut x = vec![0.0; self.n_vars()];
        for (uid, val) in mapping {
            if let Some(&i) = self.slots.vars.get(uid) {
                x[i] = *val;
            }
        }
        x
    }

    /// Build the parameter vector; every parameter must be given a value.
    pub fn build_params_vector(&self, mapping: &HashMap<VarUid, f64>) -> VgResult<Vec<f64>> {
        let mut p = vec![0.0; self.n_params()];
        for param in &self.flat.parameters {
            match mapping.get(&param.uid) {
                Some(v) => p[self.slots.params[&param.uid]] = *v,
                None => {
                    return Err(VgError::UnboundVariable {
                        name: param.name.to_string(),
                        uid: param.uid,
                    })
                }
            }
        }
        Ok(p)
    }

    /// Jacobian blocks evaluated at `(x, params, t)`.
    pub fn jacobian_blocks(
        &self,
        x: &[f64],
        params: &[f64],
        t: f64,
    ) -> (CsMat<f64>, CsMat<f64>, CsMat<f64>, CsMat<f64>) {
        (
            self.j11.eval(x, params, t),
            self.j12.eval(x, params, t),
            self.j21.eval(x, params, t),
            self.j22.eval(x, params, t),
        )
    }

    /// Residual of the implicit step equations.
    fn step_residual(
        &self,
        x_new: &[f64],
        x_prev: &[f64],
        f_prev: &[f64],
        params: &[f64],
        t_new: f64,
        h: f64,
        gamma: f64,
        out: &mut [f64],
    ) {
        let mut f_new = vec![0.0; self.n_state];
        self.f_tape.eval(x_new, params, t_new, &mut f_new);
        for i in 0..self.n_state {
            out[i] = x_new[i] - x_prev[i] - gamma * h * f_new[i] - (1.0 - gamma) * h * f_prev[i];
        }
        let mut g_new = vec![0.0; self.n_alg];
        self.g_tape.eval(x_new, params, t_new, &mut g_new);
        out[self.n_state..self.n_state + self.n_alg].copy_from_slice(&g_new);
    }

    /// Pack `[I − γh·J11, −γh·J12; J21, J22]` into one CSC matrix.
    fn newton_matrix(&self, x: &[f64], params: &[f64], t: f64, h: f64, gamma: f64) -> CsMat<f64> {
        let (j11, j12, j21, j22) = self.jacobian_blocks(x, params, t);
        let n = self.n_vars();
        let ns = self.n_state;
        let mut tri = TriMat::new((n, n));

        // I − γh·J11, keeping the explicit identity on the diagonal
        for i in 0..ns {
            tri.add_triplet(i, i, 1.0);
        }
        for (v, (r, c)) in j11.iter() {
            tri.add_triplet(r, c, -gamma * h * v);
        }
        for (v, (r, c)) in j12.iter() {
            tri.add_triplet(r, ns + c, -gamma * h * v);
        }
        for (v, (r, c)) in j21.iter() {
            tri.add_triplet(ns + r, c, *v);
        }
        for (v, (r, c)) in j22.iter() {
            tri.add_triplet(ns + r, ns + c, *v);
        }
        tri.to_csc()
    }

    fn factorize(&self, m: &CsMat<f64>) -> VgResult<PartialPivLu<f64>> {
        let n = m.rows();
        let mut dense: Mat<f64> = Mat::zeros(n, n);
        for (v, (r, c)) in m.iter() {
            dense.write(r, c, dense.read(r, c) + *v);
        }
        let lu = dense.partial_piv_lu();
        Ok(lu)
    }

    fn solve_lu(&self, lu: &PartialPivLu<f64>, rhs: &[f64]) -> VgResult<Vec<f64>> {
        let n = rhs.len();
        let mut b = Mat::zeros(n, 1);
        for i in 0..n {
            b.write(i, 0, rhs[i]);
        }
        let sol = lu.solve(&b);
        let x: Vec<f64> = (0..n).map(|i| sol.read(i, 0)).collect();
        if x.iter().any(|v| !v.is_finite()) {
            return Err(VgError::SingularJacobian(
                "non-finite Newton correction".into(),
            ));
        }
        Ok(x)
    }

    /// Integrate from `x0`/`params0` over the configured horizon, applying
    /// the event list and checking `harness` for cancellation between steps
    /// and at each Newton outer iteration.
    pub fn simulate(
        &self,
        x0: &[f64],
        params0: &[f64],
        events: &RmsEvents,
        options: &RmsOptions,
        harness: &mut DriverHarness,
    ) -> VgResult<RmsSolution> {
        let gamma = match options.method {
            IntegrationMethod::ImplicitEuler => 1.0,
            IntegrationMethod::Trapezoid => 0.5,
        };
        let h = options.h;
        let steps = ((options.t_end - options.t0) / h).ceil() as usize;
        let n = self.n_vars();

        let mut t = Vec::with_capacity(steps + 1);
        let mut y: Vec<Vec<f64>> = Vec::with_capacity(steps + 1);
        t.push(options.t0);
        y.push(x0.to_vec());

        let mut params = params0.to_vec();
        let mut total_newton = 0usize;
        let mut lu_cache: Option<PartialPivLu<f64>> = None;
        let mut converged_all = true;

        for step_idx in 0..steps {
            if harness.is_cancelled() {
                return Ok(RmsSolution {
                    t,
                    x: y,
                    converged: converged_all,
                    cancelled: true,
                    newton_iterations: total_newton,
                });
            }

            let t_prev = t[step_idx];
            let t_new = t_prev + h;

            // apply events scheduled in (t_prev, t_new]
            let mut discontinuity = false;
            for ev in events.between(t_prev, t_new) {
                if let Some(&j) = self.slots.params.get(&ev.param_uid) {
                    params[j] = ev.value;
                    discontinuity = true;
                } else {
                    harness.logger.add_warning(format!(
                        "event at t={} targets unknown parameter uid {}",
                        ev.t, ev.param_uid
                    ));
                }
            }
            if discontinuity {
                lu_cache = None; // force refactorization
            }

            let x_prev = y[step_idx].clone();
            let mut f_prev = vec![0.0; self.n_state];
            self.f_tape.eval(&x_prev, &params, t_prev, &mut f_prev);

            let mut x_new = x_prev.clone();
            let mut residual = vec![0.0; n];
            let mut converged = false;
            let mut last_norm = f64::INFINITY;

            for _n_iter in 0..options.newton_max_iter {
                if harness.is_cancelled() {
                    return Ok(RmsSolution {
                        t,
                        x: y,
                        converged: converged_all,
                        cancelled: true,
                        newton_iterations: total_newton,
                    });
                }

                self.step_residual(
                    &x_new, &x_prev, &f_prev, &params, t_new, h, gamma, &mut residual,
                );
                let norm = residual.iter().fold(0.0f64, |m, v| m.max(v.abs()));
                if norm < options.newton_tol {
                    converged = true;
                    break;
                }

                // rebuild the factorization when stale or stalling
                if lu_cache.is_none() || norm > 0.5 * last_norm {
                    let jac = self.newton_matrix(&x_new, &params, t_new, h, gamma);
                    lu_cache = Some(self.factorize(&jac)?);
                }
                last_norm = norm;

                let neg_res: Vec<f64> = residual.iter().map(|v| -v).collect();
                let delta = self.solve_lu(lu_cache.as_ref().unwrap(), &neg_res)?;
                for i in 0..n {
                    x_new[i] += delta[i];
                }
                total_newton += 1;
            }

            if !converged {
                harness
                    .logger
                    .add_warning(format!("Newton stalled at t = {t_new:.4} s"));
                converged_all = false;
            }

            t.push(t_new);
            y.push(x_new);
            harness.report_progress(step_idx + 1, steps);
        }

        Ok(RmsSolution {
            t,
            x: y,
            converged: converged_all,
            cancelled: false,
            newton_iterations: total_newton,
        })
    }
}

/// Driver wrapper exposing the uniform surface around [`BlockSolver`].
pub struct RmsDriver {
    pub solver: BlockSolver,
    pub options: RmsOptions,
    pub events: RmsEvents,
    pub harness: DriverHarness,
    x0: Vec<f64>,
    params0: Vec<f64>,
    pub results: Option<RmsSolution>,
}

impl RmsDriver {
    pub fn new(
        block: &Block,
        time_var: Var,
        options: RmsOptions,
        x0_map: &HashMap<VarUid, f64>,
        params_map: &HashMap<VarUid, f64>,
    ) -> VgResult<Self> {
        let solver = BlockSolver::new(block, time_var)?;
        let x0 = solver.build_state_vector(x0_map);
        let params0 = solver.build_params_vector(params_map)?;
        Ok(Self {
            solver,
            options,
            events: RmsEvents::default(),
            harness: DriverHarness::new(),
            x0,
            params0,
            results: None,
        })
    }

    pub fn with_events(mut self, events: RmsEvents) -> Self {
        self.events = events;
        self
    }

    /// Blocks until the simulation finishes or is cancelled.
    pub fn run(&mut self) -> VgResult<()> {
        let sol = self.solver.simulate(
            &self.x0,
            &self.params0,
            &self.events,
            &self.options,
            &mut self.harness,
        )?;
        self.results = Some(sol);
        Ok(())
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::swing_block;
    use crate::symbolic::Expr;

    /// Exponential decay dx/dt = -k x has the exact solution x0 e^{-kt};
    /// implicit Euler must track it to first order.
    #[test]
    fn test_implicit_euler_decay() {
        let x = Var::new("x");
        let k = Var::new("k");
        let time = Var::new("t");

        let mut blk = Block::new("decay");
        blk.add_parameter(k.clone());
        blk.add_state(x.clone(), -(Expr::from(&k) * Expr::from(&x)));

        let solver = BlockSolver::new(&blk, time).unwrap();
        let x0 = solver.build_state_vector(&[(x.uid, 1.0)].into_iter().collect());
        let params = solver
            .build_params_vector(&[(k.uid, 2.0)].into_iter().collect())
            .unwrap();

        let options = RmsOptions::default().with_horizon(0.0, 1.0, 1e-3);
        let mut harness = DriverHarness::new();
        let sol = solver
            .simulate(&x0, &params, &RmsEvents::default(), &options, &mut harness)
            .unwrap();

        assert!(sol.converged);
        let xi = solver.var_index(&x).unwrap();
        let x_end = sol.x.last().unwrap()[xi];
        let exact = (-2.0f64).exp();
        assert!((x_end - exact).abs() < 2e-3, "x_end={x_end}, exact={exact}");
    }

    #[test]
    fn test_trapezoid_more_accurate_than_euler() {
        let x = Var::new("x");
        let time = Var::new("t");
        let mut blk = Block::new("decay");
        blk.add_state(x.clone(), -(Expr::from(&x)));

        let solver = BlockSolver::new(&blk, time).unwrap();
        let x0 = solver.build_state_vector(&[(x.uid, 1.0)].into_iter().collect());
        let exact = (-1.0f64).exp();
        let xi = solver.var_index(&x).unwrap();

        let mut errs = Vec::new();
        for method in [IntegrationMethod::ImplicitEuler, IntegrationMethod::Trapezoid] {
            let options = RmsOptions::default()
                .with_horizon(0.0, 1.0, 0.01)
                .with_method(method);
            let mut harness = DriverHarness::new();
            let sol = solver
                .simulate(&x0, &[], &RmsEvents::default(), &options, &mut harness)
                .unwrap();
            errs.push((sol.x.last().unwrap()[xi] - exact).abs());
        }
        assert!(errs[1] < errs[0] / 10.0, "euler={}, trap={}", errs[0], errs[1]);
    }

    /// Swing machine with a mechanical power step: speed returns to 1.0
    /// after a damped overshoot.
    #[test]
    fn test_swing_step_response() {
        let time = Var::new("t");
        let (blk, vars) = swing_block("g1", 5.0, 2.0, 2.0 * std::f64::consts::PI * 50.0, 1.5);
        let solver = BlockSolver::new(&blk, time).unwrap();

        // steady state for Pm = 0.8: delta = asin(0.8/1.5), omega = 1
        let delta0 = (0.8f64 / 1.5).asin();
        let x0 = solver.build_state_vector(
            &[
                (vars.delta.uid, delta0),
                (vars.omega.uid, 1.0),
                (vars.pe.uid, 0.8),
            ]
            .into_iter()
            .collect(),
        );
        let params = solver
            .build_params_vector(&[(vars.pm.uid, 0.8)].into_iter().collect())
            .unwrap();

        let mut events = RmsEvents::default();
        events.add(1.0, vars.pm.uid, 1.0);

        let options = RmsOptions::default().with_horizon(0.0, 10.0, 0.01);
        let mut harness = DriverHarness::new();
        let sol = solver
            .simulate(&x0, &params, &events, &options, &mut harness)
            .unwrap();
        assert!(sol.converged);

        let wi = solver.var_index(&vars.omega).unwrap();
        let omega_traj: Vec<f64> = sol.x.iter().map(|row| row[wi]).collect();

        // overshoot after the step, then settle back to 1.0
        let omega_max = omega_traj.iter().cloned().fold(f64::MIN, f64::max);
        assert!(omega_max > 1.0 + 1e-5, "no overshoot: max = {omega_max}");
        let omega_end = *omega_traj.last().unwrap();
        assert!(
            (omega_end - 1.0).abs() < 1e-3,
            "omega did not settle: {omega_end}"
        );

        // the final electrical power matches the new mechanical power
        let pei = solver.var_index(&vars.pe).unwrap();
        let pe_end = sol.x.last().unwrap()[pei];
        assert!((pe_end - 1.0).abs() < 1e-2, "pe_end = {pe_end}");
    }

    #[test]
    fn test_cancellation_returns_partial() {
        let x = Var::new("x");
        let time = Var::new("t");
        let mut blk = Block::new("decay");
        blk.add_state(x.clone(), -(Expr::from(&x)));
        let solver = BlockSolver::new(&blk, time).unwrap();
        let x0 = solver.build_state_vector(&[(x.uid, 1.0)].into_iter().collect());

        let mut harness = DriverHarness::new();
        harness.cancel();
        let options = RmsOptions::default().with_horizon(0.0, 1.0, 0.01);
        let sol = solver
            .simulate(&x0, &[], &RmsEvents::default(), &options, &mut harness)
            .unwrap();
        assert!(sol.cancelled);
        assert_eq!(sol.x.len(), 1); // only the initial point
    }

    #[test]
    fn test_missing_parameter_value_fails() {
        let x = Var::new("x");
        let k = Var::new("k");
        let time = Var::new("t");
        let mut blk = Block::new("decay");
        blk.add_parameter(k);
        blk.add_state(x, Expr::c(0.0));
        let solver = BlockSolver::new(&blk, time).unwrap();
        assert!(solver.build_params_vector(&HashMap::new()).is_err());
    }
}
