//! Power-flow solvers and drivers.
//!
//! The snapshot driver compiles the grid, splits it into islands, solves
//! each island with the configured method and merges the per-island results
//! back into grid-shaped arrays. Failures are per-island: an island without
//! a source is reported and skipped while the others still solve.
//!
//! ## Bus classifications
//!
//! ```text
//! ┌───────────┬────────────────────┬────────────────────┐
//! │ BUS TYPE  │ SPECIFIED          │ CALCULATED         │
//! ├───────────┼────────────────────┼────────────────────┤
//! │ Slack     │ V, θ (θ = 0)       │ P, Q               │
//! │ PV        │ P, |V|             │ Q, θ               │
//! │ PQ        │ P, Q               │ |V|, θ             │
//! └───────────┴────────────────────┴────────────────────┘
//! ```

pub mod dc;
pub mod newton;
pub mod three_phase;
pub mod time_series;

use crate::compiler::{compile_numerical_circuit_at, BusType, NumericalCircuit};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use vera_core::{DriverHarness, MultiCircuit, VgError, VgResult};

pub use time_series::{ClusteringResults, PowerFlowTimeSeriesDriver, PowerFlowTimeSeriesResults};

/// Solver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverType {
    /// Full Newton–Raphson
    NR,
    /// Linear (DC) approximation
    Linear,
}

/// Immutable power-flow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowOptions {
    pub solver_type: SolverType,
    pub tolerance: f64,
    pub max_iter: usize,
    /// Enforce generator reactive limits (PV↔PQ switching)
    pub control_q: bool,
    pub control_taps_modules: bool,
    pub control_taps_phase: bool,
    pub control_remote_voltage: bool,
    /// On failure, retry from a flat start and then fall back to Linear
    pub retry_with_other_methods: bool,
    pub three_phase_unbalanced: bool,
    pub distributed_slack: bool,
    /// Mismatch-growth factor that triggers step halving; 0 disables
    pub backtracking_parameter: f64,
    pub verbose: u8,
    /// Outer control-loop limit (Q limits, taps)
    pub max_outer_loop: usize,
    /// Drop single-bus islands instead of reporting them
    pub ignore_single_node_islands: bool,
    /// Treat islands without any injection source as passive; when false
    /// they are a hard `IslandWithoutSource` failure
    pub ignore_dead_islands: bool,
}

impl Default for PowerFlowOptions {
    fn default() -> Self {
        Self {
            solver_type: SolverType::NR,
            tolerance: 1e-6,
            max_iter: 20,
            control_q: false,
            control_taps_modules: false,
            control_taps_phase: false,
            control_remote_voltage: false,
            retry_with_other_methods: false,
            three_phase_unbalanced: false,
            distributed_slack: false,
            backtracking_parameter: 0.05,
            verbose: 0,
            max_outer_loop: 10,
            ignore_single_node_islands: true,
            ignore_dead_islands: true,
        }
    }
}

impl PowerFlowOptions {
    pub fn with_solver(mut self, solver_type: SolverType) -> Self {
        self.solver_type = solver_type;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_q_control(mut self, enabled: bool) -> Self {
        self.control_q = enabled;
        self
    }

    pub fn with_tap_control(mut self, modules: bool, phase: bool) -> Self {
        self.control_taps_modules = modules;
        self.control_taps_phase = phase;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.retry_with_other_methods = enabled;
        self
    }

    pub fn with_distributed_slack(mut self, enabled: bool) -> Self {
        self.distributed_slack = enabled;
        self
    }
}

/// Grid-shaped power-flow results. Entries of buses/branches that belong to
/// unsolved islands stay at their defaults.
#[derive(Debug, Clone)]
pub struct PowerFlowResults {
    pub converged: bool,
    pub iterations: usize,
    /// Final `‖F‖∞` (p.u.)
    pub error: f64,
    /// Complex bus voltages (p.u.)
    pub voltage: Vec<Complex64>,
    /// Bus power injections (MVA)
    pub sbus: Vec<Complex64>,
    /// Branch from-side flows (MVA)
    pub sf: Vec<Complex64>,
    /// Branch to-side flows (MVA)
    pub st: Vec<Complex64>,
    /// Branch losses `Sf + St` (MVA)
    pub losses: Vec<Complex64>,
    /// `|Sf| / rate`
    pub loading: Vec<f64>,
    /// Reactive output per generator (Mvar)
    pub gen_q: Vec<f64>,
    /// Final bus classification
    pub bus_types: Vec<BusType>,
    pub cancelled: bool,
}

impl PowerFlowResults {
    pub fn empty(nbus: usize, nbr: usize, ngen: usize) -> Self {
        Self {
            converged: false,
            iterations: 0,
            error: f64::INFINITY,
            voltage: vec![Complex64::new(1.0, 0.0); nbus],
            sbus: vec![Complex64::new(0.0, 0.0); nbus],
            sf: vec![Complex64::new(0.0, 0.0); nbr],
            st: vec![Complex64::new(0.0, 0.0); nbr],
            losses: vec![Complex64::new(0.0, 0.0); nbr],
            loading: vec![0.0; nbr],
            gen_q: vec![0.0; ngen],
            bus_types: vec![BusType::PQ; nbus],
            cancelled: false,
        }
    }

    /// Voltage magnitudes (p.u.).
    pub fn vm(&self) -> Vec<f64> {
        self.voltage.iter().map(|v| v.norm()).collect()
    }

    /// Voltage angles (rad).
    pub fn va(&self) -> Vec<f64> {
        self.voltage.iter().map(|v| v.arg()).collect()
    }

    /// Power-balance residual `|Σ Sbus − Σ losses|` (MVA).
    pub fn power_balance_residual(&self) -> f64 {
        let total_inj: Complex64 = self.sbus.iter().sum();
        let total_loss: Complex64 = self.losses.iter().sum();
        (total_inj - total_loss).norm()
    }
}

/// Pluggable solver backend: the core ships the Newton implementation,
/// binary engines can implement the same surface behind a feature gate.
pub trait PowerFlowBackend: Send + Sync {
    fn solve(
        &self,
        nc: &NumericalCircuit,
        options: &PowerFlowOptions,
        harness: &mut DriverHarness,
    ) -> VgResult<PowerFlowResults>;
}

/// Default backend: island split + Newton (or DC) per island.
#[derive(Debug, Clone, Default)]
pub struct NewtonBackend;

impl PowerFlowBackend for NewtonBackend {
    fn solve(
        &self,
        nc: &NumericalCircuit,
        options: &PowerFlowOptions,
        harness: &mut DriverHarness,
    ) -> VgResult<PowerFlowResults> {
        solve_circuit(nc, options, harness)
    }
}

/// Solve a compiled circuit: split into islands, solve each, merge.
pub fn solve_circuit(
    nc: &NumericalCircuit,
    options: &PowerFlowOptions,
    harness: &mut DriverHarness,
) -> VgResult<PowerFlowResults> {
    let mut results = PowerFlowResults::empty(nc.nbus(), nc.nbr(), nc.generator_data.len());
    let islands = nc.split_into_islands(options.ignore_single_node_islands, &mut harness.logger);

    if islands.is_empty() {
        return Err(VgError::MalformedGrid("no solvable islands".into()));
    }

    // generator uid -> grid-level index, to merge island gen results
    let gen_pos: std::collections::HashMap<u64, usize> = nc
        .generator_data
        .uid
        .iter()
        .enumerate()
        .map(|(i, &u)| (u, i))
        .collect();

    let mut any_converged = false;
    let mut all_converged = true;

    for (island_id, island) in islands.iter().enumerate() {
        if harness.is_cancelled() {
            results.cancelled = true;
            break;
        }

        if !island.has_source() {
            if !options.ignore_dead_islands {
                return Err(VgError::IslandWithoutSource { island: island_id });
            }
            harness
                .logger
                .add_error(format!("island {island_id}: no injection source"));
            all_converged = false;
            continue;
        }
        if island.slack_index().is_none() {
            harness
                .logger
                .add_warning(format!("island {island_id}: no slack, skipped"));
            all_converged = false;
            continue;
        }

        let island_res = match options.solver_type {
            SolverType::NR => {
                if options.three_phase_unbalanced {
                    three_phase::solve_island_three_phase(island, options, harness)
                } else {
                    solve_island_with_retry(island, options, harness)
                }
            }
            SolverType::Linear => dc::solve_island_dc(island, options, harness),
        };

        match island_res {
            Ok(ir) => {
                any_converged |= ir.converged;
                all_converged &= ir.converged;
                results.iterations = results.iterations.max(ir.iterations);
                results.error = if results.error.is_finite() {
                    results.error.max(ir.error)
                } else {
                    ir.error
                };

                for (li, &gi) in island.bus_data.original_idx.iter().enumerate() {
                    results.voltage[gi] = ir.voltage[li];
                    results.sbus[gi] = ir.sbus[li];
                    results.bus_types[gi] = ir.bus_types[li];
                }
                for (lk, &gk) in island.passive_branch_data.original_idx.iter().enumerate() {
                    results.sf[gk] = ir.sf[lk];
                    results.st[gk] = ir.st[lk];
                    results.losses[gk] = ir.sf[lk] + ir.st[lk];
                    let rate = nc.passive_branch_data.rates[gk];
                    results.loading[gk] = if rate > 0.0 {
                        ir.sf[lk].norm() / rate
                    } else {
                        0.0
                    };
                }
                for (li, &u) in island.generator_data.uid.iter().enumerate() {
                    if let Some(&gi) = gen_pos.get(&u) {
                        results.gen_q[gi] = ir.gen_q[li];
                    }
                }
            }
            Err(e) => {
                harness
                    .logger
                    .add_error(format!("island {island_id}: {e}"));
                all_converged = false;
            }
        }
    }

    results.converged = any_converged && all_converged;
    Ok(results)
}

/// Newton solve with the retry ladder: flat start, then the linear solver.
fn solve_island_with_retry(
    island: &NumericalCircuit,
    options: &PowerFlowOptions,
    harness: &mut DriverHarness,
) -> VgResult<IslandResults> {
    match newton::solve_island_newton(island, options, false, harness) {
        Ok(r) if r.converged => Ok(r),
        first => {
            if !options.retry_with_other_methods {
                return first;
            }
            harness
                .logger
                .add_warning("Newton failed, retrying from a flat start");
            match newton::solve_island_newton(island, options, true, harness) {
                Ok(r) if r.converged => Ok(r),
                _ => {
                    harness
                        .logger
                        .add_warning("retry failed, falling back to the linear solver");
                    dc::solve_island_dc(island, options, harness)
                }
            }
        }
    }
}

/// Per-island solver output in island-local indexing.
#[derive(Debug, Clone)]
pub struct IslandResults {
    pub converged: bool,
    pub iterations: usize,
    pub error: f64,
    pub voltage: Vec<Complex64>,
    /// MVA
    pub sbus: Vec<Complex64>,
    pub sf: Vec<Complex64>,
    pub st: Vec<Complex64>,
    pub bus_types: Vec<BusType>,
    /// Mvar per island generator
    pub gen_q: Vec<f64>,
}

/// Snapshot power-flow driver with the uniform driver surface.
pub struct PowerFlowDriver<'a> {
    pub grid: &'a MultiCircuit,
    pub options: PowerFlowOptions,
    pub harness: DriverHarness,
    pub results: Option<PowerFlowResults>,
}

impl<'a> PowerFlowDriver<'a> {
    pub fn new(grid: &'a MultiCircuit, options: PowerFlowOptions) -> Self {
        Self {
            grid,
            options,
            harness: DriverHarness::new(),
            results: None,
        }
    }

    /// Blocks until done or cancelled.
    pub fn run(&mut self) -> VgResult<()> {
        let nc = compile_numerical_circuit_at(self.grid, None)?;
        let res = solve_circuit(&nc, &self.options, &mut self.harness)?;
        self.results = Some(res);
        Ok(())
    }

    pub fn cancel(&self) {
        self.harness.cancel();
    }
}
