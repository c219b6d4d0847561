//! Small-signal stability around an operating point.
//!
//! The DAE `{ẋ = f(x,y); 0 = g(x,y)}` linearized at `(x*, y*)` reduces to
//! the state matrix
//! ```text
//!   A = J11 − J12 · J22⁻¹ · J21
//! ```
//! whose eigenvalues `λᵢ = σᵢ + jωᵢ` decide stability. For each mode we
//! report the damping ratio `ζᵢ = −σᵢ/|λᵢ|`, the oscillation frequency
//! `fᵢ = ωᵢ/2π` (Hz) and the column-normalised participation factors
//! `pᵢⱼ = |Vⱼᵢ · Wᵢⱼ|` relating states to modes.

use crate::solver::BlockSolver;
use faer::complex_native::c64;
use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use vera_core::{VgError, VgResult};

/// Stability classification of the operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilityClass {
    /// All real parts below −ε
    Stable,
    /// At least one real part above ε
    Unstable,
    /// Real parts within ±ε of the imaginary axis
    Marginal,
}

#[derive(Debug, Clone)]
pub struct SmallSignalOptions {
    /// Real-part tolerance around the imaginary axis
    pub eps: f64,
}

impl Default for SmallSignalOptions {
    fn default() -> Self {
        Self { eps: 1e-8 }
    }
}

/// Eigen-analysis of the state matrix.
#[derive(Debug, Clone)]
pub struct SmallSignalResults {
    /// Modes `λᵢ`
    pub eigenvalues: Vec<Complex64>,
    /// `ζᵢ = −σᵢ/|λᵢ|` (NaN for the zero eigenvalue)
    pub damping_ratios: Vec<f64>,
    /// `fᵢ = ωᵢ/2π` in Hz
    pub frequencies_hz: Vec<f64>,
    /// `participation[j][i]`: contribution of state `j` to mode `i`,
    /// normalised per mode
    pub participation: Vec<Vec<f64>>,
    pub classification: StabilityClass,
}

impl SmallSignalResults {
    /// Index of the least damped oscillatory mode (largest real part among
    /// modes with nonzero frequency).
    pub fn dominant_oscillatory_mode(&self) -> Option<usize> {
        self.eigenvalues
            .iter()
            .enumerate()
            .filter(|(i, _)| self.frequencies_hz[*i].abs() > 1e-9)
            .max_by(|(_, a), (_, b)| a.re.total_cmp(&b.re))
            .map(|(i, _)| i)
    }
}

/// Build the dense state matrix `A = J11 − J12·J22⁻¹·J21` at `(x, params)`.
pub fn state_matrix(
    solver: &BlockSolver,
    x: &[f64],
    params: &[f64],
    t: f64,
) -> VgResult<Mat<f64>> {
    let ns = solver.n_state();
    let na = solver.n_alg();
    let (j11, j12, j21, j22) = solver.jacobian_blocks(x, params, t);

    let mut a = Mat::zeros(ns, ns);
    for (v, (r, c)) in j11.iter() {
        a.write(r, c, a.read(r, c) + *v);
    }

    if na == 0 {
        return Ok(a);
    }

    // Solve J22 · X = J21 for X (na × ns), then subtract J12 · X
    let mut j22d: Mat<f64> = Mat::zeros(na, na);
    for (v, (r, c)) in j22.iter() {
        j22d.write(r, c, j22d.read(r, c) + *v);
    }
    let mut j21d: Mat<f64> = Mat::zeros(na, ns);
    for (v, (r, c)) in j21.iter() {
        j21d.write(r, c, j21d.read(r, c) + *v);
    }
    let lu = j22d.partial_piv_lu();
    let x_sol = lu.solve(&j21d);
    for i in 0..na {
        for j in 0..ns {
            if !x_sol.read(i, j).is_finite() {
                return Err(VgError::SingularJacobian(
                    "algebraic Jacobian J22 is singular".into(),
                ));
            }
        }
    }

    let mut j12d: Mat<f64> = Mat::zeros(ns, na);
    for (v, (r, c)) in j12.iter() {
        j12d.write(r, c, j12d.read(r, c) + *v);
    }
    for i in 0..ns {
        for j in 0..ns {
            let mut acc = 0.0;
            for k in 0..na {
                acc += j12d.read(i, k) * x_sol.read(k, j);
            }
            a.write(i, j, a.read(i, j) - acc);
        }
    }
    Ok(a)
}

/// Run the eigen-analysis at an operating point.
pub fn run_small_signal(
    solver: &BlockSolver,
    x: &[f64],
    params: &[f64],
    t: f64,
    options: &SmallSignalOptions,
) -> VgResult<SmallSignalResults> {
    let a = state_matrix(solver, x, params, t)?;
    let n = solver.n_state();
    if n == 0 {
        return Err(VgError::MalformedBlock(
            "small-signal analysis needs at least one state variable".into(),
        ));
    }

    let evd = a.eigendecomposition::<c64>();
    let lambda = evd.s_diagonal();
    let v = evd.u();

    let eigenvalues: Vec<Complex64> = (0..n)
        .map(|i| {
            let z = lambda.read(i);
            Complex64::new(z.re, z.im)
        })
        .collect();

    // Left eigenvectors: rows of V⁻¹, obtained by solving V·W = I
    let mut v_owned: Mat<c64> = Mat::zeros(n, n);
    let mut identity: Mat<c64> = Mat::zeros(n, n);
    for i in 0..n {
        identity.write(i, i, c64::new(1.0, 0.0));
        for j in 0..n {
            v_owned.write(i, j, v.read(i, j));
        }
    }
    let w = v_owned.partial_piv_lu().solve(&identity);

    // participation[j][i] = |V[j,i] · W[i,j]|, normalised per mode i
    let mut participation = vec![vec![0.0; n]; n];
    for i in 0..n {
        let mut col_sum = 0.0;
        for j in 0..n {
            let vij = v.read(j, i);
            let wij = w.read(i, j);
            let p = (Complex64::new(vij.re, vij.im) * Complex64::new(wij.re, wij.im)).norm();
            participation[j][i] = p;
            col_sum += p;
        }
        if col_sum > 0.0 {
            for j in 0..n {
                participation[j][i] /= col_sum;
            }
        }
    }

    let mut damping_ratios = Vec::with_capacity(n);
    let mut frequencies_hz = Vec::with_capacity(n);
    for lam in &eigenvalues {
        let modulus = lam.norm();
        damping_ratios.push(if modulus > 0.0 {
            -lam.re / modulus
        } else {
            f64::NAN
        });
        frequencies_hz.push(lam.im / (2.0 * std::f64::consts::PI));
    }

    let eps = options.eps;
    let max_re = eigenvalues.iter().map(|l| l.re).fold(f64::MIN, f64::max);
    let classification = if max_re < -eps {
        StabilityClass::Stable
    } else if max_re > eps {
        StabilityClass::Unstable
    } else {
        StabilityClass::Marginal
    };

    Ok(SmallSignalResults {
        eigenvalues,
        damping_ratios,
        frequencies_hz,
        participation,
        classification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{swing_block, Block};
    use crate::symbolic::{Expr, Var};

    #[test]
    fn test_decay_mode_is_stable() {
        let x = Var::new("x");
        let time = Var::new("t");
        let mut blk = Block::new("decay");
        blk.add_state(x.clone(), -(Expr::c(2.0) * Expr::from(&x)));
        let solver = BlockSolver::new(&blk, time).unwrap();

        let res = run_small_signal(&solver, &[1.0], &[], 0.0, &SmallSignalOptions::default())
            .unwrap();
        assert_eq!(res.eigenvalues.len(), 1);
        assert!((res.eigenvalues[0].re + 2.0).abs() < 1e-10);
        assert_eq!(res.classification, StabilityClass::Stable);
        // a single real mode: full participation of the only state
        assert!((res.participation[0][0] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_unstable_mode_detected() {
        let x = Var::new("x");
        let time = Var::new("t");
        let mut blk = Block::new("growth");
        blk.add_state(x.clone(), Expr::c(0.5) * Expr::from(&x));
        let solver = BlockSolver::new(&blk, time).unwrap();
        let res = run_small_signal(&solver, &[1.0], &[], 0.0, &SmallSignalOptions::default())
            .unwrap();
        assert_eq!(res.classification, StabilityClass::Unstable);
    }

    #[test]
    fn test_swing_machine_oscillatory_pair() {
        let time = Var::new("t");
        let omega_b = 2.0 * std::f64::consts::PI * 50.0;
        let (blk, vars) = swing_block("g1", 5.0, 2.0, omega_b, 1.5);
        let solver = BlockSolver::new(&blk, time).unwrap();

        // operating point: Pm = 0.8, delta = asin(0.8/1.5)
        let delta0 = (0.8f64 / 1.5).asin();
        let x = solver.build_state_vector(
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

        let res =
            run_small_signal(&solver, &x, &params, 0.0, &SmallSignalOptions::default()).unwrap();
        assert_eq!(res.classification, StabilityClass::Stable);

        // expect one complex-conjugate oscillatory pair
        let osc: Vec<_> = res
            .eigenvalues
            .iter()
            .filter(|l| l.im.abs() > 1e-6)
            .collect();
        assert_eq!(osc.len(), 2);
        let idx = res.dominant_oscillatory_mode().unwrap();
        // electromechanical mode: sigma = -D/(2M) = -0.2
        assert!((res.eigenvalues[idx].re + 0.2).abs() < 1e-6);
        // analytic frequency: sqrt(K*omega_b/M - sigma^2)/(2 pi),
        // K = Pmax cos(delta0)
        let k_sync = 1.5 * delta0.cos();
        let w_n = (k_sync * omega_b / 5.0 - 0.04).sqrt();
        assert!((res.frequencies_hz[idx].abs() - w_n / (2.0 * std::f64::consts::PI)).abs() < 1e-3);
        // positive damping ratio, small
        assert!(res.damping_ratios[idx] > 0.0 && res.damping_ratios[idx] < 0.1);
    }
}
