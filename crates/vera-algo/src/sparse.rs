//! Small sparse/dense bridging helpers shared by the solvers.
//!
//! Convention: CSC for factorizations, CSR for matrix-vector products, COO
//! (triplets) only during construction. Factorizations go through faer on a
//! densified copy; for the network sizes this core targets that is the
//! pragmatic trade, and the sparse structures keep assembly and slicing
//! cheap.

use faer::prelude::SpSolver;
use faer::solvers::PartialPivLu;
use faer::{FaerMat, Mat};
use num_complex::Complex64;
use sprs::{CsMat, TriMat};
use vera_core::{VgError, VgResult};

/// `y = A·x` for a real CSR matrix.
pub fn csr_mat_vec(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    debug_assert!(a.is_csr());
    let mut y = vec![0.0; a.rows()];
    for (row, vec) in a.outer_iterator().enumerate() {
        let mut acc = 0.0;
        for (col, v) in vec.iter() {
            acc += v * x[col];
        }
        y[row] = acc;
    }
    y
}

/// `y = A·x` for a complex CSR matrix.
pub fn csr_mat_vec_cx(a: &CsMat<Complex64>, x: &[Complex64]) -> Vec<Complex64> {
    debug_assert!(a.is_csr());
    let mut y = vec![Complex64::new(0.0, 0.0); a.rows()];
    for (row, vec) in a.outer_iterator().enumerate() {
        let mut acc = Complex64::new(0.0, 0.0);
        for (col, v) in vec.iter() {
            acc += v * x[col];
        }
        y[row] = acc;
    }
    y
}

/// Densify a real sparse matrix into a faer matrix, accumulating duplicates.
pub fn to_dense(a: &CsMat<f64>) -> Mat<f64> {
    let mut m = Mat::zeros(a.rows(), a.cols());
    for (v, (r, c)) in a.iter() {
        m.write(r, c, m.read(r, c) + *v);
    }
    m
}

/// LU-factorize a sparse matrix (through a dense copy).
pub fn factorize(a: &CsMat<f64>) -> PartialPivLu<f64> {
    to_dense(a).partial_piv_lu()
}

/// Solve `A·x = b` through an existing factorization, rejecting non-finite
/// solutions as singular.
pub fn lu_solve(lu: &PartialPivLu<f64>, b: &[f64]) -> VgResult<Vec<f64>> {
    let n = b.len();
    let mut rhs = Mat::zeros(n, 1);
    for i in 0..n {
        rhs.write(i, 0, b[i]);
    }
    let sol = lu.solve(&rhs);
    let x: Vec<f64> = (0..n).map(|i| sol.read(i, 0)).collect();
    if x.iter().any(|v| !v.is_finite()) {
        return Err(VgError::SingularJacobian("non-finite LU solution".into()));
    }
    Ok(x)
}

/// Solve `A·x = b` once, factorizing on the spot.
pub fn solve_sparse(a: &CsMat<f64>, b: &[f64]) -> VgResult<Vec<f64>> {
    lu_solve(&factorize(a), b)
}

/// Extract the `rows × cols` complex submatrix `A[rows, cols]` as dense.
pub fn slice_dense_cx(a: &CsMat<Complex64>, rows: &[usize], cols: &[usize]) -> Vec<Vec<Complex64>> {
    let col_pos: std::collections::HashMap<usize, usize> =
        cols.iter().enumerate().map(|(k, &c)| (c, k)).collect();
    let row_pos: std::collections::HashMap<usize, usize> =
        rows.iter().enumerate().map(|(k, &r)| (r, k)).collect();
    let mut out = vec![vec![Complex64::new(0.0, 0.0); cols.len()]; rows.len()];
    for (v, (r, c)) in a.iter() {
        if let (Some(&ri), Some(&ci)) = (row_pos.get(&r), col_pos.get(&c)) {
            out[ri][ci] += *v;
        }
    }
    out
}

/// Dense complex LU solve with partial pivoting: `A·X = B` where `B` has
/// `ncols_b` columns. Returns `Err` on a pivot below `1e-12`.
pub fn dense_solve_cx(
    a: &[Vec<Complex64>],
    b: &mut [Vec<Complex64>],
) -> VgResult<()> {
    let n = a.len();
    if n == 0 {
        return Ok(());
    }
    let ncols_b = b[0].len();
    let mut lu: Vec<Vec<Complex64>> = a.to_vec();

    for k in 0..n {
        // partial pivoting
        let mut max_val = lu[k][k].norm();
        let mut max_row = k;
        for i in (k + 1)..n {
            if lu[i][k].norm() > max_val {
                max_val = lu[i][k].norm();
                max_row = i;
            }
        }
        if max_val < 1e-12 {
            return Err(VgError::SingularJacobian(
                "singular complex system".into(),
            ));
        }
        if max_row != k {
            lu.swap(k, max_row);
            b.swap(k, max_row);
        }
        for i in (k + 1)..n {
            let factor = lu[i][k] / lu[k][k];
            lu[i][k] = factor;
            for j in (k + 1)..n {
                let sub = factor * lu[k][j];
                lu[i][j] -= sub;
            }
            for j in 0..ncols_b {
                let sub = factor * b[k][j];
                b[i][j] -= sub;
            }
        }
    }

    for i in (0..n).rev() {
        for j in 0..ncols_b {
            let mut sum = b[i][j];
            for k2 in (i + 1)..n {
                sum -= lu[i][k2] * b[k2][j];
            }
            b[i][j] = sum / lu[i][i];
        }
    }
    Ok(())
}

/// Build a CSR matrix from triplets with stable (row, col) ordering.
pub fn from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[(usize, usize, f64)],
) -> CsMat<f64> {
    let mut tri = TriMat::new((nrows, ncols));
    for &(r, c, v) in triplets {
        tri.add_triplet(r, c, v);
    }
    tri.to_csr()
}
