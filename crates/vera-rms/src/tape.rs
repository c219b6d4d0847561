//! Flat-tape code generation: compile once, evaluate many.
//!
//! A list of expressions is lowered into a linear sequence of register
//! opcodes sharing common subexpressions (detected by content hash). The
//! tape reads variables and parameters from caller-provided slices and
//! writes a dense output vector, with no hidden state: evaluation with
//! distinct buffers is safe from concurrent threads.
//!
//! The Jacobian generator differentiates every (equation, variable) pair,
//! drops structural zeros, and precomputes the CSC sparsity (`indptr`,
//! `indices`); only `data` is produced at call time.

use crate::symbolic::{BinaryOp, Expr, SymbolicError, UnaryOp, VarUid};
use sprs::CsMat;
use std::collections::HashMap;

/// Maps variable uids to slots in the `vars[]` / `params[]` input vectors,
/// plus the optional time variable.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    pub vars: HashMap<VarUid, usize>,
    pub params: HashMap<VarUid, usize>,
    pub time: Option<VarUid>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }
}

/// One elementary operation over the register file.
#[derive(Debug, Clone, Copy)]
enum OpCode {
    LoadVar { slot: usize, dst: usize },
    LoadParam { slot: usize, dst: usize },
    LoadConst { idx: usize, dst: usize },
    LoadTime { dst: usize },
    Unary { op: UnaryOp, src: usize, dst: usize },
    Binary { op: BinaryOp, lhs: usize, rhs: usize, dst: usize },
    Store { src: usize, out: usize },
}

/// Compiled evaluator for an ordered list of expressions.
#[derive(Debug, Clone)]
pub struct Tape {
    ops: Vec<OpCode>,
    consts: Vec<f64>,
    n_regs: usize,
    n_out: usize,
}

impl Tape {
    pub fn n_outputs(&self) -> usize {
        self.n_out
    }

    /// Evaluate every compiled expression into `out` (`len == n_outputs`).
    /// Pure: scratch registers live on this call's stack frame.
    pub fn eval(&self, vars: &[f64], params: &[f64], t: f64, out: &mut [f64]) {
        debug_assert!(out.len() >= self.n_out);
        let mut regs = vec![0.0f64; self.n_regs];
        for op in &self.ops {
            match *op {
                OpCode::LoadVar { slot, dst } => regs[dst] = vars[slot],
                OpCode::LoadParam { slot, dst } => regs[dst] = params[slot],
                OpCode::LoadConst { idx, dst } => regs[dst] = self.consts[idx],
                OpCode::LoadTime { dst } => regs[dst] = t,
                OpCode::Unary { op, src, dst } => regs[dst] = op.apply(regs[src]),
                OpCode::Binary { op, lhs, rhs, dst } => {
                    regs[dst] = op.apply(regs[lhs], regs[rhs])
                }
                OpCode::Store { src, out: o } => out[o] = regs[src],
            }
        }
    }

    /// Convenience allocation-returning variant.
    pub fn eval_vec(&self, vars: &[f64], params: &[f64], t: f64) -> Vec<f64> {
        let mut out = vec![0.0; self.n_out];
        self.eval(vars, params, t, &mut out);
        out
    }
}

struct TapeBuilder<'a> {
    slots: &'a SlotMap,
    ops: Vec<OpCode>,
    consts: Vec<f64>,
    const_cache: HashMap<u64, usize>,
    // content hash -> register holding the subexpression
    cse: HashMap<u64, usize>,
    n_regs: usize,
}

impl<'a> TapeBuilder<'a> {
    fn new(slots: &'a SlotMap) -> Self {
        Self {
            slots,
            ops: Vec::new(),
            consts: Vec::new(),
            const_cache: HashMap::new(),
            cse: HashMap::new(),
            n_regs: 0,
        }
    }

    fn fresh_reg(&mut self) -> usize {
        let r = self.n_regs;
        self.n_regs += 1;
        r
    }

    fn emit(&mut self, expr: &Expr) -> Result<usize, SymbolicError> {
        let key = expr.content_hash();
        if let Some(&reg) = self.cse.get(&key) {
            return Ok(reg);
        }
        let reg = match expr {
            Expr::Const(v) => {
                let idx = match self.const_cache.get(&v.to_bits()) {
                    Some(&i) => i,
                    None => {
                        let i = self.consts.len();
                        self.consts.push(*v);
                        self.const_cache.insert(v.to_bits(), i);
                        i
                    }
                };
                let dst = self.fresh_reg();
                self.ops.push(OpCode::LoadConst { idx, dst });
                dst
            }
            Expr::Var(v) => {
                let dst = self.fresh_reg();
                if self.slots.time == Some(v.uid) {
                    self.ops.push(OpCode::LoadTime { dst });
                } else if let Some(&slot) = self.slots.vars.get(&v.uid) {
                    self.ops.push(OpCode::LoadVar { slot, dst });
                } else if let Some(&slot) = self.slots.params.get(&v.uid) {
                    self.ops.push(OpCode::LoadParam { slot, dst });
                } else {
                    return Err(SymbolicError::UnboundVariable {
                        name: v.name.to_string(),
                        uid: v.uid,
                    });
                }
                dst
            }
            Expr::Unary { op, arg, .. } => {
                let src = self.emit(arg)?;
                let dst = self.fresh_reg();
                self.ops.push(OpCode::Unary { op: *op, src, dst });
                dst
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let l = self.emit(lhs)?;
                let r = self.emit(rhs)?;
                let dst = self.fresh_reg();
                self.ops.push(OpCode::Binary {
                    op: *op,
                    lhs: l,
                    rhs: r,
                    dst,
                });
                dst
            }
        };
        self.cse.insert(key, reg);
        Ok(reg)
    }
}

/// Compile an ordered list of expressions against a slot mapping.
///
/// Fails with `UnboundVariable` if any expression references a uid without a
/// slot.
pub fn compile_expressions(exprs: &[Expr], slots: &SlotMap) -> Result<Tape, SymbolicError> {
    let mut builder = TapeBuilder::new(slots);
    let mut stores = Vec::with_capacity(exprs.len());
    for (i, e) in exprs.iter().enumerate() {
        let simplified = e.simplify()?;
        let src = builder.emit(&simplified)?;
        stores.push(OpCode::Store { src, out: i });
    }
    builder.ops.extend(stores);
    Ok(Tape {
        ops: builder.ops,
        consts: builder.consts,
        n_regs: builder.n_regs.max(1),
        n_out: exprs.len(),
    })
}

/// Pre-structured CSC Jacobian evaluator: the sparsity pattern is fixed at
/// compile time, only the numerical values are produced per call.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    nrows: usize,
    ncols: usize,
    /// CSC column pointers (len = ncols + 1)
    indptr: Vec<usize>,
    /// CSC row indices (len = nnz)
    indices: Vec<usize>,
    /// Tape producing `data` in the same order as `indices`
    tape: Tape,
}

impl SparseJacobian {
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Evaluate the nonzero values.
    pub fn eval_data(&self, vars: &[f64], params: &[f64], t: f64) -> Vec<f64> {
        self.tape.eval_vec(vars, params, t)
    }

    /// Evaluate into a CSC matrix.
    pub fn eval(&self, vars: &[f64], params: &[f64], t: f64) -> CsMat<f64> {
        let data = self.eval_data(vars, params, t);
        CsMat::new_csc(
            (self.nrows, self.ncols),
            self.indptr.clone(),
            self.indices.clone(),
            data,
        )
    }
}

/// Differentiate `eqs` with respect to `vars` and compile a sparse CSC
/// evaluator. Structural zeros are dropped before compilation.
pub fn compile_jacobian(
    eqs: &[Expr],
    vars: &[crate::symbolic::Var],
    slots: &SlotMap,
) -> Result<SparseJacobian, SymbolicError> {
    // (col, row, derivative), collected column-major for the CSC layout
    let mut triplets: Vec<(usize, usize, Expr)> = Vec::new();
    for (row, eq) in eqs.iter().enumerate() {
        for (col, var) in vars.iter().enumerate() {
            let d = eq.diff(var).simplify()?;
            if d.is_zero() {
                continue; // structural zero
            }
            triplets.push((col, row, d));
        }
    }
    triplets.sort_by_key(|t| (t.0, t.1));

    let mut indptr = vec![0usize; vars.len() + 1];
    for &(c, _, _) in &triplets {
        indptr[c + 1] += 1;
    }
    for c in 0..vars.len() {
        indptr[c + 1] += indptr[c];
    }
    let indices: Vec<usize> = triplets.iter().map(|t| t.1).collect();
    let exprs: Vec<Expr> = triplets.into_iter().map(|t| t.2).collect();
    let tape = compile_expressions(&exprs, slots)?;

    Ok(SparseJacobian {
        nrows: eqs.len(),
        ncols: vars.len(),
        indptr,
        indices,
        tape,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::{cos, sin, Var};

    #[test]
    fn test_tape_matches_tree_eval() {
        let x = Var::new("x");
        let y = Var::new("y");
        let k = Var::new("k");

        let mut slots = SlotMap::new();
        slots.vars.insert(x.uid, 0);
        slots.vars.insert(y.uid, 1);
        slots.params.insert(k.uid, 0);

        let exprs = vec![
            sin(Expr::from(&x)) * Expr::from(&y) + Expr::from(&k),
            Expr::from(&x) * Expr::from(&x) - Expr::from(&y) / 2.0,
        ];

        let tape = compile_expressions(&exprs, &slots).unwrap();
        let out = tape.eval_vec(&[0.5, 2.0], &[3.0], 0.0);

        assert!((out[0] - (0.5f64.sin() * 2.0 + 3.0)).abs() < 1e-12);
        assert!((out[1] - (0.25 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_common_subexpression_shared() {
        let x = Var::new("x");
        let mut slots = SlotMap::new();
        slots.vars.insert(x.uid, 0);

        // sin(x) appears in both outputs; the tape should evaluate it once
        let exprs = vec![
            sin(Expr::from(&x)) * 2.0,
            sin(Expr::from(&x)) + cos(Expr::from(&x)),
        ];
        let tape = compile_expressions(&exprs, &slots).unwrap();
        let unary_count = tape
            .ops
            .iter()
            .filter(|op| matches!(op, OpCode::Unary { .. }))
            .count();
        // sin once, cos once
        assert_eq!(unary_count, 2);
    }

    #[test]
    fn test_unbound_variable_fails_compile() {
        let x = Var::new("x");
        let slots = SlotMap::new();
        let err = compile_expressions(&[Expr::from(&x)], &slots).unwrap_err();
        assert!(matches!(err, SymbolicError::UnboundVariable { .. }));
    }

    #[test]
    fn test_jacobian_structure_and_values() {
        let x = Var::new("x");
        let y = Var::new("y");
        let mut slots = SlotMap::new();
        slots.vars.insert(x.uid, 0);
        slots.vars.insert(y.uid, 1);

        // f0 = x^2 + y, f1 = sin(y)
        let eqs = vec![
            Expr::from(&x).powi(2) + Expr::from(&y),
            sin(Expr::from(&y)),
        ];
        let jac = compile_jacobian(&eqs, &[x.clone(), y.clone()], &slots).unwrap();
        assert_eq!(jac.shape(), (2, 2));
        // df1/dx is a structural zero
        assert_eq!(jac.nnz(), 3);

        let m = jac.eval(&[2.0, 0.5], &[], 0.0);
        assert!((m.get(0, 0).copied().unwrap() - 4.0).abs() < 1e-12);
        assert!((m.get(0, 1).copied().unwrap() - 1.0).abs() < 1e-12);
        assert!((m.get(1, 1).copied().unwrap() - 0.5f64.cos()).abs() < 1e-12);
        assert!(m.get(1, 0).is_none());
    }

    #[test]
    fn test_time_slot() {
        let t = Var::new("t");
        let mut slots = SlotMap::new();
        slots.time = Some(t.uid);
        let tape = compile_expressions(&[Expr::from(&t) * 2.0], &slots).unwrap();
        let out = tape.eval_vec(&[], &[], 1.5);
        assert!((out[0] - 3.0).abs() < 1e-12);
    }
}
