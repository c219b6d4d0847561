//! Symbolic scalar expressions: persistent trees with differentiation,
//! simplification and substitution.
//!
//! Expressions are immutable and share subtrees through `Arc`, so cloning is
//! cheap and a compiled evaluator can be shared read-only across threads.
//! Every node carries a content hash computed at construction; the code
//! generator uses it to detect common subexpressions.
//!
//! ```
//! use vera_rms::symbolic::{Var, Expr};
//!
//! let x = Var::new("x");
//! let f = Expr::from(&x) * Expr::from(&x) + Expr::c(2.0) * Expr::from(&x);
//! let df = f.diff(&x).simplify().unwrap();
//! // df = 2x + 2
//! let val = df.eval(&[(x.uid, 3.0)].into_iter().collect()).unwrap();
//! assert_eq!(val, 8.0);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Uid of a symbolic variable.
pub type VarUid = u64;

static NEXT_VAR_UID: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by the symbolic layer.
#[derive(Debug, Error)]
pub enum SymbolicError {
    /// Simplification found `x / 0` with a constant zero denominator.
    #[error("Division by constant zero")]
    DivisionByConstZero,

    /// Evaluation or code generation met a variable with no value/slot.
    #[error("Unbound variable '{name}' (uid {uid})")]
    UnboundVariable { name: String, uid: VarUid },
}

impl From<SymbolicError> for vera_core::VgError {
    fn from(err: SymbolicError) -> Self {
        match err {
            SymbolicError::UnboundVariable { name, uid } => {
                vera_core::VgError::UnboundVariable { name, uid }
            }
            other => vera_core::VgError::Other(other.to_string()),
        }
    }
}

/// A named symbolic variable. Identity is the uid; the name is for humans.
#[derive(Debug, Clone)]
pub struct Var {
    pub uid: VarUid,
    pub name: Arc<str>,
}

impl Var {
    /// Fresh variable with a new uid.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            uid: NEXT_VAR_UID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_ref()),
        }
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}
impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

/// Unary function kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Exp,
    Log,
    Abs,
}

impl UnaryOp {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            UnaryOp::Neg => -v,
            UnaryOp::Sin => v.sin(),
            UnaryOp::Cos => v.cos(),
            UnaryOp::Exp => v.exp(),
            UnaryOp::Log => v.ln(),
            UnaryOp::Abs => v.abs(),
        }
    }
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }
}

/// Immutable expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    Const(f64),
    Var(Var),
    Unary {
        op: UnaryOp,
        arg: Arc<Expr>,
        hash: u64,
    },
    Binary {
        op: BinaryOp,
        lhs: Arc<Expr>,
        rhs: Arc<Expr>,
        hash: u64,
    },
}

fn hash2(tag: u64, a: u64, b: u64) -> u64 {
    let mut h = DefaultHasher::new();
    tag.hash(&mut h);
    a.hash(&mut h);
    b.hash(&mut h);
    h.finish()
}

impl Expr {
    /// Constant shorthand.
    pub fn c(value: f64) -> Self {
        Expr::Const(value)
    }

    /// Content hash used for common-subexpression detection.
    pub fn content_hash(&self) -> u64 {
        match self {
            Expr::Const(v) => hash2(0, v.to_bits(), 0),
            Expr::Var(v) => hash2(1, v.uid, 0),
            Expr::Unary { hash, .. } => *hash,
            Expr::Binary { hash, .. } => *hash,
        }
    }

    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        let h = hash2(2 + op as u64, arg.content_hash(), 0);
        Expr::Unary {
            op,
            arg: Arc::new(arg),
            hash: h,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        let h = hash2(100 + op as u64, lhs.content_hash(), rhs.content_hash());
        Expr::Binary {
            op,
            lhs: Arc::new(lhs),
            rhs: Arc::new(rhs),
            hash: h,
        }
    }

    pub fn pow(self, exponent: Expr) -> Self {
        Expr::binary(BinaryOp::Pow, self, exponent)
    }

    pub fn powi(self, exponent: i32) -> Self {
        Expr::binary(BinaryOp::Pow, self, Expr::Const(exponent as f64))
    }

    /// Constant value if this node is a constant.
    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(v) if *v == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Const(v) if *v == 1.0)
    }

    /// Set of variable uids appearing in the tree.
    pub fn free_vars(&self, out: &mut HashMap<VarUid, Arc<str>>) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => {
                out.insert(v.uid, Arc::clone(&v.name));
            }
            Expr::Unary { arg, .. } => arg.free_vars(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.free_vars(out);
                rhs.free_vars(out);
            }
        }
    }

    // ------------------------------------------------------------------
    // differentiation
    // ------------------------------------------------------------------

    /// Symbolic derivative with respect to `var`. `diff(x, x) == 1` and
    /// `diff(c, x) == 0` hold structurally.
    pub fn diff(&self, var: &Var) -> Expr {
        match self {
            Expr::Const(_) => Expr::Const(0.0),
            Expr::Var(v) => {
                if v.uid == var.uid {
                    Expr::Const(1.0)
                } else {
                    Expr::Const(0.0)
                }
            }
            Expr::Unary { op, arg, .. } => {
                let da = arg.diff(var);
                if da.is_zero() {
                    return Expr::Const(0.0);
                }
                let inner = (**arg).clone();
                let outer = match op {
                    UnaryOp::Neg => Expr::Const(-1.0),
                    UnaryOp::Sin => Expr::unary(UnaryOp::Cos, inner),
                    UnaryOp::Cos => {
                        Expr::unary(UnaryOp::Neg, Expr::unary(UnaryOp::Sin, inner))
                    }
                    UnaryOp::Exp => Expr::unary(UnaryOp::Exp, inner),
                    UnaryOp::Log => Expr::binary(BinaryOp::Div, Expr::Const(1.0), inner),
                    // d|u|/du = sign(u), expressed as u / |u|
                    UnaryOp::Abs => Expr::binary(
                        BinaryOp::Div,
                        inner.clone(),
                        Expr::unary(UnaryOp::Abs, inner),
                    ),
                };
                Expr::binary(BinaryOp::Mul, outer, da)
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let u = (**lhs).clone();
                let v = (**rhs).clone();
                let du = lhs.diff(var);
                let dv = rhs.diff(var);
                match op {
                    BinaryOp::Add => Expr::binary(BinaryOp::Add, du, dv),
                    BinaryOp::Sub => Expr::binary(BinaryOp::Sub, du, dv),
                    BinaryOp::Mul => Expr::binary(
                        BinaryOp::Add,
                        Expr::binary(BinaryOp::Mul, du, v),
                        Expr::binary(BinaryOp::Mul, u, dv),
                    ),
                    BinaryOp::Div => {
                        // (u'v - uv') / v^2
                        let num = Expr::binary(
                            BinaryOp::Sub,
                            Expr::binary(BinaryOp::Mul, du, v.clone()),
                            Expr::binary(BinaryOp::Mul, u, dv),
                        );
                        let den = Expr::binary(BinaryOp::Mul, v.clone(), v);
                        Expr::binary(BinaryOp::Div, num, den)
                    }
                    BinaryOp::Pow => {
                        if let Some(c) = rhs.as_const() {
                            // d(u^c) = c * u^(c-1) * u'
                            Expr::binary(
                                BinaryOp::Mul,
                                Expr::binary(
                                    BinaryOp::Mul,
                                    Expr::Const(c),
                                    Expr::binary(BinaryOp::Pow, u, Expr::Const(c - 1.0)),
                                ),
                                du,
                            )
                        } else {
                            // d(u^v) = u^v * (v' ln u + v u' / u)
                            let term1 =
                                Expr::binary(BinaryOp::Mul, dv, Expr::unary(UnaryOp::Log, u.clone()));
                            let term2 = Expr::binary(
                                BinaryOp::Div,
                                Expr::binary(BinaryOp::Mul, v.clone(), du),
                                u.clone(),
                            );
                            Expr::binary(
                                BinaryOp::Mul,
                                Expr::binary(BinaryOp::Pow, u, v),
                                Expr::binary(BinaryOp::Add, term1, term2),
                            )
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // simplification
    // ------------------------------------------------------------------

    /// Constant folding and identity elimination. Idempotent: applying it
    /// twice yields a structurally identical tree.
    pub fn simplify(&self) -> Result<Expr, SymbolicError> {
        match self {
            Expr::Const(_) | Expr::Var(_) => Ok(self.clone()),
            Expr::Unary { op, arg, .. } => {
                let a = arg.simplify()?;
                if let Some(v) = a.as_const() {
                    return Ok(Expr::Const(op.apply(v)));
                }
                // --x = x
                if *op == UnaryOp::Neg {
                    if let Expr::Unary {
                        op: UnaryOp::Neg,
                        arg: inner,
                        ..
                    } = &a
                    {
                        return Ok((**inner).clone());
                    }
                }
                Ok(Expr::unary(*op, a))
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let l = lhs.simplify()?;
                let r = rhs.simplify()?;

                if let (Some(a), Some(b)) = (l.as_const(), r.as_const()) {
                    if *op == BinaryOp::Div && b == 0.0 {
                        return Err(SymbolicError::DivisionByConstZero);
                    }
                    return Ok(Expr::Const(op.apply(a, b)));
                }

                match op {
                    BinaryOp::Add => {
                        if l.is_zero() {
                            return Ok(r);
                        }
                        if r.is_zero() {
                            return Ok(l);
                        }
                    }
                    BinaryOp::Sub => {
                        if r.is_zero() {
                            return Ok(l);
                        }
                        if l.is_zero() {
                            return Ok(Expr::unary(UnaryOp::Neg, r));
                        }
                    }
                    BinaryOp::Mul => {
                        if l.is_zero() || r.is_zero() {
                            return Ok(Expr::Const(0.0));
                        }
                        if l.is_one() {
                            return Ok(r);
                        }
                        if r.is_one() {
                            return Ok(l);
                        }
                    }
                    BinaryOp::Div => {
                        if r.is_zero() && r.as_const().is_some() {
                            return Err(SymbolicError::DivisionByConstZero);
                        }
                        if l.is_zero() {
                            return Ok(Expr::Const(0.0));
                        }
                        if r.is_one() {
                            return Ok(l);
                        }
                    }
                    BinaryOp::Pow => {
                        if let Some(e) = r.as_const() {
                            if e == 0.0 {
                                return Ok(Expr::Const(1.0));
                            }
                            if e == 1.0 {
                                return Ok(l);
                            }
                        }
                    }
                }
                Ok(Expr::binary(*op, l, r))
            }
        }
    }

    // ------------------------------------------------------------------
    // substitution & evaluation
    // ------------------------------------------------------------------

    /// Non-capturing substitution of whole variables by expressions.
    pub fn subs(&self, map: &HashMap<VarUid, Expr>) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Var(v) => map.get(&v.uid).cloned().unwrap_or_else(|| self.clone()),
            Expr::Unary { op, arg, .. } => Expr::unary(*op, arg.subs(map)),
            Expr::Binary { op, lhs, rhs, .. } => {
                Expr::binary(*op, lhs.subs(map), rhs.subs(map))
            }
        }
    }

    /// Numerical evaluation against a variable-value environment.
    pub fn eval(&self, env: &HashMap<VarUid, f64>) -> Result<f64, SymbolicError> {
        match self {
            Expr::Const(v) => Ok(*v),
            Expr::Var(v) => env
                .get(&v.uid)
                .copied()
                .ok_or_else(|| SymbolicError::UnboundVariable {
                    name: v.name.to_string(),
                    uid: v.uid,
                }),
            Expr::Unary { op, arg, .. } => Ok(op.apply(arg.eval(env)?)),
            Expr::Binary { op, lhs, rhs, .. } => Ok(op.apply(lhs.eval(env)?, rhs.eval(env)?)),
        }
    }

    /// Structural equality through content hashes (fast path) and shape.
    pub fn structurally_eq(&self, other: &Expr) -> bool {
        self.content_hash() == other.content_hash()
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Expr::Var(v.clone())
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Expr::Var(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Const(v)
    }
}

macro_rules! impl_expr_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self, rhs.clone())
            }
        }

        impl $trait<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs)
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self, Expr::Const(rhs))
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, Expr::Const(self), rhs)
            }
        }
    };
}

impl_expr_binop!(Add, add, BinaryOp::Add);
impl_expr_binop!(Sub, sub, BinaryOp::Sub);
impl_expr_binop!(Mul, mul, BinaryOp::Mul);
impl_expr_binop!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

/// Free-function sugar matching the usual math notation.
pub fn sin(e: Expr) -> Expr {
    Expr::unary(UnaryOp::Sin, e)
}

pub fn cos(e: Expr) -> Expr {
    Expr::unary(UnaryOp::Cos, e)
}

pub fn exp(e: Expr) -> Expr {
    Expr::unary(UnaryOp::Exp, e)
}

pub fn log(e: Expr) -> Expr {
    Expr::unary(UnaryOp::Log, e)
}

pub fn abs(e: Expr) -> Expr {
    Expr::unary(UnaryOp::Abs, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&Var, f64)]) -> HashMap<VarUid, f64> {
        pairs.iter().map(|(v, x)| (v.uid, *x)).collect()
    }

    #[test]
    fn test_diff_basics() {
        let x = Var::new("x");
        let y = Var::new("y");
        // d(x)/dx = 1, d(c)/dx = 0, d(y)/dx = 0
        assert_eq!(Expr::from(&x).diff(&x).as_const(), Some(1.0));
        assert_eq!(Expr::c(3.0).diff(&x).as_const(), Some(0.0));
        assert_eq!(Expr::from(&y).diff(&x).as_const(), Some(0.0));
    }

    #[test]
    fn test_diff_product_rule() {
        let x = Var::new("x");
        // d(x * sin x)/dx = sin x + x cos x
        let f = Expr::from(&x) * sin(Expr::from(&x));
        let df = f.diff(&x).simplify().unwrap();
        let at = |v: f64| df.eval(&env(&[(&x, v)])).unwrap();
        let expected = |v: f64| v.sin() + v * v.cos();
        for v in [0.0, 0.5, 1.3, -2.0] {
            assert!((at(v) - expected(v)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_diff_quotient_and_pow() {
        let x = Var::new("x");
        let f = Expr::c(1.0) / Expr::from(&x);
        let df = f.diff(&x).simplify().unwrap();
        let v = df.eval(&env(&[(&x, 2.0)])).unwrap();
        assert!((v - (-0.25)).abs() < 1e-12);

        let g = Expr::from(&x).powi(3);
        let dg = g.diff(&x).simplify().unwrap();
        let v = dg.eval(&env(&[(&x, 2.0)])).unwrap();
        assert!((v - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_simplify_identities() {
        let x = Var::new("x");
        let e = (Expr::from(&x) * 1.0 + 0.0) * Expr::c(1.0);
        let s = e.simplify().unwrap();
        assert!(matches!(s, Expr::Var(ref v) if v.uid == x.uid));
    }

    #[test]
    fn test_simplify_idempotent() {
        let x = Var::new("x");
        let e = sin(Expr::from(&x) * 2.0 + 0.0) * Expr::c(1.0) + Expr::c(2.0) * Expr::c(3.0);
        let s1 = e.simplify().unwrap();
        let s2 = s1.simplify().unwrap();
        assert!(s1.structurally_eq(&s2));
    }

    #[test]
    fn test_division_by_const_zero() {
        let x = Var::new("x");
        let e = Expr::from(&x) / Expr::c(0.0);
        assert!(matches!(
            e.simplify(),
            Err(SymbolicError::DivisionByConstZero)
        ));
    }

    #[test]
    fn test_subs_is_non_capturing() {
        let x = Var::new("x");
        let y = Var::new("y");
        // substitute x -> y + 1 in x * x
        let f = Expr::from(&x) * Expr::from(&x);
        let mut map = HashMap::new();
        map.insert(x.uid, Expr::from(&y) + 1.0);
        let g = f.subs(&map);
        let v = g.eval(&env(&[(&y, 2.0)])).unwrap();
        assert_eq!(v, 9.0);
    }

    #[test]
    fn test_taylor_identity() {
        // simplify(diff(f, x) * (x1 - x0) + f(x0)) - f(x1) is O(h^2)
        let x = Var::new("x");
        let f = sin(Expr::from(&x)) * Expr::from(&x);
        let df = f.diff(&x).simplify().unwrap();

        let x0 = 0.7;
        for h in [1e-2, 1e-3, 1e-4] {
            let x1 = x0 + h;
            let f0 = f.eval(&env(&[(&x, x0)])).unwrap();
            let f1 = f.eval(&env(&[(&x, x1)])).unwrap();
            let d0 = df.eval(&env(&[(&x, x0)])).unwrap();
            let linear = f0 + d0 * h;
            let err = (linear - f1).abs();
            // second-order remainder: err <= C h^2 with a modest constant
            assert!(err < 10.0 * h * h, "h={h}, err={err}");
        }
    }

    #[test]
    fn test_unbound_variable() {
        let x = Var::new("x");
        let e = Expr::from(&x) + 1.0;
        let err = e.eval(&HashMap::new()).unwrap_err();
        assert!(matches!(err, SymbolicError::UnboundVariable { .. }));
    }
}
