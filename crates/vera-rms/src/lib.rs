//! # vera-rms: Symbolic DAE engine and RMS dynamics
//!
//! Everything needed to describe, compile and integrate a
//! differential-algebraic model of grid dynamics:
//!
//! - [`symbolic`] - persistent expression trees with differentiation,
//!   simplification and substitution.
//! - [`tape`] - "compile once, evaluate many": expressions lower to a flat
//!   opcode tape with common-subexpression sharing, and Jacobians to
//!   pre-structured sparse CSC evaluators.
//! - [`block`] - hierarchical composition of model pieces with ports,
//!   flattened depth-first into one ordered DAE system.
//! - [`solver`] - implicit-Euler / trapezoidal integration with parameter
//!   events and Newton iteration over the packed block Jacobian.
//! - [`small_signal`] - eigenanalysis of the reduced state matrix with
//!   damping ratios and participation factors.
//!
//! The compiled evaluators are pure: they read caller-owned buffers and
//! carry no hidden state, so one compiled model can serve many threads.

pub mod block;
pub mod small_signal;
pub mod solver;
pub mod symbolic;
pub mod tape;

pub use block::{swing_block, Block, FlatSystem, SwingVars};
pub use small_signal::{
    run_small_signal, state_matrix, SmallSignalOptions, SmallSignalResults, StabilityClass,
};
pub use solver::{
    BlockSolver, IntegrationMethod, RmsDriver, RmsEvent, RmsEvents, RmsOptions, RmsSolution,
};
pub use symbolic::{abs, cos, exp, log, sin, BinaryOp, Expr, SymbolicError, UnaryOp, Var, VarUid};
pub use tape::{compile_expressions, compile_jacobian, SlotMap, SparseJacobian, Tape};
