//! # vera-algo: Numerical algorithms for power-system analysis
//!
//! Everything that turns a grid model into numbers:
//!
//! - [`compiler`] - project a `MultiCircuit` at one time index into flat
//!   arrays with sparse connectivity and an island partition.
//! - [`admittance`] - Ybus / Yf / Yt assembly from branch primitives.
//! - [`power_flow`] - Newton–Raphson (positive-sequence and unbalanced
//!   three-phase), the linear DC solver, snapshot and time-series drivers.
//! - [`linear`] - PTDF / LODF sensitivity factors and the fast N−1 scan.
//! - [`contingency`] - snapshot and time-series contingency analysis with
//!   SRAP mitigation.
//! - [`reduction`] - Ward and PTDF-based external-grid equivalents.
//! - [`reliability`] - sequential Monte-Carlo adequacy and grid metrics.
//!
//! All drivers share the same surface: an immutable options record,
//! `run()`, a results value, `cancel()` through an atomic flag observed at
//! iteration boundaries, and progress/text callbacks with an append-only
//! logger.

pub mod admittance;
pub mod compiler;
pub mod contingency;
pub mod linear;
pub mod power_flow;
pub mod reduction;
pub mod reliability;
pub mod sparse;

pub use admittance::{build_admittances, AdmittanceMatrices};
pub use compiler::{
    compile_numerical_circuit_at, BusType, DeviceRef, NumericalCircuit,
};
pub use contingency::{
    ContingencyAnalysisDriver, ContingencyAnalysisOptions, ContingencyAnalysisResults,
    ContingencyAnalysisTimeSeriesDriver, ContingencyAnalysisTimeSeriesResults,
    ContingencyMethod, ContingencyReport,
};
pub use linear::{
    linear_contingency_scan, LinearAnalysis, LinearAnalysisOptions, LinearScanResults,
    SensitivityError,
};
pub use power_flow::{
    ClusteringResults, NewtonBackend, PowerFlowBackend, PowerFlowDriver, PowerFlowOptions,
    PowerFlowResults, PowerFlowTimeSeriesDriver, SolverType,
};
pub use reduction::{ptdf_reduction, ward_standard_reduction};
pub use reliability::{
    ReliabilityDriver, ReliabilityMode, ReliabilityOptions, ReliabilityResults,
};
