//! # vera-core: Power Grid Modeling Core
//!
//! Fundamental data structures for power system analysis: the typed device
//! catalogue, the [`MultiCircuit`] root aggregate, time profiles, and the
//! uniform driver surface (options / results / run / cancel / progress).
//!
//! ## Design Philosophy
//!
//! The grid is a catalogue of devices, not a class hierarchy:
//! - **Buses** are the nodes; every other device references them by id.
//! - **Branches** (lines, transformers, series reactances, switches) connect
//!   two buses and carry series impedance, shunt charging and ratings.
//! - **Injections** (generators, batteries, loads, static generators,
//!   shunts, external grids) attach to exactly one bus.
//!
//! Polymorphism is expressed with tagged variants ([`BranchKind`],
//! [`ContingencyAction`]) so that the table-oriented persistence layer can
//! map every field through the property [`registry`] without reflection.
//!
//! Numerical work never happens here. Simulation crates project a
//! `MultiCircuit` into flat arrays at one time index and operate on those;
//! the `MultiCircuit` stays immutable for the whole driver run.
//!
//! ## Quick Start
//!
//! ```rust
//! use vera_core::*;
//!
//! let mut grid = MultiCircuit::new("two-bus");
//! let b1 = grid.add_bus(Bus::new("Bus 1", 132.0).as_slack());
//! let b2 = grid.add_bus(Bus::new("Bus 2", 132.0));
//! grid.add_branch(Branch::line("L12", b1, b2, 0.0, 0.1).with_rating(100.0));
//! grid.add_generator(b1, Gen::new("G1", 50.0));
//! grid.add_load(b2, Load::new("Ld", 50.0, 0.0));
//!
//! let mut log = Logger::new();
//! grid.validate_into(&mut log);
//! assert!(!log.has_errors());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod driver;
pub mod error;
pub mod profile;
pub mod registry;
pub mod units;

pub use driver::{DriverHarness, LogEntry, Logger, Severity};
pub use error::{VgError, VgResult};
pub use profile::{BoolProfile, DenseProfile, NumProfile, Profile, SparsePatchProfile, TimeAxis};
pub use registry::{registered_properties, required_columns, DeviceKind, PropertySpec};
pub use units::{
    Hours, Kilovolts, MegavoltAmperes, Megavars, Megawatts, MegawattHours, PerUnit, Radians,
};

/// Global uid source. Uids are unique within a process and are only used as
/// opaque handles (logging, contingency events, archive round-trips).
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh device uid.
pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Reserve uid space after loading an archive so new devices don't collide.
pub fn bump_uid_floor(min_next: u64) {
    NEXT_UID.fetch_max(min_next, Ordering::Relaxed);
}

// Newtype wrappers for ids: type safety against mixing device families.
macro_rules! impl_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub fn new(value: usize) -> Self {
                $name(value)
            }
            #[inline]
            pub fn value(&self) -> usize {
                self.0
            }
        }
    };
}

impl_id!(BusId);
impl_id!(BranchId);
impl_id!(HvdcId);
impl_id!(VscId);
impl_id!(GenId);
impl_id!(BatteryId);
impl_id!(LoadId);
impl_id!(StaticGenId);
impl_id!(ShuntId);
impl_id!(ExternalGridId);
impl_id!(ContingencyGroupId);

/// A node of the electrical network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub uid: u64,
    pub name: String,
    /// Nominal voltage (for per-unit conversions and transformer checks)
    pub vnom: Kilovolts,
    /// Minimum operational voltage
    pub vmin: PerUnit,
    /// Maximum operational voltage
    pub vmax: PerUnit,
    /// Voltage-reference bus flag; one per island after compilation
    pub is_slack: bool,
    pub active: bool,
    pub area_id: Option<i64>,
    pub zone_id: Option<i64>,
    pub active_prof: Option<BoolProfile>,
}

impl Bus {
    pub fn new(name: impl Into<String>, vnom_kv: f64) -> Self {
        Self {
            id: BusId(0),
            uid: next_uid(),
            name: name.into(),
            vnom: Kilovolts(vnom_kv),
            vmin: PerUnit(0.9),
            vmax: PerUnit(1.1),
            is_slack: false,
            active: true,
            area_id: None,
            zone_id: None,
            active_prof: None,
        }
    }

    pub fn as_slack(mut self) -> Self {
        self.is_slack = true;
        self
    }

    pub fn with_voltage_limits(mut self, vmin: f64, vmax: f64) -> Self {
        self.vmin = PerUnit(vmin);
        self.vmax = PerUnit(vmax);
        self
    }
}

/// Branch variants. A two-winding transformer carries its winding voltages
/// so validation can check them against the endpoint buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BranchKind {
    Line,
    Transformer2W { hv_kv: f64, lv_kv: f64 },
    SeriesReactance,
    Switch,
}

impl BranchKind {
    pub fn label(&self) -> &'static str {
        match self {
            BranchKind::Line => "line",
            BranchKind::Transformer2W { .. } => "transformer",
            BranchKind::SeriesReactance => "series_reactance",
            BranchKind::Switch => "switch",
        }
    }
}

/// Passive branch between two buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub uid: u64,
    pub name: String,
    pub kind: BranchKind,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Series resistance (p.u. on the system base)
    pub r: f64,
    /// Series reactance (p.u.)
    pub x: f64,
    /// Total line charging susceptance (p.u., split half/half)
    pub b: f64,
    /// Thermal rating
    pub rate: MegavoltAmperes,
    /// Post-contingency (emergency) rating
    pub contingency_rate: MegavoltAmperes,
    /// Tap magnitude applied at the from side
    pub tap_module: f64,
    /// Phase shift applied at the from side
    pub tap_phase: Radians,
    /// Enable discrete tap-module voltage control
    pub tap_module_control: bool,
    /// Module-control voltage target at the to side
    pub tap_vset: PerUnit,
    /// Enable continuous phase control
    pub tap_phase_control: bool,
    /// Phase-control active-power target at the from side
    pub tap_pset: Megawatts,
    /// Include this branch in loading reports and the contingency scan
    pub monitor_loading: bool,
    pub active: bool,
    pub mttf: Hours,
    pub mttr: Hours,
    pub active_prof: Option<BoolProfile>,
    pub rate_prof: Option<NumProfile>,
}

impl Branch {
    fn base(name: impl Into<String>, kind: BranchKind, from: BusId, to: BusId) -> Self {
        Self {
            id: BranchId(0),
            uid: next_uid(),
            name: name.into(),
            kind,
            from_bus: from,
            to_bus: to,
            r: 0.0,
            x: 1e-20,
            b: 0.0,
            rate: MegavoltAmperes(0.0),
            contingency_rate: MegavoltAmperes(0.0),
            tap_module: 1.0,
            tap_phase: Radians(0.0),
            tap_module_control: false,
            tap_vset: PerUnit(1.0),
            tap_phase_control: false,
            tap_pset: Megawatts(0.0),
            monitor_loading: true,
            active: true,
            mttf: Hours(0.0),
            mttr: Hours(0.0),
            active_prof: None,
            rate_prof: None,
        }
    }

    pub fn line(name: impl Into<String>, from: BusId, to: BusId, r: f64, x: f64) -> Self {
        let mut br = Self::base(name, BranchKind::Line, from, to);
        br.r = r;
        br.x = x;
        br
    }

    pub fn transformer(
        name: impl Into<String>,
        from: BusId,
        to: BusId,
        r: f64,
        x: f64,
        hv_kv: f64,
        lv_kv: f64,
    ) -> Self {
        let mut br = Self::base(name, BranchKind::Transformer2W { hv_kv, lv_kv }, from, to);
        br.r = r;
        br.x = x;
        br
    }

    pub fn series_reactance(
        name: impl Into<String>,
        from: BusId,
        to: BusId,
        r: f64,
        x: f64,
    ) -> Self {
        let mut br = Self::base(name, BranchKind::SeriesReactance, from, to);
        br.r = r;
        br.x = x;
        br
    }

    pub fn switch(name: impl Into<String>, from: BusId, to: BusId) -> Self {
        let mut br = Self::base(name, BranchKind::Switch, from, to);
        br.x = 1e-5;
        br
    }

    pub fn with_charging(mut self, b: f64) -> Self {
        self.b = b;
        self
    }

    /// Thermal rating; the contingency rating defaults to the same value
    /// unless set explicitly.
    pub fn with_rating(mut self, rate_mva: f64) -> Self {
        self.rate = MegavoltAmperes(rate_mva);
        if self.contingency_rate.value() == 0.0 {
            self.contingency_rate = MegavoltAmperes(rate_mva);
        }
        self
    }

    pub fn with_contingency_rating(mut self, rate_mva: f64) -> Self {
        self.contingency_rate = MegavoltAmperes(rate_mva);
        self
    }

    pub fn with_taps(mut self, module: f64, phase_rad: f64) -> Self {
        self.tap_module = module;
        self.tap_phase = Radians(phase_rad);
        self
    }

    pub fn with_reliability(mut self, mttf_h: f64, mttr_h: f64) -> Self {
        self.mttf = Hours(mttf_h);
        self.mttr = Hours(mttr_h);
        self
    }
}

/// HVDC control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HvdcControlMode {
    /// Fixed power set point
    PSet,
    /// Angle-droop emulation (linear mode treats it as PSet)
    Free,
}

/// Point-to-point HVDC link; carries a controlled power transfer between
/// its AC terminals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvdcLine {
    pub id: HvdcId,
    pub uid: u64,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Scheduled power, from -> to
    pub p_set: Megawatts,
    /// Fraction of the transfer lost in conversion
    pub loss_factor: f64,
    pub rate: MegavoltAmperes,
    pub control_mode: HvdcControlMode,
    pub active: bool,
    pub mttf: Hours,
    pub mttr: Hours,
    pub pset_prof: Option<NumProfile>,
    pub active_prof: Option<BoolProfile>,
}

impl HvdcLine {
    pub fn new(name: impl Into<String>, from: BusId, to: BusId, p_set_mw: f64) -> Self {
        Self {
            id: HvdcId(0),
            uid: next_uid(),
            name: name.into(),
            from_bus: from,
            to_bus: to,
            p_set: Megawatts(p_set_mw),
            loss_factor: 0.0,
            rate: MegavoltAmperes(0.0),
            control_mode: HvdcControlMode::PSet,
            active: true,
            mttf: Hours(0.0),
            mttr: Hours(0.0),
            pset_prof: None,
            active_prof: None,
        }
    }
}

/// DC-side control of a voltage-source converter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VscDcControl {
    /// Control DC voltage (p.u.)
    Vdc(f64),
    /// Control transferred active power (MW)
    P(f64),
}

/// AC-side control of a voltage-source converter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VscAcControl {
    /// Control AC reactive power (Mvar)
    Q(f64),
    /// Control AC voltage magnitude (p.u.)
    Vac(f64),
}

/// AC/DC voltage-source converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vsc {
    pub id: VscId,
    pub uid: u64,
    pub name: String,
    /// AC terminal
    pub from_bus: BusId,
    /// DC terminal
    pub to_bus: BusId,
    pub control_dc: VscDcControl,
    pub control_ac: VscAcControl,
    pub rate: MegavoltAmperes,
    pub active: bool,
}

impl Vsc {
    pub fn new(name: impl Into<String>, ac_bus: BusId, dc_bus: BusId) -> Self {
        Self {
            id: VscId(0),
            uid: next_uid(),
            name: name.into(),
            from_bus: ac_bus,
            to_bus: dc_bus,
            control_dc: VscDcControl::P(0.0),
            control_ac: VscAcControl::Q(0.0),
            rate: MegavoltAmperes(0.0),
            active: true,
        }
    }
}

/// Dispatchable generator with voltage control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen {
    pub id: GenId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    /// Active power output
    pub p: Megawatts,
    /// Voltage set point when controlling voltage
    pub vset: PerUnit,
    /// Nominal apparent power
    pub snom: MegavoltAmperes,
    pub qmin: Megavars,
    pub qmax: Megavars,
    pub pmin: Megawatts,
    pub pmax: Megawatts,
    /// Marginal cost ($/MWh) for dispatch ordering
    pub cost: f64,
    pub dispatchable: bool,
    /// May be redispatched by the automatic protection response
    pub srap_enabled: bool,
    /// Controls voltage at its terminal (PV behaviour)
    pub is_controlled: bool,
    /// Controlled bus when different from the terminal
    pub remote_bus: Option<BusId>,
    pub active: bool,
    pub mttf: Hours,
    pub mttr: Hours,
    pub p_prof: Option<NumProfile>,
    pub active_prof: Option<BoolProfile>,
}

impl Gen {
    pub fn new(name: impl Into<String>, p_mw: f64) -> Self {
        Self {
            id: GenId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            p: Megawatts(p_mw),
            vset: PerUnit(1.0),
            snom: MegavoltAmperes(9999.0),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            pmin: Megawatts(0.0),
            pmax: Megawatts(f64::INFINITY),
            cost: 0.0,
            dispatchable: true,
            srap_enabled: false,
            is_controlled: true,
            remote_bus: None,
            active: true,
            mttf: Hours(0.0),
            mttr: Hours(0.0),
            p_prof: None,
            active_prof: None,
        }
    }

    pub fn with_q_limits(mut self, qmin: f64, qmax: f64) -> Self {
        self.qmin = Megavars(qmin);
        self.qmax = Megavars(qmax);
        self
    }

    pub fn with_p_limits(mut self, pmin: f64, pmax: f64) -> Self {
        self.pmin = Megawatts(pmin);
        self.pmax = Megawatts(pmax);
        self
    }

    pub fn with_vset(mut self, vset: f64) -> Self {
        self.vset = PerUnit(vset);
        self
    }

    pub fn with_snom(mut self, snom_mva: f64) -> Self {
        self.snom = MegavoltAmperes(snom_mva);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_srap(mut self, enabled: bool) -> Self {
        self.srap_enabled = enabled;
        self
    }

    pub fn with_reliability(mut self, mttf_h: f64, mttr_h: f64) -> Self {
        self.mttf = Hours(mttf_h);
        self.mttr = Hours(mttr_h);
        self
    }
}

/// Storage device: a generator plus an energy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battery {
    pub id: BatteryId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    pub p: Megawatts,
    pub vset: PerUnit,
    pub snom: MegavoltAmperes,
    pub qmin: Megavars,
    pub qmax: Megavars,
    /// Maximum charge/discharge power
    pub pmax: Megawatts,
    /// Nominal stored energy
    pub enom: MegawattHours,
    /// Initial state of charge, fraction of `enom`
    pub soc0: f64,
    /// Floor state of charge
    pub soc_min: f64,
    pub eff_charge: f64,
    pub eff_discharge: f64,
    pub cost: f64,
    pub active: bool,
    pub mttf: Hours,
    pub mttr: Hours,
    pub p_prof: Option<NumProfile>,
    pub active_prof: Option<BoolProfile>,
}

impl Battery {
    pub fn new(name: impl Into<String>, enom_mwh: f64) -> Self {
        Self {
            id: BatteryId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            p: Megawatts(0.0),
            vset: PerUnit(1.0),
            snom: MegavoltAmperes(9999.0),
            qmin: Megavars(f64::NEG_INFINITY),
            qmax: Megavars(f64::INFINITY),
            pmax: Megawatts(f64::INFINITY),
            enom: MegawattHours(enom_mwh),
            soc0: 1.0,
            soc_min: 0.1,
            eff_charge: 0.95,
            eff_discharge: 0.95,
            cost: 0.0,
            active: true,
            mttf: Hours(0.0),
            mttr: Hours(0.0),
            p_prof: None,
            active_prof: None,
        }
    }

    pub fn with_power_limit(mut self, pmax_mw: f64) -> Self {
        self.pmax = Megawatts(pmax_mw);
        self
    }

    pub fn with_soc(mut self, soc0: f64, soc_min: f64) -> Self {
        self.soc0 = soc0;
        self.soc_min = soc_min;
        self
    }

    pub fn with_efficiencies(mut self, eff_charge: f64, eff_discharge: f64) -> Self {
        self.eff_charge = eff_charge;
        self.eff_discharge = eff_discharge;
        self
    }

    /// Reactive power implied by a power factor. Positive power factor with
    /// negative Q is the leading convention.
    pub fn q_at_power_factor(&self, pf: f64) -> Megavars {
        let p = self.p.value();
        if pf.abs() < 1e-12 {
            return Megavars(0.0);
        }
        let q_mag = p.abs() * (1.0 / (pf * pf) - 1.0).max(0.0).sqrt();
        // leading: positive pf pairs with negative (capacitive) Q
        Megavars(if pf >= 0.0 { -q_mag } else { q_mag })
    }
}

/// Wye or delta connection of a three-phase load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadConnection {
    /// Grounded-star connection
    Wye,
    Delta,
}

/// ZIP load model used by the unbalanced solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadModel {
    ConstantPower,
    ConstantCurrent,
    ConstantImpedance,
}

/// Power demand at a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    pub p: Megawatts,
    pub q: Megavars,
    pub connection: LoadConnection,
    pub model: LoadModel,
    pub active: bool,
    pub mttf: Hours,
    pub mttr: Hours,
    pub p_prof: Option<NumProfile>,
    pub q_prof: Option<NumProfile>,
    pub active_prof: Option<BoolProfile>,
}

impl Load {
    pub fn new(name: impl Into<String>, p_mw: f64, q_mvar: f64) -> Self {
        Self {
            id: LoadId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            p: Megawatts(p_mw),
            q: Megavars(q_mvar),
            connection: LoadConnection::Wye,
            model: LoadModel::ConstantPower,
            active: true,
            mttf: Hours(0.0),
            mttr: Hours(0.0),
            p_prof: None,
            q_prof: None,
            active_prof: None,
        }
    }

    pub fn with_connection(mut self, connection: LoadConnection) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_model(mut self, model: LoadModel) -> Self {
        self.model = model;
        self
    }
}

/// Non-dispatchable fixed injection (wind, PV aggregate, boundary mirror).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticGen {
    pub id: StaticGenId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    pub p: Megawatts,
    pub q: Megavars,
    pub active: bool,
    pub p_prof: Option<NumProfile>,
    pub active_prof: Option<BoolProfile>,
}

impl StaticGen {
    pub fn new(name: impl Into<String>, p_mw: f64, q_mvar: f64) -> Self {
        Self {
            id: StaticGenId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            p: Megawatts(p_mw),
            q: Megavars(q_mvar),
            active: true,
            p_prof: None,
            active_prof: None,
        }
    }
}

/// Shunt admittance device. Values are the injected powers at 1 p.u.
/// voltage (MATPOWER convention); the compiler converts to p.u. admittance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shunt {
    pub id: ShuntId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    /// Conductive losses at V = 1 p.u. (MW)
    pub g: Megawatts,
    /// Susceptance injection at V = 1 p.u. (Mvar; positive = capacitor)
    pub b: Megavars,
    pub active: bool,
}

impl Shunt {
    pub fn new(name: impl Into<String>, g_mw: f64, b_mvar: f64) -> Self {
        Self {
            id: ShuntId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            g: Megawatts(g_mw),
            b: Megavars(b_mvar),
            active: true,
        }
    }
}

/// Boundary equivalent of a neighbouring system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExternalGridMode {
    /// Fixed injection
    PQ { p_mw: f64, q_mvar: f64 },
    /// Voltage source (participates in slack selection)
    VSource { vset_pu: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalGrid {
    pub id: ExternalGridId,
    pub uid: u64,
    pub name: String,
    pub bus: BusId,
    pub mode: ExternalGridMode,
    pub active: bool,
}

impl ExternalGrid {
    pub fn voltage_source(name: impl Into<String>, vset_pu: f64) -> Self {
        Self {
            id: ExternalGridId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            mode: ExternalGridMode::VSource { vset_pu },
            active: true,
        }
    }

    pub fn pq(name: impl Into<String>, p_mw: f64, q_mvar: f64) -> Self {
        Self {
            id: ExternalGridId(0),
            uid: next_uid(),
            name: name.into(),
            bus: BusId(0),
            mode: ExternalGridMode::PQ { p_mw, q_mvar },
            active: true,
        }
    }
}

/// One outage/redispatch event addressed by device uid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ContingencyAction {
    Deactivate,
    SetP(f64),
    SetActive(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContingencyEvent {
    pub device_uid: u64,
    pub action: ContingencyAction,
}

/// Named atomic set of outage events, treated as one multi-contingency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContingencyGroup {
    pub id: ContingencyGroupId,
    pub uid: u64,
    pub name: String,
    pub events: Vec<ContingencyEvent>,
}

impl ContingencyGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ContingencyGroupId(0),
            uid: next_uid(),
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// N-1 group for a single branch.
    pub fn branch_outage(name: impl Into<String>, branch_uid: u64) -> Self {
        let mut g = Self::new(name);
        g.events.push(ContingencyEvent {
            device_uid: branch_uid,
            action: ContingencyAction::Deactivate,
        });
        g
    }

    pub fn add_event(&mut self, device_uid: u64, action: ContingencyAction) {
        self.events.push(ContingencyEvent { device_uid, action });
    }
}

/// The root aggregate owning every device and the time axis.
///
/// Invariants:
/// - every branch endpoint is a member bus;
/// - deleting a bus deletes its injections and every branch touching it;
/// - when a time axis exists, every profile length matches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiCircuit {
    pub name: String,
    /// System base power (MVA)
    pub sbase: f64,
    pub time_axis: Option<TimeAxis>,
    pub buses: Vec<Bus>,
    pub branches: Vec<Branch>,
    pub hvdc_lines: Vec<HvdcLine>,
    pub vscs: Vec<Vsc>,
    pub generators: Vec<Gen>,
    pub batteries: Vec<Battery>,
    pub loads: Vec<Load>,
    pub static_gens: Vec<StaticGen>,
    pub shunts: Vec<Shunt>,
    pub external_grids: Vec<ExternalGrid>,
    pub contingency_groups: Vec<ContingencyGroup>,
}

impl MultiCircuit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sbase: 100.0,
            ..Default::default()
        }
    }

    pub fn with_time_axis(mut self, axis: TimeAxis) -> Self {
        self.time_axis = Some(axis);
        self
    }

    /// Number of time steps, 0 when the grid is snapshot-only.
    pub fn time_len(&self) -> usize {
        self.time_axis.as_ref().map(|a| a.len()).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // add/delete
    // ------------------------------------------------------------------

    pub fn add_bus(&mut self, mut bus: Bus) -> BusId {
        let id = BusId(self.buses.len());
        bus.id = id;
        self.buses.push(bus);
        id
    }

    pub fn add_branch(&mut self, mut branch: Branch) -> BranchId {
        let id = BranchId(self.branches.len());
        branch.id = id;
        self.branches.push(branch);
        id
    }

    pub fn add_hvdc(&mut self, mut hvdc: HvdcLine) -> HvdcId {
        let id = HvdcId(self.hvdc_lines.len());
        hvdc.id = id;
        self.hvdc_lines.push(hvdc);
        id
    }

    pub fn add_vsc(&mut self, mut vsc: Vsc) -> VscId {
        let id = VscId(self.vscs.len());
        vsc.id = id;
        self.vscs.push(vsc);
        id
    }

    pub fn add_generator(&mut self, bus: BusId, mut gen: Gen) -> GenId {
        let id = GenId(self.generators.len());
        gen.id = id;
        gen.bus = bus;
        self.generators.push(gen);
        id
    }

    pub fn add_battery(&mut self, bus: BusId, mut battery: Battery) -> BatteryId {
        let id = BatteryId(self.batteries.len());
        battery.id = id;
        battery.bus = bus;
        self.batteries.push(battery);
        id
    }

    pub fn add_load(&mut self, bus: BusId, mut load: Load) -> LoadId {
        let id = LoadId(self.loads.len());
        load.id = id;
        load.bus = bus;
        self.loads.push(load);
        id
    }

    pub fn add_static_gen(&mut self, bus: BusId, mut sg: StaticGen) -> StaticGenId {
        let id = StaticGenId(self.static_gens.len());
        sg.id = id;
        sg.bus = bus;
        self.static_gens.push(sg);
        id
    }

    pub fn add_shunt(&mut self, bus: BusId, mut shunt: Shunt) -> ShuntId {
        let id = ShuntId(self.shunts.len());
        shunt.id = id;
        shunt.bus = bus;
        self.shunts.push(shunt);
        id
    }

    pub fn add_external_grid(&mut self, bus: BusId, mut eg: ExternalGrid) -> ExternalGridId {
        let id = ExternalGridId(self.external_grids.len());
        eg.id = id;
        eg.bus = bus;
        self.external_grids.push(eg);
        id
    }

    pub fn add_contingency_group(&mut self, mut group: ContingencyGroup) -> ContingencyGroupId {
        let id = ContingencyGroupId(self.contingency_groups.len());
        group.id = id;
        self.contingency_groups.push(group);
        id
    }

    /// Delete a bus together with every attached injection and every branch
    /// touching it. Remaining device ids are re-indexed to stay dense.
    pub fn delete_bus(&mut self, bus: BusId) {
        let Some(pos) = self.buses.iter().position(|b| b.id == bus) else {
            return;
        };
        self.buses.remove(pos);

        self.branches
            .retain(|br| br.from_bus != bus && br.to_bus != bus);
        self.hvdc_lines
            .retain(|h| h.from_bus != bus && h.to_bus != bus);
        self.vscs.retain(|v| v.from_bus != bus && v.to_bus != bus);
        self.generators.retain(|g| g.bus != bus);
        self.batteries.retain(|b| b.bus != bus);
        self.loads.retain(|l| l.bus != bus);
        self.static_gens.retain(|s| s.bus != bus);
        self.shunts.retain(|s| s.bus != bus);
        self.external_grids.retain(|e| e.bus != bus);

        self.reindex();
    }

    /// Delete a branch; endpoints are untouched.
    pub fn delete_branch(&mut self, branch: BranchId) {
        self.branches.retain(|br| br.id != branch);
        self.reindex();
    }

    /// Delete a contingency group, returning its uid so that result stores
    /// can drop anything referencing it.
    pub fn delete_contingency_group(&mut self, group: ContingencyGroupId) -> Option<u64> {
        let pos = self.contingency_groups.iter().position(|g| g.id == group)?;
        let uid = self.contingency_groups.remove(pos).uid;
        self.reindex();
        Some(uid)
    }

    /// Re-assign dense positional ids after a deletion. Uids never change.
    fn reindex(&mut self) {
        for (i, b) in self.buses.iter_mut().enumerate() {
            b.id = BusId(i);
        }
        for (i, br) in self.branches.iter_mut().enumerate() {
            br.id = BranchId(i);
        }
        for (i, h) in self.hvdc_lines.iter_mut().enumerate() {
            h.id = HvdcId(i);
        }
        for (i, v) in self.vscs.iter_mut().enumerate() {
            v.id = VscId(i);
        }
        for (i, g) in self.generators.iter_mut().enumerate() {
            g.id = GenId(i);
        }
        for (i, b) in self.batteries.iter_mut().enumerate() {
            b.id = BatteryId(i);
        }
        for (i, l) in self.loads.iter_mut().enumerate() {
            l.id = LoadId(i);
        }
        for (i, s) in self.static_gens.iter_mut().enumerate() {
            s.id = StaticGenId(i);
        }
        for (i, s) in self.shunts.iter_mut().enumerate() {
            s.id = ShuntId(i);
        }
        for (i, e) in self.external_grids.iter_mut().enumerate() {
            e.id = ExternalGridId(i);
        }
        for (i, c) in self.contingency_groups.iter_mut().enumerate() {
            c.id = ContingencyGroupId(i);
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn bus_index(&self, id: BusId) -> Option<usize> {
        // ids are positional after reindex()
        if id.value() < self.buses.len() && self.buses[id.value()].id == id {
            Some(id.value())
        } else {
            self.buses.iter().position(|b| b.id == id)
        }
    }

    /// Branches incident to a bus.
    pub fn branches_at_bus(&self, bus: BusId) -> Vec<&Branch> {
        self.branches
            .iter()
            .filter(|br| br.from_bus == bus || br.to_bus == bus)
            .collect()
    }

    /// Uids of every injection attached to a bus.
    pub fn injection_uids_at_bus(&self, bus: BusId) -> Vec<u64> {
        let mut uids = Vec::new();
        uids.extend(self.generators.iter().filter(|g| g.bus == bus).map(|g| g.uid));
        uids.extend(self.batteries.iter().filter(|b| b.bus == bus).map(|b| b.uid));
        uids.extend(self.loads.iter().filter(|l| l.bus == bus).map(|l| l.uid));
        uids.extend(
            self.static_gens
                .iter()
                .filter(|s| s.bus == bus)
                .map(|s| s.uid),
        );
        uids.extend(self.shunts.iter().filter(|s| s.bus == bus).map(|s| s.uid));
        uids.extend(
            self.external_grids
                .iter()
                .filter(|e| e.bus == bus)
                .map(|e| e.uid),
        );
        uids
    }

    /// Map from device uid to a `(kind, index)` pair across all families.
    pub fn uid_map(&self) -> HashMap<u64, (DeviceKind, usize)> {
        let mut map = HashMap::new();
        for (i, d) in self.buses.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Bus, i));
        }
        for (i, d) in self.branches.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Branch, i));
        }
        for (i, d) in self.hvdc_lines.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::HvdcLine, i));
        }
        for (i, d) in self.vscs.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Vsc, i));
        }
        for (i, d) in self.generators.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Generator, i));
        }
        for (i, d) in self.batteries.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Battery, i));
        }
        for (i, d) in self.loads.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Load, i));
        }
        for (i, d) in self.static_gens.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::StaticGen, i));
        }
        for (i, d) in self.shunts.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::Shunt, i));
        }
        for (i, d) in self.external_grids.iter().enumerate() {
            map.insert(d.uid, (DeviceKind::ExternalGrid, i));
        }
        map
    }

    pub fn total_load_mw(&self) -> f64 {
        self.loads
            .iter()
            .filter(|l| l.active)
            .map(|l| l.p.value())
            .sum()
    }

    pub fn total_generation_mw(&self) -> f64 {
        self.generators
            .iter()
            .filter(|g| g.active)
            .map(|g| g.p.value())
            .sum()
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.buses.iter().map(|b| b.name.clone()).collect()
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.iter().map(|b| b.name.clone()).collect()
    }

    pub fn contingency_group_names(&self) -> Vec<String> {
        self.contingency_groups
            .iter()
            .map(|g| g.name.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // validation
    // ------------------------------------------------------------------

    /// Check the structural invariants, appending findings to `log`.
    pub fn validate_into(&self, log: &mut Logger) {
        if self.buses.is_empty() {
            log.add_error("Grid has no buses");
            return;
        }

        let nbus = self.buses.len();
        let bus_ok = |id: BusId| id.value() < nbus;

        // duplicate uids
        let mut seen = HashMap::new();
        for (uid, name) in self
            .buses
            .iter()
            .map(|b| (b.uid, b.name.as_str()))
            .chain(self.branches.iter().map(|b| (b.uid, b.name.as_str())))
            .chain(self.generators.iter().map(|g| (g.uid, g.name.as_str())))
            .chain(self.loads.iter().map(|l| (l.uid, l.name.as_str())))
        {
            if let Some(prev) = seen.insert(uid, name) {
                log.add_error(format!("Duplicate uid {uid} ('{prev}' and '{name}')"));
            }
        }

        for br in &self.branches {
            if !bus_ok(br.from_bus) || !bus_ok(br.to_bus) {
                log.add_device_entry(
                    Severity::Error,
                    br.uid,
                    format!("Branch '{}' has a dangling endpoint", br.name),
                );
            }
            if let BranchKind::Transformer2W { hv_kv, lv_kv } = br.kind {
                if hv_kv < lv_kv {
                    log.add_device_entry(
                        Severity::Error,
                        br.uid,
                        format!("Transformer '{}': HV {hv_kv} kV < LV {lv_kv} kV", br.name),
                    );
                } else if bus_ok(br.from_bus) && bus_ok(br.to_bus) {
                    let vf = self.buses[br.from_bus.value()].vnom.value();
                    let vt = self.buses[br.to_bus.value()].vnom.value();
                    let hi = vf.max(vt);
                    let lo = vf.min(vt);
                    // winding voltages must match endpoint nominals within 10 %
                    if hi > 0.0 && lo > 0.0 {
                        if (hv_kv - hi).abs() / hi > 0.1 || (lv_kv - lo).abs() / lo > 0.1 {
                            log.add_device_entry(
                                Severity::Warning,
                                br.uid,
                                format!(
                                    "Transformer '{}' windings ({hv_kv}/{lv_kv} kV) do not \
                                     match endpoint nominals ({hi}/{lo} kV)",
                                    br.name
                                ),
                            );
                        }
                    }
                }
            }
        }

        for g in &self.generators {
            if !bus_ok(g.bus) {
                log.add_device_entry(
                    Severity::Error,
                    g.uid,
                    format!("Generator '{}' references a missing bus", g.name),
                );
            }
        }
        for l in &self.loads {
            if !bus_ok(l.bus) {
                log.add_device_entry(
                    Severity::Error,
                    l.uid,
                    format!("Load '{}' references a missing bus", l.name),
                );
            }
        }

        // profile lengths against the time axis
        if let Some(axis) = &self.time_axis {
            let nt = axis.len();
            let mut check = |len: usize, uid: u64, what: &str| {
                if len != nt {
                    log.add_device_entry(
                        Severity::Error,
                        uid,
                        format!("{what} profile length {len} != time axis length {nt}"),
                    );
                }
            };
            for l in &self.loads {
                if let Some(p) = &l.p_prof {
                    check(p.len(), l.uid, "load P");
                }
                if let Some(q) = &l.q_prof {
                    check(q.len(), l.uid, "load Q");
                }
            }
            for g in &self.generators {
                if let Some(p) = &g.p_prof {
                    check(p.len(), g.uid, "generator P");
                }
            }
            for br in &self.branches {
                if let Some(a) = &br.active_prof {
                    check(a.len(), br.uid, "branch active");
                }
            }
        }

        if self.generators.is_empty() && self.external_grids.is_empty() {
            log.add_warning("Grid has no generators or external sources");
        }
    }

    /// Validate and convert any error finding into a fatal `MalformedGrid`.
    pub fn validate(&self) -> VgResult<()> {
        let mut log = Logger::new();
        self.validate_into(&mut log);
        if log.has_errors() {
            let msg = log
                .errors()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(VgError::MalformedGrid(msg));
        }
        Ok(())
    }
}
