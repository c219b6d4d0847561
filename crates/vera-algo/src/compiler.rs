//! Numerical circuit compilation.
//!
//! Projects a [`MultiCircuit`] at one time index into flat, index-addressed
//! arrays: per-family device data, branch connectivity, bus classification
//! and the island partition. The result is immutable per snapshot; solvers
//! that need to mutate state (contingencies) work on their own copy.
//!
//! ## Island decomposition
//!
//! Active branches induce an adjacency over active buses; a union-find pass
//! labels the connected components and `split_into_islands` re-indexes each
//! island into its own [`NumericalCircuit`]. Per island, exactly one slack
//! is guaranteed: a declared slack bus wins, otherwise the bus holding the
//! largest connected generator is promoted, otherwise the island is passive
//! and reported.

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use vera_core::{
    ContingencyAction, ExternalGridMode, Logger, MultiCircuit, Profile, Severity, VgError,
    VgResult,
};

/// Power-flow bus classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusType {
    PQ,
    PV,
    Slack,
}

/// Flat bus arrays.
#[derive(Debug, Clone, Default)]
pub struct BusData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub vnom: Vec<f64>,
    pub vmin: Vec<f64>,
    pub vmax: Vec<f64>,
    pub active: Vec<bool>,
    pub is_slack: Vec<bool>,
    pub bus_types: Vec<BusType>,
    /// Position in the originating grid's bus list
    pub original_idx: Vec<usize>,
}

impl BusData {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Flat passive-branch arrays. `F[k]`/`T[k]` index into the bus arrays.
#[derive(Debug, Clone, Default)]
pub struct PassiveBranchData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub f: Vec<usize>,
    pub t: Vec<usize>,
    pub r: Vec<f64>,
    pub x: Vec<f64>,
    pub b: Vec<f64>,
    pub rates: Vec<f64>,
    pub contingency_rates: Vec<f64>,
    pub tap_module: Vec<f64>,
    pub tap_phase: Vec<f64>,
    pub tap_module_control: Vec<bool>,
    pub tap_vset: Vec<f64>,
    pub tap_phase_control: Vec<bool>,
    pub tap_pset: Vec<f64>,
    pub active: Vec<bool>,
    pub monitor_loading: Vec<bool>,
    pub mttf: Vec<f64>,
    pub mttr: Vec<f64>,
    pub original_idx: Vec<usize>,
}

impl PassiveBranchData {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Indices of branches included in loading reports.
    pub fn monitored_indices(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&k| self.monitor_loading[k] && self.active[k])
            .collect()
    }
}

/// Flat HVDC arrays (controlled P transfers between AC terminals).
#[derive(Debug, Clone, Default)]
pub struct HvdcData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub f: Vec<usize>,
    pub t: Vec<usize>,
    pub pset: Vec<f64>,
    pub loss_factor: Vec<f64>,
    pub rates: Vec<f64>,
    pub active: Vec<bool>,
}

impl HvdcData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat VSC arrays.
#[derive(Debug, Clone, Default)]
pub struct VscData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub f: Vec<usize>,
    pub t: Vec<usize>,
    /// Controlled DC-side power (MW) when in P-control, else NaN
    pub p_dc_set: Vec<f64>,
    /// Controlled DC voltage (p.u.) when in Vdc-control, else NaN
    pub vdc_set: Vec<f64>,
    /// Controlled AC reactive power (Mvar) when in Q-control, else NaN
    pub q_ac_set: Vec<f64>,
    /// Controlled AC voltage (p.u.) when in Vac-control, else NaN
    pub vac_set: Vec<f64>,
    pub rates: Vec<f64>,
    pub active: Vec<bool>,
}

impl VscData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat generator arrays (external grids in voltage-source mode are folded
/// in with `is_external = true`).
#[derive(Debug, Clone, Default)]
pub struct GeneratorData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub bus: Vec<usize>,
    pub p: Vec<f64>,
    pub vset: Vec<f64>,
    pub snom: Vec<f64>,
    pub qmin: Vec<f64>,
    pub qmax: Vec<f64>,
    pub pmin: Vec<f64>,
    pub pmax: Vec<f64>,
    pub cost: Vec<f64>,
    pub dispatchable: Vec<bool>,
    pub srap_enabled: Vec<bool>,
    pub controllable: Vec<bool>,
    /// Controlled bus when voltage control targets a bus other than the
    /// terminal (grid-level bus index)
    pub remote_bus: Vec<Option<usize>>,
    pub is_external: Vec<bool>,
    pub active: Vec<bool>,
    pub mttf: Vec<f64>,
    pub mttr: Vec<f64>,
}

impl GeneratorData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat battery arrays.
#[derive(Debug, Clone, Default)]
pub struct BatteryData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub bus: Vec<usize>,
    pub p: Vec<f64>,
    pub vset: Vec<f64>,
    pub snom: Vec<f64>,
    pub qmin: Vec<f64>,
    pub qmax: Vec<f64>,
    pub pmax: Vec<f64>,
    pub enom: Vec<f64>,
    pub soc0: Vec<f64>,
    pub soc_min: Vec<f64>,
    pub eff_charge: Vec<f64>,
    pub eff_discharge: Vec<f64>,
    pub cost: Vec<f64>,
    pub active: Vec<bool>,
    pub mttf: Vec<f64>,
    pub mttr: Vec<f64>,
}

impl BatteryData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat load arrays.
#[derive(Debug, Clone, Default)]
pub struct LoadData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub bus: Vec<usize>,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    /// Delta-connected (three-phase solver); wye/grounded star otherwise
    pub is_delta: Vec<bool>,
    /// ZIP characteristic (three-phase solver)
    pub model: Vec<vera_core::LoadModel>,
    pub active: Vec<bool>,
    pub mttf: Vec<f64>,
    pub mttr: Vec<f64>,
}

impl LoadData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat static-generator arrays.
#[derive(Debug, Clone, Default)]
pub struct StaticGenData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub bus: Vec<usize>,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    pub active: Vec<bool>,
}

impl StaticGenData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Flat shunt arrays. `g`/`b` are MW / Mvar injected at 1 p.u. voltage.
#[derive(Debug, Clone, Default)]
pub struct ShuntData {
    pub names: Vec<String>,
    pub uid: Vec<u64>,
    pub bus: Vec<usize>,
    pub g: Vec<f64>,
    pub b: Vec<f64>,
    pub active: Vec<bool>,
}

impl ShuntData {
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Which array family a device uid resolves to inside a compiled circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRef {
    Bus(usize),
    Branch(usize),
    Hvdc(usize),
    Vsc(usize),
    Generator(usize),
    Battery(usize),
    Load(usize),
    StaticGen(usize),
    Shunt(usize),
}

/// Dense, index-addressable projection of a grid at one time index.
#[derive(Debug, Clone, Default)]
pub struct NumericalCircuit {
    pub sbase: f64,
    pub bus_data: BusData,
    pub passive_branch_data: PassiveBranchData,
    pub hvdc_data: HvdcData,
    pub vsc_data: VscData,
    pub generator_data: GeneratorData,
    pub battery_data: BatteryData,
    pub load_data: LoadData,
    pub static_gen_data: StaticGenData,
    pub shunt_data: ShuntData,
}

impl NumericalCircuit {
    pub fn nbus(&self) -> usize {
        self.bus_data.len()
    }

    pub fn nbr(&self) -> usize {
        self.passive_branch_data.len()
    }

    /// Branch-to-bus connectivity `Cf`, `Ct` (nbr × nbus, entries ±1, CSR).
    pub fn connectivity(&self) -> (CsMat<f64>, CsMat<f64>) {
        let nbr = self.nbr();
        let nbus = self.nbus();
        let mut cf = TriMat::new((nbr, nbus));
        let mut ct = TriMat::new((nbr, nbus));
        for k in 0..nbr {
            cf.add_triplet(k, self.passive_branch_data.f[k], 1.0);
            ct.add_triplet(k, self.passive_branch_data.t[k], 1.0);
        }
        (cf.to_csr(), ct.to_csr())
    }

    /// Complex power injections per bus in MVA (generation positive), with
    /// HVDC transfers superposed at their terminals.
    pub fn power_injections(&self) -> Vec<num_complex::Complex64> {
        use num_complex::Complex64;
        let mut s = vec![Complex64::new(0.0, 0.0); self.nbus()];

        let g = &self.generator_data;
        for i in 0..g.len() {
            if g.active[i] && self.bus_data.active[g.bus[i]] {
                s[g.bus[i]] += Complex64::new(g.p[i], 0.0);
            }
        }
        let b = &self.battery_data;
        for i in 0..b.len() {
            if b.active[i] && self.bus_data.active[b.bus[i]] {
                s[b.bus[i]] += Complex64::new(b.p[i], 0.0);
            }
        }
        let sg = &self.static_gen_data;
        for i in 0..sg.len() {
            if sg.active[i] && self.bus_data.active[sg.bus[i]] {
                s[sg.bus[i]] += Complex64::new(sg.p[i], sg.q[i]);
            }
        }
        let l = &self.load_data;
        for i in 0..l.len() {
            if l.active[i] && self.bus_data.active[l.bus[i]] {
                s[l.bus[i]] -= Complex64::new(l.p[i], l.q[i]);
            }
        }
        let h = &self.hvdc_data;
        for i in 0..h.len() {
            if h.active[i] {
                let p = h.pset[i];
                let losses = p.abs() * h.loss_factor[i];
                s[h.f[i]] -= Complex64::new(p, 0.0);
                s[h.t[i]] += Complex64::new(p - losses.copysign(p), 0.0);
            }
        }
        let v = &self.vsc_data;
        for i in 0..v.len() {
            if v.active[i] {
                if v.p_dc_set[i].is_finite() {
                    let p = v.p_dc_set[i];
                    s[v.f[i]] -= Complex64::new(p, 0.0);
                    s[v.t[i]] += Complex64::new(p, 0.0);
                }
                if v.q_ac_set[i].is_finite() {
                    s[v.f[i]] += Complex64::new(0.0, v.q_ac_set[i]);
                }
            }
        }
        s
    }

    /// Real power injections (MW).
    pub fn real_power_injections(&self) -> Vec<f64> {
        self.power_injections().iter().map(|s| s.re).collect()
    }

    /// Map device uid -> array reference for contingency application.
    pub fn device_refs(&self) -> HashMap<u64, DeviceRef> {
        let mut map = HashMap::new();
        for (i, &u) in self.bus_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Bus(i));
        }
        for (i, &u) in self.passive_branch_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Branch(i));
        }
        for (i, &u) in self.hvdc_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Hvdc(i));
        }
        for (i, &u) in self.vsc_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Vsc(i));
        }
        for (i, &u) in self.generator_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Generator(i));
        }
        for (i, &u) in self.battery_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Battery(i));
        }
        for (i, &u) in self.load_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Load(i));
        }
        for (i, &u) in self.static_gen_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::StaticGen(i));
        }
        for (i, &u) in self.shunt_data.uid.iter().enumerate() {
            map.insert(u, DeviceRef::Shunt(i));
        }
        map
    }

    /// Apply one contingency action to this (mutable copy of a) circuit.
    pub fn apply_action(&mut self, dref: DeviceRef, action: ContingencyAction) {
        match (dref, action) {
            (DeviceRef::Branch(k), ContingencyAction::Deactivate) => {
                self.passive_branch_data.active[k] = false
            }
            (DeviceRef::Branch(k), ContingencyAction::SetActive(v)) => {
                self.passive_branch_data.active[k] = v
            }
            (DeviceRef::Hvdc(k), ContingencyAction::Deactivate) => {
                self.hvdc_data.active[k] = false
            }
            (DeviceRef::Hvdc(k), ContingencyAction::SetActive(v)) => self.hvdc_data.active[k] = v,
            (DeviceRef::Hvdc(k), ContingencyAction::SetP(p)) => self.hvdc_data.pset[k] = p,
            (DeviceRef::Vsc(k), ContingencyAction::Deactivate) => self.vsc_data.active[k] = false,
            (DeviceRef::Vsc(k), ContingencyAction::SetActive(v)) => self.vsc_data.active[k] = v,
            (DeviceRef::Generator(k), ContingencyAction::Deactivate) => {
                self.generator_data.active[k] = false
            }
            (DeviceRef::Generator(k), ContingencyAction::SetActive(v)) => {
                self.generator_data.active[k] = v
            }
            (DeviceRef::Generator(k), ContingencyAction::SetP(p)) => self.generator_data.p[k] = p,
            (DeviceRef::Battery(k), ContingencyAction::Deactivate) => {
                self.battery_data.active[k] = false
            }
            (DeviceRef::Battery(k), ContingencyAction::SetActive(v)) => {
                self.battery_data.active[k] = v
            }
            (DeviceRef::Battery(k), ContingencyAction::SetP(p)) => self.battery_data.p[k] = p,
            (DeviceRef::Load(k), ContingencyAction::Deactivate) => {
                self.load_data.active[k] = false
            }
            (DeviceRef::Load(k), ContingencyAction::SetActive(v)) => self.load_data.active[k] = v,
            (DeviceRef::Load(k), ContingencyAction::SetP(p)) => self.load_data.p[k] = p,
            (DeviceRef::StaticGen(k), ContingencyAction::Deactivate) => {
                self.static_gen_data.active[k] = false
            }
            (DeviceRef::StaticGen(k), ContingencyAction::SetActive(v)) => {
                self.static_gen_data.active[k] = v
            }
            (DeviceRef::StaticGen(k), ContingencyAction::SetP(p)) => self.static_gen_data.p[k] = p,
            (DeviceRef::Shunt(k), ContingencyAction::Deactivate) => {
                self.shunt_data.active[k] = false
            }
            (DeviceRef::Shunt(k), ContingencyAction::SetActive(v)) => {
                self.shunt_data.active[k] = v
            }
            (DeviceRef::Bus(k), ContingencyAction::Deactivate) => self.bus_data.active[k] = false,
            (DeviceRef::Bus(k), ContingencyAction::SetActive(v)) => self.bus_data.active[k] = v,
            // remaining combinations have no meaning; ignore
            _ => {}
        }
    }

    /// Island id per bus (only active branches and buses participate;
    /// inactive buses get `usize::MAX`).
    pub fn island_labels(&self) -> Vec<usize> {
        let nbus = self.nbus();
        let mut uf: UnionFind<usize> = UnionFind::new(nbus);
        for k in 0..self.nbr() {
            if !self.passive_branch_data.active[k] {
                continue;
            }
            let f = self.passive_branch_data.f[k];
            let t = self.passive_branch_data.t[k];
            if self.bus_data.active[f] && self.bus_data.active[t] {
                uf.union(f, t);
            }
        }
        // relabel representatives as consecutive island ids
        let mut label_of_root: HashMap<usize, usize> = HashMap::new();
        let mut labels = vec![usize::MAX; nbus];
        for i in 0..nbus {
            if !self.bus_data.active[i] {
                continue;
            }
            let root = uf.find(i);
            let next = label_of_root.len();
            let id = *label_of_root.entry(root).or_insert(next);
            labels[i] = id;
        }
        labels
    }

    /// Split this circuit into per-island circuits with local indexing.
    ///
    /// Slack promotion happens per island; islands without any source are
    /// logged and, unless `ignore_single_node`, single-bus islands are
    /// dropped silently.
    pub fn split_into_islands(
        &self,
        ignore_single_node: bool,
        logger: &mut Logger,
    ) -> Vec<NumericalCircuit> {
        let labels = self.island_labels();
        let n_islands = labels
            .iter()
            .filter(|&&l| l != usize::MAX)
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);

        let mut islands = Vec::new();
        for island_id in 0..n_islands {
            let bus_sel: Vec<usize> = (0..self.nbus())
                .filter(|&i| labels[i] == island_id)
                .collect();
            if ignore_single_node && bus_sel.len() <= 1 {
                continue;
            }
            let mut sub = self.take_subset(&bus_sel);
            sub.classify_buses(island_id, logger);
            islands.push(sub);
        }
        islands
    }

    /// Extract the sub-circuit induced by `bus_sel` (original bus indices of
    /// this circuit, sorted).
    fn take_subset(&self, bus_sel: &[usize]) -> NumericalCircuit {
        let mut local_of: HashMap<usize, usize> = HashMap::new();
        for (li, &gi) in bus_sel.iter().enumerate() {
            local_of.insert(gi, li);
        }

        let mut bd = BusData::default();
        for &gi in bus_sel {
            bd.names.push(self.bus_data.names[gi].clone());
            bd.uid.push(self.bus_data.uid[gi]);
            bd.vnom.push(self.bus_data.vnom[gi]);
            bd.vmin.push(self.bus_data.vmin[gi]);
            bd.vmax.push(self.bus_data.vmax[gi]);
            bd.active.push(self.bus_data.active[gi]);
            bd.is_slack.push(self.bus_data.is_slack[gi]);
            bd.bus_types.push(self.bus_data.bus_types[gi]);
            bd.original_idx.push(self.bus_data.original_idx[gi]);
        }

        let mut br = PassiveBranchData::default();
        let src = &self.passive_branch_data;
        for k in 0..src.len() {
            let (Some(&lf), Some(&lt)) = (local_of.get(&src.f[k]), local_of.get(&src.t[k]))
            else {
                continue;
            };
            br.names.push(src.names[k].clone());
            br.uid.push(src.uid[k]);
            br.f.push(lf);
            br.t.push(lt);
            br.r.push(src.r[k]);
            br.x.push(src.x[k]);
            br.b.push(src.b[k]);
            br.rates.push(src.rates[k]);
            br.contingency_rates.push(src.contingency_rates[k]);
            br.tap_module.push(src.tap_module[k]);
            br.tap_phase.push(src.tap_phase[k]);
            br.tap_module_control.push(src.tap_module_control[k]);
            br.tap_vset.push(src.tap_vset[k]);
            br.tap_phase_control.push(src.tap_phase_control[k]);
            br.tap_pset.push(src.tap_pset[k]);
            br.active.push(src.active[k]);
            br.monitor_loading.push(src.monitor_loading[k]);
            br.mttf.push(src.mttf[k]);
            br.mttr.push(src.mttr[k]);
            br.original_idx.push(src.original_idx[k]);
        }

        let mut hv = HvdcData::default();
        let src = &self.hvdc_data;
        for k in 0..src.len() {
            let (Some(&lf), Some(&lt)) = (local_of.get(&src.f[k]), local_of.get(&src.t[k]))
            else {
                continue;
            };
            hv.names.push(src.names[k].clone());
            hv.uid.push(src.uid[k]);
            hv.f.push(lf);
            hv.t.push(lt);
            hv.pset.push(src.pset[k]);
            hv.loss_factor.push(src.loss_factor[k]);
            hv.rates.push(src.rates[k]);
            hv.active.push(src.active[k]);
        }

        let mut vs = VscData::default();
        let src = &self.vsc_data;
        for k in 0..src.len() {
            let (Some(&lf), Some(&lt)) = (local_of.get(&src.f[k]), local_of.get(&src.t[k]))
            else {
                continue;
            };
            vs.names.push(src.names[k].clone());
            vs.uid.push(src.uid[k]);
            vs.f.push(lf);
            vs.t.push(lt);
            vs.p_dc_set.push(src.p_dc_set[k]);
            vs.vdc_set.push(src.vdc_set[k]);
            vs.q_ac_set.push(src.q_ac_set[k]);
            vs.vac_set.push(src.vac_set[k]);
            vs.rates.push(src.rates[k]);
            vs.active.push(src.active[k]);
        }

        let mut gd = GeneratorData::default();
        let src = &self.generator_data;
        for i in 0..src.len() {
            let Some(&lb) = local_of.get(&src.bus[i]) else {
                continue;
            };
            gd.names.push(src.names[i].clone());
            gd.uid.push(src.uid[i]);
            gd.bus.push(lb);
            gd.p.push(src.p[i]);
            gd.vset.push(src.vset[i]);
            gd.snom.push(src.snom[i]);
            gd.qmin.push(src.qmin[i]);
            gd.qmax.push(src.qmax[i]);
            gd.pmin.push(src.pmin[i]);
            gd.pmax.push(src.pmax[i]);
            gd.cost.push(src.cost[i]);
            gd.dispatchable.push(src.dispatchable[i]);
            gd.srap_enabled.push(src.srap_enabled[i]);
            gd.controllable.push(src.controllable[i]);
            gd.remote_bus
                .push(src.remote_bus[i].and_then(|rb| local_of.get(&rb).copied()));
            gd.is_external.push(src.is_external[i]);
            gd.active.push(src.active[i]);
            gd.mttf.push(src.mttf[i]);
            gd.mttr.push(src.mttr[i]);
        }

        let mut bt = BatteryData::default();
        let src = &self.battery_data;
        for i in 0..src.len() {
            let Some(&lb) = local_of.get(&src.bus[i]) else {
                continue;
            };
            bt.names.push(src.names[i].clone());
            bt.uid.push(src.uid[i]);
            bt.bus.push(lb);
            bt.p.push(src.p[i]);
            bt.vset.push(src.vset[i]);
            bt.snom.push(src.snom[i]);
            bt.qmin.push(src.qmin[i]);
            bt.qmax.push(src.qmax[i]);
            bt.pmax.push(src.pmax[i]);
            bt.enom.push(src.enom[i]);
            bt.soc0.push(src.soc0[i]);
            bt.soc_min.push(src.soc_min[i]);
            bt.eff_charge.push(src.eff_charge[i]);
            bt.eff_discharge.push(src.eff_discharge[i]);
            bt.cost.push(src.cost[i]);
            bt.active.push(src.active[i]);
            bt.mttf.push(src.mttf[i]);
            bt.mttr.push(src.mttr[i]);
        }

        let mut ld = LoadData::default();
        let src = &self.load_data;
        for i in 0..src.len() {
            let Some(&lb) = local_of.get(&src.bus[i]) else {
                continue;
            };
            ld.names.push(src.names[i].clone());
            ld.uid.push(src.uid[i]);
            ld.bus.push(lb);
            ld.p.push(src.p[i]);
            ld.q.push(src.q[i]);
            ld.is_delta.push(src.is_delta[i]);
            ld.model.push(src.model[i]);
            ld.active.push(src.active[i]);
            ld.mttf.push(src.mttf[i]);
            ld.mttr.push(src.mttr[i]);
        }

        let mut sgd = StaticGenData::default();
        let src = &self.static_gen_data;
        for i in 0..src.len() {
            let Some(&lb) = local_of.get(&src.bus[i]) else {
                continue;
            };
            sgd.names.push(src.names[i].clone());
            sgd.uid.push(src.uid[i]);
            sgd.bus.push(lb);
            sgd.p.push(src.p[i]);
            sgd.q.push(src.q[i]);
            sgd.active.push(src.active[i]);
        }

        let mut sh = ShuntData::default();
        let src = &self.shunt_data;
        for i in 0..src.len() {
            let Some(&lb) = local_of.get(&src.bus[i]) else {
                continue;
            };
            sh.names.push(src.names[i].clone());
            sh.uid.push(src.uid[i]);
            sh.bus.push(lb);
            sh.g.push(src.g[i]);
            sh.b.push(src.b[i]);
            sh.active.push(src.active[i]);
        }

        NumericalCircuit {
            sbase: self.sbase,
            bus_data: bd,
            passive_branch_data: br,
            hvdc_data: hv,
            vsc_data: vs,
            generator_data: gd,
            battery_data: bt,
            load_data: ld,
            static_gen_data: sgd,
            shunt_data: sh,
        }
    }

    /// Assign PQ/PV/Slack per bus inside one island and promote a slack
    /// when none is declared.
    fn classify_buses(&mut self, island_id: usize, logger: &mut Logger) {
        let nbus = self.nbus();
        let mut types = vec![BusType::PQ; nbus];

        // voltage-controlled buses
        let g = &self.generator_data;
        for i in 0..g.len() {
            if g.active[i] && g.controllable[i] {
                types[g.bus[i]] = BusType::PV;
            }
        }
        let b = &self.battery_data;
        for i in 0..b.len() {
            if b.active[i] {
                // storage participates in voltage control like a machine
                if types[b.bus[i]] == BusType::PQ && b.snom[i] > 0.0 {
                    types[b.bus[i]] = BusType::PV;
                }
            }
        }

        // declared slack wins
        let mut slack_found = false;
        for i in 0..nbus {
            if self.bus_data.is_slack[i] && self.bus_data.active[i] {
                if slack_found {
                    // keep exactly one; demote the rest to PV
                    types[i] = BusType::PV;
                } else {
                    types[i] = BusType::Slack;
                    slack_found = true;
                }
            }
        }

        if !slack_found {
            // promote the bus with the largest connected generator
            let mut best: Option<(usize, f64)> = None;
            for i in 0..g.len() {
                if g.active[i] {
                    let cand = (g.bus[i], g.snom[i]);
                    if best.map(|(_, s)| cand.1 > s).unwrap_or(true) {
                        best = Some(cand);
                    }
                }
            }
            match best {
                Some((bus, _)) => {
                    types[bus] = BusType::Slack;
                    self.bus_data.is_slack[bus] = true;
                    slack_found = true;
                    logger.add_device_entry(
                        Severity::Warning,
                        self.bus_data.uid[bus],
                        format!(
                            "island {island_id}: no declared slack, promoted bus '{}'",
                            self.bus_data.names[bus]
                        ),
                    );
                }
                None => {
                    logger.add_warning(format!(
                        "island {island_id} has no source and is treated as passive"
                    ));
                }
            }
        }
        self.bus_data.bus_types = types;
    }

    /// Index of the slack bus, if the island has one.
    pub fn slack_index(&self) -> Option<usize> {
        self.bus_data
            .bus_types
            .iter()
            .position(|&t| t == BusType::Slack)
    }

    /// Whether any active injection source exists.
    pub fn has_source(&self) -> bool {
        let g = &self.generator_data;
        let b = &self.battery_data;
        let sg = &self.static_gen_data;
        (0..g.len()).any(|i| g.active[i])
            || (0..b.len()).any(|i| b.active[i])
            || (0..sg.len()).any(|i| sg.active[i] && sg.p[i] > 0.0)
    }
}

/// Value of an optionally profiled scalar at `t`.
fn at<P: Profile<f64>>(snapshot: f64, prof: &Option<P>, t: Option<usize>) -> f64 {
    match (prof, t) {
        (Some(p), Some(ti)) if ti < p.len() => p.get(ti),
        _ => snapshot,
    }
}

fn at_bool<P: Profile<bool>>(snapshot: bool, prof: &Option<P>, t: Option<usize>) -> bool {
    match (prof, t) {
        (Some(p), Some(ti)) if ti < p.len() => p.get(ti),
        _ => snapshot,
    }
}

/// Project `grid` at time index `t` (`None` = snapshot values) into a
/// [`NumericalCircuit`]. Fails with `MalformedGrid` on invariant violations.
pub fn compile_numerical_circuit_at(
    grid: &MultiCircuit,
    t: Option<usize>,
) -> VgResult<NumericalCircuit> {
    grid.validate()?;
    if let (Some(ti), axis) = (t, &grid.time_axis) {
        let nt = axis.as_ref().map(|a| a.len()).unwrap_or(0);
        if ti >= nt {
            return Err(VgError::MalformedGrid(format!(
                "time index {ti} out of range (axis length {nt})"
            )));
        }
    }

    let mut nc = NumericalCircuit {
        sbase: grid.sbase,
        ..Default::default()
    };

    for (i, bus) in grid.buses.iter().enumerate() {
        nc.bus_data.names.push(bus.name.clone());
        nc.bus_data.uid.push(bus.uid);
        nc.bus_data.vnom.push(bus.vnom.value());
        nc.bus_data.vmin.push(bus.vmin.value());
        nc.bus_data.vmax.push(bus.vmax.value());
        nc.bus_data
            .active
            .push(at_bool(bus.active, &bus.active_prof, t));
        nc.bus_data.is_slack.push(bus.is_slack);
        nc.bus_data.bus_types.push(BusType::PQ);
        nc.bus_data.original_idx.push(i);
    }

    for (k, br) in grid.branches.iter().enumerate() {
        nc.passive_branch_data.names.push(br.name.clone());
        nc.passive_branch_data.uid.push(br.uid);
        nc.passive_branch_data.f.push(br.from_bus.value());
        nc.passive_branch_data.t.push(br.to_bus.value());
        nc.passive_branch_data.r.push(br.r);
        nc.passive_branch_data.x.push(br.x);
        nc.passive_branch_data.b.push(br.b);
        nc.passive_branch_data
            .rates
            .push(at(br.rate.value(), &br.rate_prof, t));
        nc.passive_branch_data
            .contingency_rates
            .push(br.contingency_rate.value());
        if br.tap_module <= 0.0 {
            return Err(VgError::MalformedGrid(format!(
                "branch '{}' has non-positive tap module {}",
                br.name, br.tap_module
            )));
        }
        nc.passive_branch_data.tap_module.push(br.tap_module);
        nc.passive_branch_data.tap_phase.push(br.tap_phase.value());
        nc.passive_branch_data
            .tap_module_control
            .push(br.tap_module_control);
        nc.passive_branch_data.tap_vset.push(br.tap_vset.value());
        nc.passive_branch_data
            .tap_phase_control
            .push(br.tap_phase_control);
        nc.passive_branch_data.tap_pset.push(br.tap_pset.value());
        nc.passive_branch_data
            .active
            .push(at_bool(br.active, &br.active_prof, t));
        nc.passive_branch_data
            .monitor_loading
            .push(br.monitor_loading);
        nc.passive_branch_data.mttf.push(br.mttf.value());
        nc.passive_branch_data.mttr.push(br.mttr.value());
        nc.passive_branch_data.original_idx.push(k);
    }

    for h in &grid.hvdc_lines {
        nc.hvdc_data.names.push(h.name.clone());
        nc.hvdc_data.uid.push(h.uid);
        nc.hvdc_data.f.push(h.from_bus.value());
        nc.hvdc_data.t.push(h.to_bus.value());
        nc.hvdc_data
            .pset
            .push(at(h.p_set.value(), &h.pset_prof, t));
        nc.hvdc_data.loss_factor.push(h.loss_factor);
        nc.hvdc_data.rates.push(h.rate.value());
        nc.hvdc_data
            .active
            .push(at_bool(h.active, &h.active_prof, t));
    }

    for v in &grid.vscs {
        nc.vsc_data.names.push(v.name.clone());
        nc.vsc_data.uid.push(v.uid);
        nc.vsc_data.f.push(v.from_bus.value());
        nc.vsc_data.t.push(v.to_bus.value());
        match v.control_dc {
            vera_core::VscDcControl::P(p) => {
                nc.vsc_data.p_dc_set.push(p);
                nc.vsc_data.vdc_set.push(f64::NAN);
            }
            vera_core::VscDcControl::Vdc(vdc) => {
                nc.vsc_data.p_dc_set.push(f64::NAN);
                nc.vsc_data.vdc_set.push(vdc);
            }
        }
        match v.control_ac {
            vera_core::VscAcControl::Q(q) => {
                nc.vsc_data.q_ac_set.push(q);
                nc.vsc_data.vac_set.push(f64::NAN);
            }
            vera_core::VscAcControl::Vac(vac) => {
                nc.vsc_data.q_ac_set.push(f64::NAN);
                nc.vsc_data.vac_set.push(vac);
            }
        }
        nc.vsc_data.rates.push(v.rate.value());
        nc.vsc_data.active.push(v.active);
    }

    for g in &grid.generators {
        nc.generator_data.names.push(g.name.clone());
        nc.generator_data.uid.push(g.uid);
        nc.generator_data.bus.push(g.bus.value());
        nc.generator_data.p.push(at(g.p.value(), &g.p_prof, t));
        nc.generator_data.vset.push(g.vset.value());
        nc.generator_data.snom.push(g.snom.value());
        nc.generator_data.qmin.push(g.qmin.value());
        nc.generator_data.qmax.push(g.qmax.value());
        nc.generator_data.pmin.push(g.pmin.value());
        nc.generator_data.pmax.push(g.pmax.value());
        nc.generator_data.cost.push(g.cost);
        nc.generator_data.dispatchable.push(g.dispatchable);
        nc.generator_data.srap_enabled.push(g.srap_enabled);
        nc.generator_data.controllable.push(g.is_controlled);
        nc.generator_data
            .remote_bus
            .push(g.remote_bus.map(|rb| rb.value()));
        nc.generator_data.is_external.push(false);
        nc.generator_data
            .active
            .push(at_bool(g.active, &g.active_prof, t));
        nc.generator_data.mttf.push(g.mttf.value());
        nc.generator_data.mttr.push(g.mttr.value());
    }

    // external grids in voltage-source mode behave as stiff machines
    for e in &grid.external_grids {
        match e.mode {
            ExternalGridMode::VSource { vset_pu } => {
                nc.generator_data.names.push(e.name.clone());
                nc.generator_data.uid.push(e.uid);
                nc.generator_data.bus.push(e.bus.value());
                nc.generator_data.p.push(0.0);
                nc.generator_data.vset.push(vset_pu);
                nc.generator_data.snom.push(1e6);
                nc.generator_data.qmin.push(f64::NEG_INFINITY);
                nc.generator_data.qmax.push(f64::INFINITY);
                nc.generator_data.pmin.push(f64::NEG_INFINITY);
                nc.generator_data.pmax.push(f64::INFINITY);
                nc.generator_data.cost.push(0.0);
                nc.generator_data.dispatchable.push(false);
                nc.generator_data.srap_enabled.push(false);
                nc.generator_data.controllable.push(true);
                nc.generator_data.remote_bus.push(None);
                nc.generator_data.is_external.push(true);
                nc.generator_data.active.push(e.active);
                nc.generator_data.mttf.push(0.0);
                nc.generator_data.mttr.push(0.0);
            }
            ExternalGridMode::PQ { p_mw, q_mvar } => {
                nc.static_gen_data.names.push(e.name.clone());
                nc.static_gen_data.uid.push(e.uid);
                nc.static_gen_data.bus.push(e.bus.value());
                nc.static_gen_data.p.push(p_mw);
                nc.static_gen_data.q.push(q_mvar);
                nc.static_gen_data.active.push(e.active);
            }
        }
    }

    for b in &grid.batteries {
        nc.battery_data.names.push(b.name.clone());
        nc.battery_data.uid.push(b.uid);
        nc.battery_data.bus.push(b.bus.value());
        nc.battery_data.p.push(at(b.p.value(), &b.p_prof, t));
        nc.battery_data.vset.push(b.vset.value());
        nc.battery_data.snom.push(b.snom.value());
        nc.battery_data.qmin.push(b.qmin.value());
        nc.battery_data.qmax.push(b.qmax.value());
        nc.battery_data.pmax.push(b.pmax.value());
        nc.battery_data.enom.push(b.enom.value());
        nc.battery_data.soc0.push(b.soc0);
        nc.battery_data.soc_min.push(b.soc_min);
        nc.battery_data.eff_charge.push(b.eff_charge);
        nc.battery_data.eff_discharge.push(b.eff_discharge);
        nc.battery_data.cost.push(b.cost);
        nc.battery_data
            .active
            .push(at_bool(b.active, &b.active_prof, t));
        nc.battery_data.mttf.push(b.mttf.value());
        nc.battery_data.mttr.push(b.mttr.value());
    }

    for l in &grid.loads {
        nc.load_data.names.push(l.name.clone());
        nc.load_data.uid.push(l.uid);
        nc.load_data.bus.push(l.bus.value());
        nc.load_data.p.push(at(l.p.value(), &l.p_prof, t));
        nc.load_data.q.push(at(l.q.value(), &l.q_prof, t));
        nc.load_data
            .is_delta
            .push(l.connection == vera_core::LoadConnection::Delta);
        nc.load_data.model.push(l.model);
        nc.load_data
            .active
            .push(at_bool(l.active, &l.active_prof, t));
        nc.load_data.mttf.push(l.mttf.value());
        nc.load_data.mttr.push(l.mttr.value());
    }

    for s in &grid.static_gens {
        nc.static_gen_data.names.push(s.name.clone());
        nc.static_gen_data.uid.push(s.uid);
        nc.static_gen_data.bus.push(s.bus.value());
        nc.static_gen_data.p.push(at(s.p.value(), &s.p_prof, t));
        nc.static_gen_data.q.push(s.q.value());
        nc.static_gen_data
            .active
            .push(at_bool(s.active, &s.active_prof, t));
    }

    for s in &grid.shunts {
        nc.shunt_data.names.push(s.name.clone());
        nc.shunt_data.uid.push(s.uid);
        nc.shunt_data.bus.push(s.bus.value());
        nc.shunt_data.g.push(s.g.value());
        nc.shunt_data.b.push(s.b.value());
        nc.shunt_data.active.push(s.active);
    }

    Ok(nc)
}
