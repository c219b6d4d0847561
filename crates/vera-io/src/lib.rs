//! # vera-io: Container archive persistence
//!
//! A grid is stored as a ZIP container of tabular records: one CSV table
//! per device kind, plus a `model.json` summary (name, base power, device
//! counts, time axis, format version).
//!
//! Columns follow the registered properties of each device kind
//! ([`vera_core::registered_properties`]): unknown columns are ignored on
//! read, a missing required column or a missing table fails with
//! `BrokenArchive`. Dense numeric profiles are stored as companion
//! `<kind>_prof_<field>.csv` tables with one column per device uid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use vera_core::{
    bump_uid_floor, required_columns, Battery, Branch, Bus, BusId, ContingencyAction,
    ContingencyGroup, DenseProfile, DeviceKind, ExternalGrid, ExternalGridMode, Gen, Hours,
    HvdcControlMode, HvdcLine, Load, LoadConnection, LoadModel, Megavars, MegavoltAmperes,
    Megawatts, MegawattHours, MultiCircuit, NumProfile, PerUnit, Profile, Radians, Shunt,
    StaticGen, TimeAxis, VgError, VgResult, Vsc, VscAcControl, VscDcControl,
};

/// Archive format version; readers reject newer majors.
const FORMAT_VERSION: u32 = 1;

/// JSON summary stored next to the tables.
#[derive(Debug, Serialize, Deserialize)]
struct ModelSummary {
    version: u32,
    name: String,
    sbase: f64,
    device_counts: HashMap<String, usize>,
    time_axis: Option<Vec<DateTime<Utc>>>,
}

// ----------------------------------------------------------------------
// writing
// ----------------------------------------------------------------------

fn fmt_bool(v: bool) -> String {
    if v { "true" } else { "false" }.to_string()
}

fn csv_table(headers: &[&str], rows: Vec<Vec<String>>) -> VgResult<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(headers)
        .map_err(|e| VgError::Parse(e.to_string()))?;
    for row in rows {
        wtr.write_record(&row)
            .map_err(|e| VgError::Parse(e.to_string()))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| VgError::Parse(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| VgError::Parse(e.to_string()))
}

fn bus_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.buses
        .iter()
        .map(|b| {
            vec![
                b.id.value().to_string(),
                b.uid.to_string(),
                b.name.clone(),
                b.vnom.value().to_string(),
                b.vmin.value().to_string(),
                b.vmax.value().to_string(),
                fmt_bool(b.is_slack),
                fmt_bool(b.active),
                b.area_id.map(|a| a.to_string()).unwrap_or_default(),
                b.zone_id.map(|z| z.to_string()).unwrap_or_default(),
            ]
        })
        .collect()
}

fn branch_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.branches
        .iter()
        .map(|br| {
            vec![
                br.id.value().to_string(),
                br.uid.to_string(),
                br.name.clone(),
                br.kind.label().to_string(),
                br.from_bus.value().to_string(),
                br.to_bus.value().to_string(),
                br.r.to_string(),
                br.x.to_string(),
                br.b.to_string(),
                br.rate.value().to_string(),
                br.contingency_rate.value().to_string(),
                br.tap_module.to_string(),
                br.tap_phase.value().to_string(),
                fmt_bool(br.monitor_loading),
                fmt_bool(br.active),
                br.mttf.value().to_string(),
                br.mttr.value().to_string(),
            ]
        })
        .collect()
}

fn hvdc_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.hvdc_lines
        .iter()
        .map(|h| {
            vec![
                h.id.value().to_string(),
                h.uid.to_string(),
                h.name.clone(),
                h.from_bus.value().to_string(),
                h.to_bus.value().to_string(),
                h.p_set.value().to_string(),
                h.loss_factor.to_string(),
                h.rate.value().to_string(),
                match h.control_mode {
                    HvdcControlMode::PSet => "pset".to_string(),
                    HvdcControlMode::Free => "free".to_string(),
                },
                fmt_bool(h.active),
            ]
        })
        .collect()
}

fn vsc_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.vscs
        .iter()
        .map(|v| {
            let (dc_mode, dc_set) = match v.control_dc {
                VscDcControl::Vdc(x) => ("vdc", x),
                VscDcControl::P(x) => ("p", x),
            };
            let (ac_mode, ac_set) = match v.control_ac {
                VscAcControl::Q(x) => ("q", x),
                VscAcControl::Vac(x) => ("vac", x),
            };
            vec![
                v.id.value().to_string(),
                v.uid.to_string(),
                v.name.clone(),
                v.from_bus.value().to_string(),
                v.to_bus.value().to_string(),
                dc_mode.to_string(),
                dc_set.to_string(),
                ac_mode.to_string(),
                ac_set.to_string(),
                v.rate.value().to_string(),
                fmt_bool(v.active),
            ]
        })
        .collect()
}

fn gen_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.generators
        .iter()
        .map(|g| {
            vec![
                g.id.value().to_string(),
                g.uid.to_string(),
                g.name.clone(),
                g.bus.value().to_string(),
                g.p.value().to_string(),
                g.vset.value().to_string(),
                g.snom.value().to_string(),
                g.qmin.value().to_string(),
                g.qmax.value().to_string(),
                g.pmin.value().to_string(),
                g.pmax.value().to_string(),
                g.cost.to_string(),
                fmt_bool(g.dispatchable),
                fmt_bool(g.srap_enabled),
                fmt_bool(g.active),
                g.mttf.value().to_string(),
                g.mttr.value().to_string(),
            ]
        })
        .collect()
}

fn battery_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.batteries
        .iter()
        .map(|b| {
            vec![
                b.id.value().to_string(),
                b.uid.to_string(),
                b.name.clone(),
                b.bus.value().to_string(),
                b.p.value().to_string(),
                b.vset.value().to_string(),
                b.snom.value().to_string(),
                b.qmin.value().to_string(),
                b.qmax.value().to_string(),
                "0".to_string(),
                b.pmax.value().to_string(),
                b.enom.value().to_string(),
                b.soc0.to_string(),
                b.soc_min.to_string(),
                b.eff_charge.to_string(),
                b.eff_discharge.to_string(),
                b.cost.to_string(),
                fmt_bool(b.active),
                b.mttf.value().to_string(),
                b.mttr.value().to_string(),
            ]
        })
        .collect()
}

fn load_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.loads
        .iter()
        .map(|l| {
            vec![
                l.id.value().to_string(),
                l.uid.to_string(),
                l.name.clone(),
                l.bus.value().to_string(),
                l.p.value().to_string(),
                l.q.value().to_string(),
                fmt_bool(l.active),
                l.mttf.value().to_string(),
                l.mttr.value().to_string(),
                match l.connection {
                    LoadConnection::Wye => "wye".to_string(),
                    LoadConnection::Delta => "delta".to_string(),
                },
                match l.model {
                    LoadModel::ConstantPower => "p".to_string(),
                    LoadModel::ConstantCurrent => "i".to_string(),
                    LoadModel::ConstantImpedance => "z".to_string(),
                },
            ]
        })
        .collect()
}

fn static_gen_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.static_gens
        .iter()
        .map(|s| {
            vec![
                s.id.value().to_string(),
                s.uid.to_string(),
                s.name.clone(),
                s.bus.value().to_string(),
                s.p.value().to_string(),
                s.q.value().to_string(),
                fmt_bool(s.active),
            ]
        })
        .collect()
}

fn shunt_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.shunts
        .iter()
        .map(|s| {
            vec![
                s.id.value().to_string(),
                s.uid.to_string(),
                s.name.clone(),
                s.bus.value().to_string(),
                s.g.value().to_string(),
                s.b.value().to_string(),
                fmt_bool(s.active),
            ]
        })
        .collect()
}

fn external_grid_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    grid.external_grids
        .iter()
        .map(|e| {
            let (mode, vset, p, q) = match e.mode {
                ExternalGridMode::VSource { vset_pu } => ("v", vset_pu, 0.0, 0.0),
                ExternalGridMode::PQ { p_mw, q_mvar } => ("pq", 0.0, p_mw, q_mvar),
            };
            vec![
                e.id.value().to_string(),
                e.uid.to_string(),
                e.name.clone(),
                e.bus.value().to_string(),
                mode.to_string(),
                vset.to_string(),
                p.to_string(),
                q.to_string(),
                fmt_bool(e.active),
            ]
        })
        .collect()
}

fn contingency_rows(grid: &MultiCircuit) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for g in &grid.contingency_groups {
        for ev in &g.events {
            let (action, value) = match ev.action {
                ContingencyAction::Deactivate => ("deactivate", String::new()),
                ContingencyAction::SetP(p) => ("set_p", p.to_string()),
                ContingencyAction::SetActive(v) => ("set_active", fmt_bool(v)),
            };
            rows.push(vec![
                g.id.value().to_string(),
                g.uid.to_string(),
                g.name.clone(),
                ev.device_uid.to_string(),
                action.to_string(),
                value,
            ]);
        }
    }
    rows
}

fn header_names(kind: DeviceKind) -> Vec<&'static str> {
    vera_core::registered_properties(kind)
        .iter()
        .map(|p| p.name)
        .collect()
}

/// Dense numeric profile table: first column is the time index, one column
/// per device uid.
fn profile_table(uids: &[u64], profiles: &[Option<&NumProfile>], nt: usize) -> Option<String> {
    if profiles.iter().all(|p| p.is_none()) {
        return None;
    }
    let mut headers = vec!["t".to_string()];
    headers.extend(uids.iter().map(|u| u.to_string()));
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(&headers).ok()?;
    for t in 0..nt {
        let mut row = vec![t.to_string()];
        for p in profiles {
            row.push(match p {
                Some(prof) if t < prof.len() => prof.get(t).to_string(),
                _ => String::new(),
            });
        }
        wtr.write_record(&row).ok()?;
    }
    String::from_utf8(wtr.into_inner().ok()?).ok()
}

/// Write `grid` as a container archive at `path`.
pub fn save_archive(grid: &MultiCircuit, path: &Path) -> VgResult<()> {
    let file = File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut counts = HashMap::new();
    counts.insert("bus".to_string(), grid.buses.len());
    counts.insert("branch".to_string(), grid.branches.len());
    counts.insert("hvdc".to_string(), grid.hvdc_lines.len());
    counts.insert("vsc".to_string(), grid.vscs.len());
    counts.insert("generator".to_string(), grid.generators.len());
    counts.insert("battery".to_string(), grid.batteries.len());
    counts.insert("load".to_string(), grid.loads.len());
    counts.insert("static_gen".to_string(), grid.static_gens.len());
    counts.insert("shunt".to_string(), grid.shunts.len());
    counts.insert("external_grid".to_string(), grid.external_grids.len());
    counts.insert(
        "contingency_group".to_string(),
        grid.contingency_groups.len(),
    );

    let summary = ModelSummary {
        version: FORMAT_VERSION,
        name: grid.name.clone(),
        sbase: grid.sbase,
        device_counts: counts,
        time_axis: grid.time_axis.as_ref().map(|a| a.stamps().to_vec()),
    };
    zip.start_file("model.json", opts)
        .map_err(|e| VgError::Parse(e.to_string()))?;
    zip.write_all(
        serde_json::to_string_pretty(&summary)
            .map_err(|e| VgError::Parse(e.to_string()))?
            .as_bytes(),
    )?;

    let tables: Vec<(DeviceKind, Vec<Vec<String>>)> = vec![
        (DeviceKind::Bus, bus_rows(grid)),
        (DeviceKind::Branch, branch_rows(grid)),
        (DeviceKind::HvdcLine, hvdc_rows(grid)),
        (DeviceKind::Vsc, vsc_rows(grid)),
        (DeviceKind::Generator, gen_rows(grid)),
        (DeviceKind::Battery, battery_rows(grid)),
        (DeviceKind::Load, load_rows(grid)),
        (DeviceKind::StaticGen, static_gen_rows(grid)),
        (DeviceKind::Shunt, shunt_rows(grid)),
        (DeviceKind::ExternalGrid, external_grid_rows(grid)),
        (DeviceKind::ContingencyGroup, contingency_rows(grid)),
    ];
    for (kind, rows) in tables {
        if rows.is_empty() {
            continue;
        }
        let content = csv_table(&header_names(kind), rows)?;
        zip.start_file(format!("{}.csv", kind.table_name()), opts)
            .map_err(|e| VgError::Parse(e.to_string()))?;
        zip.write_all(content.as_bytes())?;
    }

    // dense profiles
    let nt = grid.time_len();
    if nt > 0 {
        let load_uids: Vec<u64> = grid.loads.iter().map(|l| l.uid).collect();
        let p_profs: Vec<Option<&NumProfile>> =
            grid.loads.iter().map(|l| l.p_prof.as_ref()).collect();
        if let Some(table) = profile_table(&load_uids, &p_profs, nt) {
            zip.start_file("load_prof_p.csv", opts)
                .map_err(|e| VgError::Parse(e.to_string()))?;
            zip.write_all(table.as_bytes())?;
        }
        let q_profs: Vec<Option<&NumProfile>> =
            grid.loads.iter().map(|l| l.q_prof.as_ref()).collect();
        if let Some(table) = profile_table(&load_uids, &q_profs, nt) {
            zip.start_file("load_prof_q.csv", opts)
                .map_err(|e| VgError::Parse(e.to_string()))?;
            zip.write_all(table.as_bytes())?;
        }
        let gen_uids: Vec<u64> = grid.generators.iter().map(|g| g.uid).collect();
        let gp_profs: Vec<Option<&NumProfile>> =
            grid.generators.iter().map(|g| g.p_prof.as_ref()).collect();
        if let Some(table) = profile_table(&gen_uids, &gp_profs, nt) {
            zip.start_file("generator_prof_p.csv", opts)
                .map_err(|e| VgError::Parse(e.to_string()))?;
            zip.write_all(table.as_bytes())?;
        }
    }

    zip.finish().map_err(|e| VgError::Parse(e.to_string()))?;
    Ok(())
}

// ----------------------------------------------------------------------
// reading
// ----------------------------------------------------------------------

/// One parsed CSV table with header-positioned access.
struct Table {
    col_of: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn parse(kind: DeviceKind, content: &str) -> VgResult<Self> {
        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr
            .headers()
            .map_err(|e| VgError::Parse(e.to_string()))?
            .clone();
        let col_of: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_string(), i))
            .collect();

        for required in required_columns(kind) {
            if !col_of.contains_key(required) {
                return Err(VgError::BrokenArchive(format!(
                    "table '{}' is missing required column '{required}'",
                    kind.table_name()
                )));
            }
        }

        let mut rows = Vec::new();
        for rec in rdr.records() {
            let rec = rec.map_err(|e| VgError::Parse(e.to_string()))?;
            rows.push(rec.iter().map(|s| s.to_string()).collect());
        }
        Ok(Self { col_of, rows })
    }

    fn text(&self, row: &[String], col: &str) -> String {
        self.col_of
            .get(col)
            .and_then(|&i| row.get(i))
            .cloned()
            .unwrap_or_default()
    }

    fn float(&self, row: &[String], col: &str, default: f64) -> f64 {
        let s = self.text(row, col);
        if s.is_empty() {
            default
        } else {
            s.parse().unwrap_or(default)
        }
    }

    fn int(&self, row: &[String], col: &str) -> VgResult<u64> {
        let s = self.text(row, col);
        s.parse()
            .map_err(|_| VgError::BrokenArchive(format!("bad integer '{s}' in column '{col}'")))
    }

    fn boolean(&self, row: &[String], col: &str, default: bool) -> bool {
        match self.text(row, col).as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        }
    }
}

fn read_entry(
    zip: &mut zip::ZipArchive<File>,
    name: &str,
) -> VgResult<Option<String>> {
    match zip.by_name(name) {
        Ok(mut f) => {
            let mut s = String::new();
            f.read_to_string(&mut s)?;
            Ok(Some(s))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(VgError::Parse(e.to_string())),
    }
}

fn require_table(
    zip: &mut zip::ZipArchive<File>,
    kind: DeviceKind,
    expected: usize,
) -> VgResult<Option<Table>> {
    let name = format!("{}.csv", kind.table_name());
    match read_entry(zip, &name)? {
        Some(content) => Ok(Some(Table::parse(kind, &content)?)),
        None if expected == 0 => Ok(None),
        None => Err(VgError::BrokenArchive(format!(
            "missing table '{name}' for {expected} recorded device(s)"
        ))),
    }
}

/// Dense profile table -> uid-keyed vectors.
fn parse_profile_table(content: &str) -> VgResult<HashMap<u64, Vec<f64>>> {
    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let headers = rdr
        .headers()
        .map_err(|e| VgError::Parse(e.to_string()))?
        .clone();
    let uids: Vec<Option<u64>> = headers.iter().map(|h| h.parse().ok()).collect();
    let mut out: HashMap<u64, Vec<f64>> = HashMap::new();
    for rec in rdr.records() {
        let rec = rec.map_err(|e| VgError::Parse(e.to_string()))?;
        for (i, cell) in rec.iter().enumerate() {
            if let Some(Some(uid)) = uids.get(i) {
                if let Ok(v) = cell.parse::<f64>() {
                    out.entry(*uid).or_default().push(v);
                }
            }
        }
    }
    Ok(out)
}

/// Read a container archive back into a [`MultiCircuit`].
pub fn load_archive(path: &Path) -> VgResult<MultiCircuit> {
    let file = File::open(path)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| VgError::Parse(e.to_string()))?;

    let summary_text = read_entry(&mut zip, "model.json")?
        .ok_or_else(|| VgError::BrokenArchive("missing model.json".into()))?;
    let summary: ModelSummary =
        serde_json::from_str(&summary_text).map_err(|e| VgError::Parse(e.to_string()))?;
    if summary.version > FORMAT_VERSION {
        return Err(VgError::BrokenArchive(format!(
            "archive version {} is newer than supported {FORMAT_VERSION}",
            summary.version
        )));
    }

    let mut grid = MultiCircuit::new(summary.name.clone());
    grid.sbase = summary.sbase;
    if let Some(stamps) = summary.time_axis {
        grid.time_axis = Some(TimeAxis::new(stamps)?);
    }

    let count = |key: &str| summary.device_counts.get(key).copied().unwrap_or(0);
    let mut max_uid = 0u64;

    if let Some(t) = require_table(&mut zip, DeviceKind::Bus, count("bus"))? {
        for row in &t.rows {
            let mut bus = Bus::new(t.text(row, "name"), t.float(row, "vnom_kv", 0.0));
            bus.uid = t.int(row, "uid")?;
            bus.vmin = PerUnit(t.float(row, "vmin_pu", 0.9));
            bus.vmax = PerUnit(t.float(row, "vmax_pu", 1.1));
            bus.is_slack = t.boolean(row, "is_slack", false);
            bus.active = t.boolean(row, "active", true);
            bus.area_id = t.text(row, "area_id").parse().ok();
            bus.zone_id = t.text(row, "zone_id").parse().ok();
            max_uid = max_uid.max(bus.uid);
            grid.add_bus(bus);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Branch, count("branch"))? {
        for row in &t.rows {
            let from = BusId::new(t.int(row, "bus_from")? as usize);
            let to = BusId::new(t.int(row, "bus_to")? as usize);
            let name = t.text(row, "name");
            let r = t.float(row, "r_pu", 0.0);
            let x = t.float(row, "x_pu", 1e-20);
            let mut br = match t.text(row, "kind").as_str() {
                "transformer" => {
                    // winding voltages recovered from the endpoint nominals
                    let hv = grid.buses[from.value()].vnom.value();
                    let lv = grid.buses[to.value()].vnom.value();
                    Branch::transformer(name, from, to, r, x, hv.max(lv), hv.min(lv))
                }
                "series_reactance" => Branch::series_reactance(name, from, to, r, x),
                "switch" => Branch::switch(name, from, to),
                _ => Branch::line(name, from, to, r, x),
            };
            br.uid = t.int(row, "uid")?;
            br.b = t.float(row, "b_pu", 0.0);
            br.rate = MegavoltAmperes(t.float(row, "rate_mva", 0.0));
            br.contingency_rate =
                MegavoltAmperes(t.float(row, "contingency_rate_mva", 0.0));
            br.tap_module = t.float(row, "tap_module", 1.0);
            br.tap_phase = Radians(t.float(row, "tap_phase_rad", 0.0));
            br.monitor_loading = t.boolean(row, "monitor_loading", true);
            br.active = t.boolean(row, "active", true);
            br.mttf = Hours(t.float(row, "mttf_h", 0.0));
            br.mttr = Hours(t.float(row, "mttr_h", 0.0));
            max_uid = max_uid.max(br.uid);
            grid.add_branch(br);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::HvdcLine, count("hvdc"))? {
        for row in &t.rows {
            let mut h = HvdcLine::new(
                t.text(row, "name"),
                BusId::new(t.int(row, "bus_from")? as usize),
                BusId::new(t.int(row, "bus_to")? as usize),
                t.float(row, "p_set_mw", 0.0),
            );
            h.uid = t.int(row, "uid")?;
            h.loss_factor = t.float(row, "loss_factor", 0.0);
            h.rate = MegavoltAmperes(t.float(row, "rate_mva", 0.0));
            h.control_mode = match t.text(row, "control_mode").as_str() {
                "free" => HvdcControlMode::Free,
                _ => HvdcControlMode::PSet,
            };
            h.active = t.boolean(row, "active", true);
            max_uid = max_uid.max(h.uid);
            grid.add_hvdc(h);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Vsc, count("vsc"))? {
        for row in &t.rows {
            let mut v = Vsc::new(
                t.text(row, "name"),
                BusId::new(t.int(row, "bus_from")? as usize),
                BusId::new(t.int(row, "bus_to")? as usize),
            );
            v.uid = t.int(row, "uid")?;
            let dc_set = t.float(row, "control_dc_set", 0.0);
            v.control_dc = match t.text(row, "control_dc").as_str() {
                "vdc" => VscDcControl::Vdc(dc_set),
                _ => VscDcControl::P(dc_set),
            };
            let ac_set = t.float(row, "control_ac_set", 0.0);
            v.control_ac = match t.text(row, "control_ac").as_str() {
                "vac" => VscAcControl::Vac(ac_set),
                _ => VscAcControl::Q(ac_set),
            };
            v.rate = MegavoltAmperes(t.float(row, "rate_mva", 0.0));
            v.active = t.boolean(row, "active", true);
            max_uid = max_uid.max(v.uid);
            grid.add_vsc(v);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Generator, count("generator"))? {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut g = Gen::new(t.text(row, "name"), t.float(row, "p_mw", 0.0));
            g.uid = t.int(row, "uid")?;
            g.vset = PerUnit(t.float(row, "vset_pu", 1.0));
            g.snom = MegavoltAmperes(t.float(row, "snom_mva", 9999.0));
            g.qmin = Megavars(t.float(row, "qmin_mvar", f64::NEG_INFINITY));
            g.qmax = Megavars(t.float(row, "qmax_mvar", f64::INFINITY));
            g.pmin = Megawatts(t.float(row, "pmin_mw", 0.0));
            g.pmax = Megawatts(t.float(row, "pmax_mw", f64::INFINITY));
            g.cost = t.float(row, "cost", 0.0);
            g.dispatchable = t.boolean(row, "dispatchable", true);
            g.srap_enabled = t.boolean(row, "srap_enabled", false);
            g.active = t.boolean(row, "active", true);
            g.mttf = Hours(t.float(row, "mttf_h", 0.0));
            g.mttr = Hours(t.float(row, "mttr_h", 0.0));
            max_uid = max_uid.max(g.uid);
            grid.add_generator(bus, g);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Battery, count("battery"))? {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut b = Battery::new(t.text(row, "name"), t.float(row, "enom_mwh", 0.0));
            b.uid = t.int(row, "uid")?;
            b.p = Megawatts(t.float(row, "p_mw", 0.0));
            b.vset = PerUnit(t.float(row, "vset_pu", 1.0));
            b.snom = MegavoltAmperes(t.float(row, "snom_mva", 9999.0));
            b.qmin = Megavars(t.float(row, "qmin_mvar", f64::NEG_INFINITY));
            b.qmax = Megavars(t.float(row, "qmax_mvar", f64::INFINITY));
            b.pmax = Megawatts(t.float(row, "pmax_mw", f64::INFINITY));
            b.enom = MegawattHours(t.float(row, "enom_mwh", 0.0));
            b.soc0 = t.float(row, "soc0", 1.0);
            b.soc_min = t.float(row, "soc_min", 0.1);
            b.eff_charge = t.float(row, "eff_charge", 0.95);
            b.eff_discharge = t.float(row, "eff_discharge", 0.95);
            b.cost = t.float(row, "cost", 0.0);
            b.active = t.boolean(row, "active", true);
            b.mttf = Hours(t.float(row, "mttf_h", 0.0));
            b.mttr = Hours(t.float(row, "mttr_h", 0.0));
            max_uid = max_uid.max(b.uid);
            grid.add_battery(bus, b);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Load, count("load"))? {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut l = Load::new(
                t.text(row, "name"),
                t.float(row, "p_mw", 0.0),
                t.float(row, "q_mvar", 0.0),
            );
            l.uid = t.int(row, "uid")?;
            l.active = t.boolean(row, "active", true);
            l.mttf = Hours(t.float(row, "mttf_h", 0.0));
            l.mttr = Hours(t.float(row, "mttr_h", 0.0));
            l.connection = match t.text(row, "connection").as_str() {
                "delta" => LoadConnection::Delta,
                _ => LoadConnection::Wye,
            };
            l.model = match t.text(row, "model").as_str() {
                "i" => LoadModel::ConstantCurrent,
                "z" => LoadModel::ConstantImpedance,
                _ => LoadModel::ConstantPower,
            };
            max_uid = max_uid.max(l.uid);
            grid.add_load(bus, l);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::StaticGen, count("static_gen"))? {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut s = StaticGen::new(
                t.text(row, "name"),
                t.float(row, "p_mw", 0.0),
                t.float(row, "q_mvar", 0.0),
            );
            s.uid = t.int(row, "uid")?;
            s.active = t.boolean(row, "active", true);
            max_uid = max_uid.max(s.uid);
            grid.add_static_gen(bus, s);
        }
    }

    if let Some(t) = require_table(&mut zip, DeviceKind::Shunt, count("shunt"))? {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut s = Shunt::new(
                t.text(row, "name"),
                t.float(row, "g_mw", 0.0),
                t.float(row, "b_mvar", 0.0),
            );
            s.uid = t.int(row, "uid")?;
            s.active = t.boolean(row, "active", true);
            max_uid = max_uid.max(s.uid);
            grid.add_shunt(bus, s);
        }
    }

    if let Some(t) =
        require_table(&mut zip, DeviceKind::ExternalGrid, count("external_grid"))?
    {
        for row in &t.rows {
            let bus = BusId::new(t.int(row, "bus")? as usize);
            let mut e = match t.text(row, "mode").as_str() {
                "pq" => ExternalGrid::pq(
                    t.text(row, "name"),
                    t.float(row, "p_mw", 0.0),
                    t.float(row, "q_mvar", 0.0),
                ),
                _ => ExternalGrid::voltage_source(
                    t.text(row, "name"),
                    t.float(row, "vset_pu", 1.0),
                ),
            };
            e.uid = t.int(row, "uid")?;
            e.active = t.boolean(row, "active", true);
            max_uid = max_uid.max(e.uid);
            grid.add_external_grid(bus, e);
        }
    }

    if let Some(t) = require_table(
        &mut zip,
        DeviceKind::ContingencyGroup,
        count("contingency_group"),
    )? {
        let mut groups: HashMap<u64, ContingencyGroup> = HashMap::new();
        let mut order: Vec<u64> = Vec::new();
        for row in &t.rows {
            let uid = t.int(row, "uid")?;
            let group = groups.entry(uid).or_insert_with(|| {
                order.push(uid);
                let mut g = ContingencyGroup::new(t.text(row, "name"));
                g.uid = uid;
                g
            });
            let action = match t.text(row, "action").as_str() {
                "set_p" => ContingencyAction::SetP(t.float(row, "value", 0.0)),
                "set_active" => {
                    ContingencyAction::SetActive(t.boolean(row, "value", false))
                }
                _ => ContingencyAction::Deactivate,
            };
            group.add_event(t.int(row, "device_uid")?, action);
            max_uid = max_uid.max(uid);
        }
        for uid in order {
            if let Some(g) = groups.remove(&uid) {
                grid.add_contingency_group(g);
            }
        }
    }

    // dense profiles
    if grid.time_len() > 0 {
        if let Some(content) = read_entry(&mut zip, "load_prof_p.csv")? {
            let profs = parse_profile_table(&content)?;
            for l in grid.loads.iter_mut() {
                if let Some(values) = profs.get(&l.uid) {
                    l.p_prof = Some(NumProfile::Dense(DenseProfile::new(values.clone())));
                }
            }
        }
        if let Some(content) = read_entry(&mut zip, "load_prof_q.csv")? {
            let profs = parse_profile_table(&content)?;
            for l in grid.loads.iter_mut() {
                if let Some(values) = profs.get(&l.uid) {
                    l.q_prof = Some(NumProfile::Dense(DenseProfile::new(values.clone())));
                }
            }
        }
        if let Some(content) = read_entry(&mut zip, "generator_prof_p.csv")? {
            let profs = parse_profile_table(&content)?;
            for g in grid.generators.iter_mut() {
                if let Some(values) = profs.get(&g.uid) {
                    g.p_prof = Some(NumProfile::Dense(DenseProfile::new(values.clone())));
                }
            }
        }
    }

    bump_uid_floor(max_uid + 1);
    grid.validate()?;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vera_core::{DenseProfile, NumProfile};

    fn sample_grid() -> MultiCircuit {
        let t0 = chrono::Utc::now();
        let mut grid =
            MultiCircuit::new("sample").with_time_axis(TimeAxis::hourly(t0, 4));
        let b1 = grid.add_bus(Bus::new("B1", 132.0).as_slack());
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        grid.add_branch(
            Branch::line("L", b1, b2, 0.01, 0.1)
                .with_rating(100.0)
                .with_contingency_rating(110.0),
        );
        grid.add_generator(
            b1,
            Gen::new("G", 50.0)
                .with_q_limits(-30.0, 40.0)
                .with_cost(12.5)
                .with_srap(true),
        );
        let mut load = Load::new("Ld", 50.0, 10.0);
        load.p_prof = Some(NumProfile::Dense(DenseProfile::new(vec![
            40.0, 45.0, 50.0, 55.0,
        ])));
        grid.add_load(b2, load);
        grid.add_shunt(b2, Shunt::new("C", 0.0, 20.0));
        let br_uid = grid.branches[0].uid;
        grid.add_contingency_group(ContingencyGroup::branch_outage("N-1 L", br_uid));
        grid
    }

    #[test]
    fn test_round_trip() {
        let grid = sample_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.veragrid");

        save_archive(&grid, &path).unwrap();
        let loaded = load_archive(&path).unwrap();

        assert_eq!(loaded.name, grid.name);
        assert_eq!(loaded.bus_count(), 2);
        assert_eq!(loaded.branch_count(), 1);
        assert_eq!(loaded.generators.len(), 1);
        assert_eq!(loaded.loads.len(), 1);
        assert_eq!(loaded.shunts.len(), 1);
        assert_eq!(loaded.contingency_groups.len(), 1);

        // uids survive the round trip
        assert_eq!(loaded.branches[0].uid, grid.branches[0].uid);
        assert_eq!(
            loaded.contingency_groups[0].events[0].device_uid,
            grid.branches[0].uid
        );
        // scalar values
        assert_eq!(loaded.generators[0].qmax.value(), 40.0);
        assert!(loaded.generators[0].srap_enabled);
        assert_eq!(loaded.branches[0].contingency_rate.value(), 110.0);
        // profile
        let prof = loaded.loads[0].p_prof.as_ref().unwrap();
        assert_eq!(prof.len(), 4);
        assert_eq!(prof.get(2), 50.0);
        // time axis
        assert_eq!(loaded.time_len(), 4);
    }

    #[test]
    fn test_unknown_columns_ignored() {
        let grid = sample_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.veragrid");
        save_archive(&grid, &path).unwrap();

        // rewrite the bus table with an extra column appended
        let file = File::open(&path).unwrap();
        let mut zin = zip::ZipArchive::new(file).unwrap();
        let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
        for i in 0..zin.len() {
            let mut f = zin.by_index(i).unwrap();
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).unwrap();
            entries.insert(f.name().to_string(), buf);
        }
        let bus_csv = String::from_utf8(entries["bus.csv"].clone()).unwrap();
        let patched: Vec<String> = bus_csv
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 0 {
                    format!("{line},mystery_column")
                } else {
                    format!("{line},42")
                }
            })
            .collect();
        entries.insert("bus.csv".into(), patched.join("\n").into_bytes());

        let path2 = dir.path().join("patched.veragrid");
        let out = File::create(&path2).unwrap();
        let mut zout = zip::ZipWriter::new(out);
        for (name, data) in &entries {
            zout.start_file(name, zip::write::FileOptions::default())
                .unwrap();
            zout.write_all(data).unwrap();
        }
        zout.finish().unwrap();

        let loaded = load_archive(&path2).unwrap();
        assert_eq!(loaded.bus_count(), 2);
    }

    #[test]
    fn test_missing_required_column_is_broken_archive() {
        let grid = sample_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.veragrid");
        save_archive(&grid, &path).unwrap();

        let file = File::open(&path).unwrap();
        let mut zin = zip::ZipArchive::new(file).unwrap();
        let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
        for i in 0..zin.len() {
            let mut f = zin.by_index(i).unwrap();
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).unwrap();
            entries.insert(f.name().to_string(), buf);
        }
        // drop the x_pu column from the branch table
        let branch_csv = String::from_utf8(entries["branch.csv"].clone()).unwrap();
        let patched: Vec<String> = branch_csv
            .lines()
            .map(|line| {
                let cells: Vec<&str> = line.split(',').collect();
                cells
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != 7) // x_pu position
                    .map(|(_, c)| *c)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        entries.insert("branch.csv".into(), patched.join("\n").into_bytes());

        let path2 = dir.path().join("broken.veragrid");
        let out = File::create(&path2).unwrap();
        let mut zout = zip::ZipWriter::new(out);
        for (name, data) in &entries {
            zout.start_file(name, zip::write::FileOptions::default())
                .unwrap();
            zout.write_all(data).unwrap();
        }
        zout.finish().unwrap();

        assert!(matches!(
            load_archive(&path2),
            Err(VgError::BrokenArchive(_))
        ));
    }

    #[test]
    fn test_missing_table_is_broken_archive() {
        let grid = sample_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.veragrid");
        save_archive(&grid, &path).unwrap();

        let file = File::open(&path).unwrap();
        let mut zin = zip::ZipArchive::new(file).unwrap();
        let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
        for i in 0..zin.len() {
            let mut f = zin.by_index(i).unwrap();
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).unwrap();
            entries.insert(f.name().to_string(), buf);
        }
        entries.remove("generator.csv");

        let path2 = dir.path().join("no-gens.veragrid");
        let out = File::create(&path2).unwrap();
        let mut zout = zip::ZipWriter::new(out);
        for (name, data) in &entries {
            zout.start_file(name, zip::write::FileOptions::default())
                .unwrap();
            zout.write_all(data).unwrap();
        }
        zout.finish().unwrap();

        assert!(matches!(
            load_archive(&path2),
            Err(VgError::BrokenArchive(_))
        ));
    }
}
