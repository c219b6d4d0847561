//! Registry of serializable device properties.
//!
//! Table-oriented persistence needs a stable (kind, field) -> column mapping
//! without runtime reflection. Each device kind registers its column names
//! here; the archive reader ignores unknown columns and fails with
//! `BrokenArchive` when a required column is missing.

use serde::{Deserialize, Serialize};

/// Every persistable device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Bus,
    Branch,
    HvdcLine,
    Vsc,
    Generator,
    Battery,
    Load,
    StaticGen,
    Shunt,
    ExternalGrid,
    ContingencyGroup,
}

impl DeviceKind {
    /// Table name used inside the archive container.
    pub fn table_name(&self) -> &'static str {
        match self {
            DeviceKind::Bus => "bus",
            DeviceKind::Branch => "branch",
            DeviceKind::HvdcLine => "hvdc",
            DeviceKind::Vsc => "vsc",
            DeviceKind::Generator => "generator",
            DeviceKind::Battery => "battery",
            DeviceKind::Load => "load",
            DeviceKind::StaticGen => "static_gen",
            DeviceKind::Shunt => "shunt",
            DeviceKind::ExternalGrid => "external_grid",
            DeviceKind::ContingencyGroup => "contingency_group",
        }
    }

    /// All kinds, in archive order.
    pub fn all() -> &'static [DeviceKind] {
        &[
            DeviceKind::Bus,
            DeviceKind::Branch,
            DeviceKind::HvdcLine,
            DeviceKind::Vsc,
            DeviceKind::Generator,
            DeviceKind::Battery,
            DeviceKind::Load,
            DeviceKind::StaticGen,
            DeviceKind::Shunt,
            DeviceKind::ExternalGrid,
            DeviceKind::ContingencyGroup,
        ]
    }
}

/// Column data type, used to validate parsed cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Int,
    Float,
    Bool,
    Text,
}

/// One registered column of a device table.
#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub name: &'static str,
    pub ty: PropertyType,
    pub required: bool,
}

const fn req(name: &'static str, ty: PropertyType) -> PropertySpec {
    PropertySpec {
        name,
        ty,
        required: true,
    }
}

const fn opt(name: &'static str, ty: PropertyType) -> PropertySpec {
    PropertySpec {
        name,
        ty,
        required: false,
    }
}

use PropertyType::{Bool, Float, Int, Text};

static BUS_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("vnom_kv", Float),
    opt("vmin_pu", Float),
    opt("vmax_pu", Float),
    req("is_slack", Bool),
    req("active", Bool),
    opt("area_id", Int),
    opt("zone_id", Int),
];

static BRANCH_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("kind", Text),
    req("bus_from", Int),
    req("bus_to", Int),
    req("r_pu", Float),
    req("x_pu", Float),
    opt("b_pu", Float),
    opt("rate_mva", Float),
    opt("contingency_rate_mva", Float),
    opt("tap_module", Float),
    opt("tap_phase_rad", Float),
    opt("monitor_loading", Bool),
    req("active", Bool),
    opt("mttf_h", Float),
    opt("mttr_h", Float),
];

static HVDC_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus_from", Int),
    req("bus_to", Int),
    req("p_set_mw", Float),
    opt("loss_factor", Float),
    opt("rate_mva", Float),
    opt("control_mode", Text),
    req("active", Bool),
];

static VSC_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus_from", Int),
    req("bus_to", Int),
    req("control_dc", Text),
    req("control_dc_set", Float),
    req("control_ac", Text),
    req("control_ac_set", Float),
    opt("rate_mva", Float),
    req("active", Bool),
];

static GEN_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("p_mw", Float),
    opt("vset_pu", Float),
    opt("snom_mva", Float),
    opt("qmin_mvar", Float),
    opt("qmax_mvar", Float),
    opt("pmin_mw", Float),
    opt("pmax_mw", Float),
    opt("cost", Float),
    opt("dispatchable", Bool),
    opt("srap_enabled", Bool),
    req("active", Bool),
    opt("mttf_h", Float),
    opt("mttr_h", Float),
];

static BATTERY_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("p_mw", Float),
    opt("vset_pu", Float),
    opt("snom_mva", Float),
    opt("qmin_mvar", Float),
    opt("qmax_mvar", Float),
    opt("pmin_mw", Float),
    opt("pmax_mw", Float),
    req("enom_mwh", Float),
    opt("soc0", Float),
    opt("soc_min", Float),
    opt("eff_charge", Float),
    opt("eff_discharge", Float),
    opt("cost", Float),
    req("active", Bool),
    opt("mttf_h", Float),
    opt("mttr_h", Float),
];

static LOAD_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("p_mw", Float),
    req("q_mvar", Float),
    req("active", Bool),
    opt("mttf_h", Float),
    opt("mttr_h", Float),
    opt("connection", Text),
    opt("model", Text),
];

static STATIC_GEN_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("p_mw", Float),
    req("q_mvar", Float),
    req("active", Bool),
];

static SHUNT_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("g_mw", Float),
    req("b_mvar", Float),
    req("active", Bool),
];

static EXTERNAL_GRID_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("bus", Int),
    req("mode", Text),
    opt("vset_pu", Float),
    opt("p_mw", Float),
    opt("q_mvar", Float),
    req("active", Bool),
];

static CONTINGENCY_GROUP_PROPS: &[PropertySpec] = &[
    req("id", Int),
    req("uid", Int),
    req("name", Text),
    req("device_uid", Int),
    req("action", Text),
    opt("value", Float),
];

/// Registered columns for a device kind.
pub fn registered_properties(kind: DeviceKind) -> &'static [PropertySpec] {
    match kind {
        DeviceKind::Bus => BUS_PROPS,
        DeviceKind::Branch => BRANCH_PROPS,
        DeviceKind::HvdcLine => HVDC_PROPS,
        DeviceKind::Vsc => VSC_PROPS,
        DeviceKind::Generator => GEN_PROPS,
        DeviceKind::Battery => BATTERY_PROPS,
        DeviceKind::Load => LOAD_PROPS,
        DeviceKind::StaticGen => STATIC_GEN_PROPS,
        DeviceKind::Shunt => SHUNT_PROPS,
        DeviceKind::ExternalGrid => EXTERNAL_GRID_PROPS,
        DeviceKind::ContingencyGroup => CONTINGENCY_GROUP_PROPS,
    }
}

/// Names of the required columns for a device kind.
pub fn required_columns(kind: DeviceKind) -> Vec<&'static str> {
    registered_properties(kind)
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_uid_and_name() {
        for &kind in DeviceKind::all() {
            let props = registered_properties(kind);
            assert!(props.iter().any(|p| p.name == "uid" && p.required));
            assert!(props.iter().any(|p| p.name == "name"));
        }
    }

    #[test]
    fn test_required_subset() {
        let req = required_columns(DeviceKind::Branch);
        assert!(req.contains(&"bus_from"));
        assert!(req.contains(&"x_pu"));
        assert!(!req.contains(&"mttf_h"));
    }
}
