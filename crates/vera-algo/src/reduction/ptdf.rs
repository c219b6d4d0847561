//! PTDF-based reduction: mirror external injections onto the boundary.
//!
//! Every external injection `d` at bus `i` is replicated at each boundary
//! bus `b` reachable through an attachment branch `k`, scaled by
//! `PTDF[k, i]`; entries below the threshold are skipped. The mirrored
//! devices keep their kind, so the reduced grid still distinguishes
//! generators from loads (and protection-response generators keep their
//! flag through a separate aggregate). The external buses are then deleted.

use super::get_reduction_sets;
use crate::compiler::compile_numerical_circuit_at;
use crate::linear::LinearAnalysis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vera_core::{
    BusId, Gen, Load, Logger, MultiCircuit, StaticGen, VgResult,
};

/// PTDF-reduction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtdfReductionOptions {
    /// Skip mirrored devices with `|PTDF| < threshold`
    pub ptdf_threshold: f64,
    /// Collapse the mirrored devices of each boundary bus into per-kind
    /// aggregates
    pub aggregate_devices: bool,
}

impl Default for PtdfReductionOptions {
    fn default() -> Self {
        Self {
            ptdf_threshold: 1e-5,
            aggregate_devices: false,
        }
    }
}

struct MirroredTotals {
    gen_p: f64,
    gen_srap_p: f64,
    load_p: f64,
    load_q: f64,
    static_p: f64,
    static_q: f64,
}

impl MirroredTotals {
    fn zero() -> Self {
        Self {
            gen_p: 0.0,
            gen_srap_p: 0.0,
            load_p: 0.0,
            load_q: 0.0,
            static_p: 0.0,
            static_q: 0.0,
        }
    }
}

/// Reduce `grid` in place: mirror every external injection to the boundary
/// through the PTDF rows of its attachment branches, then delete the
/// external buses. `lin` must be computed over the full compiled circuit so
/// its rows/columns follow the grid's branch/bus indexing.
pub fn ptdf_reduction(
    grid: &mut MultiCircuit,
    reduction_bus_indices: &[usize],
    lin: &LinearAnalysis,
    options: &PtdfReductionOptions,
    logger: &mut Logger,
) -> VgResult<()> {
    let nc = compile_numerical_circuit_at(grid, None)?;
    let sets = get_reduction_sets(&nc, reduction_bus_indices);

    if sets.external.is_empty() {
        logger.add_info("nothing to reduce");
        return Ok(());
    }
    if sets.boundary.is_empty() {
        logger.add_info("external set has no boundary, reduction skipped");
        return Ok(());
    }

    let is_external: Vec<bool> = {
        let mut v = vec![false; nc.nbus()];
        for &e in &sets.external {
            v[e] = true;
        }
        v
    };

    // boundary bus -> its attachment branches, each with the orientation
    // factor that makes the PTDF value read "flow leaving the external set"
    let mut attachments: HashMap<usize, Vec<(usize, f64)>> = HashMap::new();
    for &k in &sets.boundary_branches {
        let f = nc.passive_branch_data.f[k];
        let t = nc.passive_branch_data.t[k];
        let (b, orient) = if is_external[f] { (t, 1.0) } else { (f, -1.0) };
        attachments.entry(b).or_default().push((k, orient));
    }

    let boundary_ids: Vec<BusId> = sets.boundary.iter().map(|&i| grid.buses[i].id).collect();
    let mut totals: HashMap<usize, MirroredTotals> = HashMap::new();
    let mut mirrored_devices = 0usize;

    // collect the mirrored images first, mutate the grid afterwards
    struct Mirror {
        boundary_pos: usize,
        kind: MirrorKind,
        name: String,
        p: f64,
        q: f64,
        srap: bool,
    }
    enum MirrorKind {
        Gen,
        Load,
        Static,
    }
    let mut mirrors: Vec<Mirror> = Vec::new();

    for (bpos, &b) in sets.boundary.iter().enumerate() {
        let Some(branches) = attachments.get(&b) else {
            continue;
        };
        let tot = totals.entry(bpos).or_insert_with(MirroredTotals::zero);

        for &(k, orient) in branches {
            for (gi, g) in grid.generators.iter().enumerate() {
                let bus_idx = g.bus.value();
                if !is_external[bus_idx] || !g.active {
                    continue;
                }
                let ptdf_val = orient * lin.ptdf[k][bus_idx];
                if ptdf_val.abs() < options.ptdf_threshold {
                    continue;
                }
                let p = ptdf_val * g.p.value();
                if g.srap_enabled {
                    tot.gen_srap_p += p;
                } else {
                    tot.gen_p += p;
                }
                mirrors.push(Mirror {
                    boundary_pos: bpos,
                    kind: MirrorKind::Gen,
                    name: format!("red_gen_{gi}_{}", grid.buses[b].name),
                    p,
                    q: 0.0,
                    srap: g.srap_enabled,
                });
                mirrored_devices += 1;
            }

            for (li, l) in grid.loads.iter().enumerate() {
                let bus_idx = l.bus.value();
                if !is_external[bus_idx] || !l.active {
                    continue;
                }
                let ptdf_val = orient * lin.ptdf[k][bus_idx];
                if ptdf_val.abs() < options.ptdf_threshold {
                    continue;
                }
                let p = ptdf_val * l.p.value();
                let q = ptdf_val * l.q.value();
                tot.load_p += p;
                tot.load_q += q;
                mirrors.push(Mirror {
                    boundary_pos: bpos,
                    kind: MirrorKind::Load,
                    name: format!("red_load_{li}_{}", grid.buses[b].name),
                    p,
                    q,
                    srap: false,
                });
                mirrored_devices += 1;
            }

            for (si, s) in grid.static_gens.iter().enumerate() {
                let bus_idx = s.bus.value();
                if !is_external[bus_idx] || !s.active {
                    continue;
                }
                let ptdf_val = orient * lin.ptdf[k][bus_idx];
                if ptdf_val.abs() < options.ptdf_threshold {
                    continue;
                }
                tot.static_p += ptdf_val * s.p.value();
                tot.static_q += ptdf_val * s.q.value();
                mirrors.push(Mirror {
                    boundary_pos: bpos,
                    kind: MirrorKind::Static,
                    name: format!("red_sgen_{si}_{}", grid.buses[b].name),
                    p: ptdf_val * s.p.value(),
                    q: ptdf_val * s.q.value(),
                    srap: false,
                });
                mirrored_devices += 1;
            }

            // batteries are mirrored as static images of their set point
            for (bi, bat) in grid.batteries.iter().enumerate() {
                let bus_idx = bat.bus.value();
                if !is_external[bus_idx] || !bat.active {
                    continue;
                }
                let ptdf_val = orient * lin.ptdf[k][bus_idx];
                if ptdf_val.abs() < options.ptdf_threshold {
                    continue;
                }
                tot.static_p += ptdf_val * bat.p.value();
                mirrors.push(Mirror {
                    boundary_pos: bpos,
                    kind: MirrorKind::Static,
                    name: format!("red_batt_{bi}_{}", grid.buses[b].name),
                    p: ptdf_val * bat.p.value(),
                    q: 0.0,
                    srap: false,
                });
                mirrored_devices += 1;
            }
        }
    }

    if options.aggregate_devices {
        for (bpos, tot) in &totals {
            let bus_id = boundary_ids[*bpos];
            let bus_name = grid.buses[sets.boundary[*bpos]].name.clone();
            if tot.gen_p != 0.0 {
                grid.add_generator(
                    bus_id,
                    Gen::new(format!("red_eq_gen_{bus_name}"), tot.gen_p),
                );
            }
            if tot.gen_srap_p != 0.0 {
                // protection-enabled image kept apart so the flag survives
                grid.add_generator(
                    bus_id,
                    Gen::new(format!("red_eq_gen_srap_{bus_name}"), tot.gen_srap_p)
                        .with_srap(true),
                );
            }
            if tot.load_p != 0.0 || tot.load_q != 0.0 {
                grid.add_load(
                    bus_id,
                    Load::new(format!("red_eq_load_{bus_name}"), tot.load_p, tot.load_q),
                );
            }
            if tot.static_p != 0.0 || tot.static_q != 0.0 {
                grid.add_static_gen(
                    bus_id,
                    StaticGen::new(
                        format!("red_eq_sgen_{bus_name}"),
                        tot.static_p,
                        tot.static_q,
                    ),
                );
            }
        }
    } else {
        for m in mirrors {
            let bus_id = boundary_ids[m.boundary_pos];
            match m.kind {
                MirrorKind::Gen => {
                    grid.add_generator(bus_id, Gen::new(m.name, m.p).with_srap(m.srap));
                }
                MirrorKind::Load => {
                    grid.add_load(bus_id, Load::new(m.name, m.p, m.q));
                }
                MirrorKind::Static => {
                    grid.add_static_gen(bus_id, StaticGen::new(m.name, m.p, m.q));
                }
            }
        }
    }

    logger.add_info(format!(
        "mirrored {mirrored_devices} external injection(s) onto {} boundary bus(es)",
        sets.boundary.len()
    ));

    let external_ids: Vec<BusId> = sets.external.iter().map(|&i| grid.buses[i].id).collect();
    for id in external_ids {
        grid.delete_bus(id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearAnalysisOptions;
    use vera_core::{Branch, Bus};

    fn chain_grid() -> MultiCircuit {
        let mut grid = MultiCircuit::new("ptdf-red");
        let b: Vec<_> = (0..4)
            .map(|i| {
                let mut bus = Bus::new(format!("B{i}"), 132.0);
                if i == 0 {
                    bus = bus.as_slack();
                }
                grid.add_bus(bus)
            })
            .collect();
        grid.add_branch(Branch::line("L01", b[0], b[1], 0.0, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L12", b[1], b[2], 0.0, 0.1).with_rating(100.0));
        grid.add_branch(Branch::line("L23", b[2], b[3], 0.0, 0.1).with_rating(100.0));
        grid.add_generator(b[0], Gen::new("G0", 0.0));
        grid.add_load(b[1], Load::new("Ld1", 20.0, 4.0));
        grid.add_load(b[3], Load::new("Ld3", 30.0, 6.0));
        grid.add_generator(b[3], Gen::new("G3", 12.0).with_srap(true));
        grid
    }

    fn linear_of(grid: &MultiCircuit) -> LinearAnalysis {
        let nc = compile_numerical_circuit_at(grid, None).unwrap();
        let mut log = Logger::new();
        let island = nc.split_into_islands(true, &mut log).remove(0);
        LinearAnalysis::new(&island, &LinearAnalysisOptions::default(), &mut log).unwrap()
    }

    #[test]
    fn test_mirrors_external_injections() {
        let mut grid = chain_grid();
        let lin = linear_of(&grid);
        let mut log = Logger::new();
        ptdf_reduction(
            &mut grid,
            &[3],
            &lin,
            &PtdfReductionOptions::default(),
            &mut log,
        )
        .unwrap();

        // bus 3 is gone; mirrored devices landed on the boundary (B2)
        assert_eq!(grid.bus_count(), 3);
        assert!(grid.loads.iter().any(|l| l.name.starts_with("red_load")));
        assert!(grid
            .generators
            .iter()
            .any(|g| g.name.starts_with("red_gen") && g.srap_enabled));
        // net mirrored load P equals the chain PTDF (=1) times the demand
        let mirrored_p: f64 = grid
            .loads
            .iter()
            .filter(|l| l.name.starts_with("red_load"))
            .map(|l| l.p.value())
            .sum();
        assert!((mirrored_p - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_aggregation_collapses_devices() {
        let mut grid = chain_grid();
        // a second external load so aggregation has something to merge
        let b3 = grid.buses[3].id;
        grid.add_load(b3, Load::new("Ld3b", 5.0, 1.0));

        let lin = linear_of(&grid);
        let mut log = Logger::new();
        ptdf_reduction(
            &mut grid,
            &[3],
            &lin,
            &PtdfReductionOptions {
                aggregate_devices: true,
                ..Default::default()
            },
            &mut log,
        )
        .unwrap();

        let eq_loads: Vec<_> = grid
            .loads
            .iter()
            .filter(|l| l.name.starts_with("red_eq_load"))
            .collect();
        assert_eq!(eq_loads.len(), 1);
        assert!((eq_loads[0].p.value() - 35.0).abs() < 1e-6);
        // protection-flagged image stays separate from the plain aggregate
        assert!(grid
            .generators
            .iter()
            .any(|g| g.name.starts_with("red_eq_gen_srap") && g.srap_enabled));
    }

    #[test]
    fn test_threshold_skips_weak_couplings() {
        let mut grid = chain_grid();
        let lin = linear_of(&grid);
        let mut log = Logger::new();
        ptdf_reduction(
            &mut grid,
            &[3],
            &lin,
            &PtdfReductionOptions {
                ptdf_threshold: 2.0, // nothing passes
                ..Default::default()
            },
            &mut log,
        )
        .unwrap();
        assert!(!grid.loads.iter().any(|l| l.name.starts_with("red_")));
    }
}
