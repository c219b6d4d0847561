//! Cross-module scenarios: one grid pushed through compilation, power flow,
//! sensitivity factors, contingency analysis and reduction.

use num_complex::Complex64;
use vera_algo::{
    compile_numerical_circuit_at, linear_contingency_scan, ward_standard_reduction, BusType,
    ContingencyAnalysisDriver, ContingencyAnalysisOptions, ContingencyMethod, LinearAnalysis,
    LinearAnalysisOptions, PowerFlowDriver, PowerFlowOptions,
};
use vera_core::{Branch, Bus, ContingencyGroup, Gen, Load, Logger, MultiCircuit};

/// Meshed 10-bus ring with a spur, two machines, distributed demand.
fn build_grid() -> MultiCircuit {
    let mut grid = MultiCircuit::new("ring10");
    let b: Vec<_> = (0..10)
        .map(|i| {
            let mut bus = Bus::new(format!("B{i}"), 220.0);
            if i == 0 {
                bus = bus.as_slack();
            }
            grid.add_bus(bus)
        })
        .collect();
    for i in 0..10 {
        let j = (i + 1) % 10;
        grid.add_branch(
            Branch::line(format!("L{i}-{j}"), b[i], b[j], 0.005, 0.05)
                .with_charging(0.01)
                .with_rating(120.0)
                .with_contingency_rating(140.0),
        );
    }
    // a chord strengthening the mesh
    grid.add_branch(
        Branch::line("L0-5", b[0], b[5], 0.008, 0.08)
            .with_rating(120.0)
            .with_contingency_rating(140.0),
    );
    grid.add_generator(b[0], Gen::new("G0", 0.0).with_vset(1.02).with_snom(300.0));
    grid.add_generator(
        b[6],
        Gen::new("G6", 60.0)
            .with_vset(1.01)
            .with_snom(120.0)
            .with_q_limits(-60.0, 80.0),
    );
    for (bus, p) in [(2usize, 40.0), (4, 55.0), (5, 30.0), (8, 45.0)] {
        grid.add_load(b[bus], Load::new(format!("Ld{bus}"), p, p * 0.2));
    }
    grid
}

#[test]
fn slack_identification_per_island() {
    let grid = build_grid();
    let nc = compile_numerical_circuit_at(&grid, None).unwrap();
    let mut log = Logger::new();
    let islands = nc.split_into_islands(true, &mut log);
    for island in &islands {
        let n_slack = island
            .bus_data
            .bus_types
            .iter()
            .filter(|&&t| t == BusType::Slack)
            .count();
        assert_eq!(n_slack, 1);
    }
}

#[test]
fn newton_power_balance() {
    let grid = build_grid();
    let mut driver = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
    driver.run().unwrap();
    let res = driver.results.unwrap();
    assert!(res.converged, "{}", driver.harness.logger);
    assert!(res.iterations <= 10);

    // |Σ Sbus − Σ losses| below 1e-4 of the base power
    assert!(
        res.power_balance_residual() < 1e-4 * grid.sbase,
        "residual = {}",
        res.power_balance_residual()
    );

    // voltages within the declared band
    for (i, v) in res.voltage.iter().enumerate() {
        let vm = v.norm();
        assert!(vm > 0.9 && vm < 1.1, "bus {i}: |V| = {vm}");
    }
}

#[test]
fn q_limited_machine_loses_its_setpoint() {
    let mut grid = build_grid();
    // G6 cannot possibly hold 1.01 pu with a 3 Mvar ceiling
    grid.generators[1].qmax = vera_core::Megavars(3.0);
    let mut driver = PowerFlowDriver::new(
        &grid,
        PowerFlowOptions::default().with_q_control(true),
    );
    driver.run().unwrap();
    let res = driver.results.unwrap();
    assert!(res.converged);
    let vm6 = res.voltage[6].norm();
    assert!(vm6 < 1.01, "bus 6 kept its set point at {vm6}");
    assert_eq!(res.bus_types[6], BusType::PQ);
}

#[test]
fn linear_identity_on_ring_outage() {
    let grid = build_grid();
    let nc = compile_numerical_circuit_at(&grid, None).unwrap();
    let mut log = Logger::new();
    let island = nc.split_into_islands(true, &mut log).remove(0);
    let lin = LinearAnalysis::new(&island, &LinearAnalysisOptions::default(), &mut log).unwrap();

    // LODF diagonal
    for c in 0..island.nbr() {
        assert_eq!(lin.lodf[c][c], -1.0);
    }

    let p = island.real_power_injections();
    let mon: Vec<usize> = (0..island.nbr()).collect();
    let con: Vec<usize> = (0..island.nbr()).collect();
    let scan = linear_contingency_scan(&island, &lin, &p, &mon, &con);

    let sf0 = lin.get_flows(&p, &island);
    for (ci, &c) in con.iter().enumerate() {
        for &m in &mon {
            if m == c {
                continue;
            }
            let expected = sf0[m] + lin.lodf[m][c] * sf0[c];
            assert!((scan.flows[ci][m] - expected).abs() < 1e-9);
        }
    }
}

#[test]
fn contingency_driver_restores_state() {
    let mut grid = build_grid();
    for k in 0..grid.branch_count() {
        let uid = grid.branches[k].uid;
        grid.add_contingency_group(ContingencyGroup::branch_outage(format!("N-1 #{k}"), uid));
    }
    let nc_before = compile_numerical_circuit_at(&grid, None).unwrap();
    let snapshot_active = nc_before.passive_branch_data.active.clone();

    let mut driver = ContingencyAnalysisDriver::new(
        &grid,
        ContingencyAnalysisOptions {
            method: ContingencyMethod::Linear,
            ..Default::default()
        },
    );
    driver.run().unwrap();
    let res = driver.results.unwrap();
    assert_eq!(res.con_uids.len(), grid.contingency_groups.len());

    // the grid and a fresh compilation are untouched
    let nc_after = compile_numerical_circuit_at(&grid, None).unwrap();
    assert_eq!(nc_after.passive_branch_data.active, snapshot_active);
}

#[test]
fn ward_reduction_preserves_retained_flows() {
    let grid0 = build_grid();
    let mut pre = PowerFlowDriver::new(&grid0, PowerFlowOptions::default());
    pre.run().unwrap();
    let pre_res = pre.results.unwrap();
    assert!(pre_res.converged);

    // reduce the two least-loaded buses far from the machines
    let mut grid = grid0.clone();
    let mut logger = Logger::new();
    ward_standard_reduction(&mut grid, &[3, 9], &pre_res.voltage, &mut logger).unwrap();
    assert_eq!(grid.bus_count(), 8);

    let mut post = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
    post.run().unwrap();
    let post_res = post.results.unwrap();
    assert!(post_res.converged, "{}", post.harness.logger);

    // compare a deep-internal branch by name across the two grids
    let pre_idx = grid0
        .branches
        .iter()
        .position(|br| br.name == "L5-6")
        .unwrap();
    let post_idx = grid
        .branches
        .iter()
        .position(|br| br.name == "L5-6")
        .unwrap();
    let pf_pre = pre_res.sf[pre_idx].re;
    let pf_post = post_res.sf[post_idx].re;
    assert!(
        (pf_post - pf_pre).abs() < 0.005 * pf_pre.abs().max(1.0),
        "L5-6: {pf_pre} -> {pf_post}"
    );
}

#[test]
fn dc_and_ac_agree_on_light_load() {
    // at light loading the DC angles track the AC ones closely
    let mut grid = MultiCircuit::new("light");
    let b1 = grid.add_bus(Bus::new("B1", 220.0).as_slack());
    let b2 = grid.add_bus(Bus::new("B2", 220.0));
    grid.add_branch(Branch::line("L", b1, b2, 0.0, 0.1).with_rating(100.0));
    grid.add_generator(b1, Gen::new("G", 0.0));
    grid.add_load(b2, Load::new("Ld", 5.0, 0.0));

    let mut ac = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
    ac.run().unwrap();
    let mut dc = PowerFlowDriver::new(
        &grid,
        PowerFlowOptions::default().with_solver(vera_algo::SolverType::Linear),
    );
    dc.run().unwrap();

    let va_ac = ac.results.unwrap().voltage[1].arg();
    let va_dc = dc.results.unwrap().voltage[1].arg();
    assert!((va_ac - va_dc).abs() < 1e-3);
}

#[test]
fn phase_shifter_breaks_ybus_symmetry() {
    let mut grid = build_grid();
    grid.branches[0].tap_phase = vera_core::Radians(0.05);
    let nc = compile_numerical_circuit_at(&grid, None).unwrap();
    let adm = vera_algo::build_admittances(&nc);
    assert!(adm.max_asymmetry() > 1e-6);

    grid.branches[0].tap_phase = vera_core::Radians(0.0);
    let nc = compile_numerical_circuit_at(&grid, None).unwrap();
    let adm = vera_algo::build_admittances(&nc);
    assert!(adm.max_asymmetry() < 1e-12);
}

#[test]
fn islanded_spur_solves_remaining_grid() {
    let mut grid = build_grid();
    // hang a dead-end bus on an inactive branch: it forms a 1-bus island
    let spur = grid.add_bus(Bus::new("spur", 220.0));
    let mut br = Branch::line("L-spur", grid.buses[2].id, spur, 0.01, 0.1);
    br.active = false;
    grid.add_branch(br);

    let mut driver = PowerFlowDriver::new(&grid, PowerFlowOptions::default());
    driver.run().unwrap();
    let res = driver.results.unwrap();
    assert!(res.converged);
    // the isolated bus keeps its default voltage
    let spur_v = res.voltage[spur.value()];
    assert_eq!(spur_v, Complex64::new(1.0, 0.0));
}
