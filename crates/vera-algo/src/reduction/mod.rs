//! Grid reduction: replace an external bus set by a boundary equivalent.
//!
//! Both reductions operate in place on a caller-owned grid copy and share
//! the bus-set partition: external `E` (to delete), boundary `B` (retained,
//! adjacent to `E`), internal `I` (retained, not adjacent to `E`).

pub mod ptdf;
pub mod ward;

pub use ptdf::ptdf_reduction;
pub use ward::ward_standard_reduction;

use crate::compiler::NumericalCircuit;
use std::collections::BTreeSet;

/// Bus-set partition for a reduction.
#[derive(Debug, Clone)]
pub struct ReductionSets {
    pub external: Vec<usize>,
    pub boundary: Vec<usize>,
    pub internal: Vec<usize>,
    /// Branches linking `E` and `B`
    pub boundary_branches: Vec<usize>,
}

/// Classify buses and branches for the external set `reduction_bus_indices`.
pub fn get_reduction_sets(
    nc: &NumericalCircuit,
    reduction_bus_indices: &[usize],
) -> ReductionSets {
    let external: BTreeSet<usize> = reduction_bus_indices.iter().copied().collect();
    let mut boundary: BTreeSet<usize> = BTreeSet::new();
    let mut internal: BTreeSet<usize> = BTreeSet::new();
    let mut boundary_branches = Vec::new();

    let br = &nc.passive_branch_data;
    for k in 0..br.len() {
        let f = br.f[k];
        let t = br.t[k];
        match (external.contains(&f), external.contains(&t)) {
            (true, true) => {} // fully external
            (true, false) => {
                boundary.insert(t);
                boundary_branches.push(k);
            }
            (false, true) => {
                boundary.insert(f);
                boundary_branches.push(k);
            }
            (false, false) => {
                internal.insert(f);
                internal.insert(t);
            }
        }
    }

    // a bus cannot be both boundary and internal
    for b in &boundary {
        internal.remove(b);
    }

    ReductionSets {
        external: external.into_iter().collect(),
        boundary: boundary.into_iter().collect(),
        internal: internal.into_iter().collect(),
        boundary_branches,
    }
}
