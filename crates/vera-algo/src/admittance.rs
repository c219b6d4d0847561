//! Nodal admittance assembly.
//!
//! For every active branch on the system base:
//! ```text
//!   ys  = 1 / (r + jx)          series admittance
//!   bc  = b / 2                 half charging susceptance
//!   τ   = m · e^{jθ}            complex tap
//!   yff = (ys + j·bc) / (m²)    yft = −ys / conj(τ)
//!   ytf = −ys / τ               ytt =  ys + j·bc
//! ```
//! and `Yf = diag(yff)·Cf + diag(yft)·Ct`, `Yt = diag(ytf)·Cf + diag(ytt)·Ct`,
//! `Ybus = Cfᵀ·Yf + Ctᵀ·Yt + diag(Ysh)`. `Ybus` is symmetric exactly when
//! no phase shifter is present; any asymmetry is a phase-shift signature.

use crate::compiler::NumericalCircuit;
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

/// Assembled admittance matrices plus the branch primitive vectors.
#[derive(Debug, Clone)]
pub struct AdmittanceMatrices {
    /// Nodal admittance (nbus × nbus, CSR)
    pub ybus: CsMat<Complex64>,
    /// From-side branch admittance (nbr × nbus, CSR)
    pub yf: CsMat<Complex64>,
    /// To-side branch admittance (nbr × nbus, CSR)
    pub yt: CsMat<Complex64>,
    pub yff: Vec<Complex64>,
    pub yft: Vec<Complex64>,
    pub ytf: Vec<Complex64>,
    pub ytt: Vec<Complex64>,
    /// Shunt admittance per bus (p.u.)
    pub yshunt: Vec<Complex64>,
}

impl AdmittanceMatrices {
    /// Maximum asymmetry `|Y[i,j] − Y[j,i]|`; nonzero flags phase shifters.
    pub fn max_asymmetry(&self) -> f64 {
        let mut max = 0.0f64;
        for (v, (i, j)) in self.ybus.iter() {
            let vt = self
                .ybus
                .get(j, i)
                .copied()
                .unwrap_or(Complex64::new(0.0, 0.0));
            max = max.max((*v - vt).norm());
        }
        max
    }
}

/// Build the admittance matrices of a compiled circuit. Inactive branches
/// and buses contribute nothing; shunt devices land on the diagonal.
pub fn build_admittances(nc: &NumericalCircuit) -> AdmittanceMatrices {
    let nbus = nc.nbus();
    let nbr = nc.nbr();
    let br = &nc.passive_branch_data;

    let zero = Complex64::new(0.0, 0.0);
    let mut yff = vec![zero; nbr];
    let mut yft = vec![zero; nbr];
    let mut ytf = vec![zero; nbr];
    let mut ytt = vec![zero; nbr];

    let mut yf_tri = TriMat::new((nbr, nbus));
    let mut yt_tri = TriMat::new((nbr, nbus));
    let mut ybus_tri = TriMat::new((nbus, nbus));

    for k in 0..nbr {
        let f = br.f[k];
        let t = br.t[k];
        if !br.active[k] || !nc.bus_data.active[f] || !nc.bus_data.active[t] {
            continue;
        }
        let z = Complex64::new(br.r[k], br.x[k]);
        if z.norm_sqr() < 1e-24 {
            continue; // ideal switch handled by topology processing
        }
        let ys = z.inv();
        let bc = Complex64::new(0.0, br.b[k] / 2.0);
        let m = br.tap_module[k];
        let tap = Complex64::from_polar(m, br.tap_phase[k]);

        yff[k] = (ys + bc) / (m * m);
        yft[k] = -ys / tap.conj();
        ytf[k] = -ys / tap;
        ytt[k] = ys + bc;

        yf_tri.add_triplet(k, f, yff[k]);
        yf_tri.add_triplet(k, t, yft[k]);
        yt_tri.add_triplet(k, f, ytf[k]);
        yt_tri.add_triplet(k, t, ytt[k]);

        ybus_tri.add_triplet(f, f, yff[k]);
        ybus_tri.add_triplet(f, t, yft[k]);
        ybus_tri.add_triplet(t, f, ytf[k]);
        ybus_tri.add_triplet(t, t, ytt[k]);
    }

    // shunt devices: g + jb in MW/Mvar at 1 p.u. -> p.u. admittance
    let mut yshunt = vec![zero; nbus];
    let sh = &nc.shunt_data;
    for i in 0..sh.len() {
        if sh.active[i] && nc.bus_data.active[sh.bus[i]] {
            yshunt[sh.bus[i]] += Complex64::new(sh.g[i] / nc.sbase, sh.b[i] / nc.sbase);
        }
    }
    for (i, ysh) in yshunt.iter().enumerate() {
        if ysh.norm_sqr() > 0.0 {
            ybus_tri.add_triplet(i, i, *ysh);
        }
    }

    AdmittanceMatrices {
        ybus: ybus_tri.to_csr(),
        yf: yf_tri.to_csr(),
        yt: yt_tri.to_csr(),
        yff,
        yft,
        ytf,
        ytt,
        yshunt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_numerical_circuit_at;
    use vera_core::{Branch, Bus, Gen, Load, MultiCircuit, Shunt};

    fn small_grid(tap_phase: f64) -> NumericalCircuit {
        let mut grid = MultiCircuit::new("adm");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        let b1 = grid.add_bus(Bus::new("B1", 132.0));
        let b2 = grid.add_bus(Bus::new("B2", 132.0));
        grid.add_branch(
            Branch::line("L01", b0, b1, 0.01, 0.1)
                .with_charging(0.02)
                .with_rating(100.0),
        );
        grid.add_branch(
            Branch::line("L12", b1, b2, 0.02, 0.2)
                .with_taps(1.05, tap_phase)
                .with_rating(100.0),
        );
        grid.add_generator(b0, Gen::new("G", 10.0));
        grid.add_load(b2, Load::new("Ld", 10.0, 2.0));
        compile_numerical_circuit_at(&grid, None).unwrap()
    }

    #[test]
    fn test_ybus_symmetric_without_phase_shift() {
        let nc = small_grid(0.0);
        let adm = build_admittances(&nc);
        assert!(adm.max_asymmetry() < 1e-12);
    }

    #[test]
    fn test_phase_shift_breaks_symmetry() {
        let nc = small_grid(0.1);
        let adm = build_admittances(&nc);
        assert!(adm.max_asymmetry() > 1e-6);
    }

    #[test]
    fn test_row_sums_equal_charging_plus_shunt() {
        // with no shunts and no charging, Ybus rows sum to ~0
        let mut grid = MultiCircuit::new("rows");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        let b1 = grid.add_bus(Bus::new("B1", 132.0));
        grid.add_branch(Branch::line("L", b0, b1, 0.01, 0.1));
        grid.add_generator(b0, Gen::new("G", 1.0));
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let adm = build_admittances(&nc);

        let mut row_sums = vec![Complex64::new(0.0, 0.0); 2];
        for (v, (i, _)) in adm.ybus.iter() {
            row_sums[i] += *v;
        }
        for rs in row_sums {
            assert!(rs.norm() < 1e-12);
        }
    }

    #[test]
    fn test_shunt_on_diagonal() {
        let mut grid = MultiCircuit::new("shunt");
        let b0 = grid.add_bus(Bus::new("B0", 132.0).as_slack());
        let b1 = grid.add_bus(Bus::new("B1", 132.0));
        grid.add_branch(Branch::line("L", b0, b1, 0.0, 0.1));
        grid.add_generator(b0, Gen::new("G", 1.0));
        grid.add_shunt(b1, Shunt::new("C", 0.0, 30.0)); // 30 Mvar cap
        let nc = compile_numerical_circuit_at(&grid, None).unwrap();
        let adm = build_admittances(&nc);

        // diagonal at bus1 = ys + j*0.3
        let y11 = adm.ybus.get(1, 1).copied().unwrap();
        let ys = Complex64::new(0.0, 0.1).inv();
        assert!((y11 - (ys + Complex64::new(0.0, 0.3))).norm() < 1e-12);
    }

    #[test]
    fn test_inactive_branch_excluded() {
        let mut nc = small_grid(0.0);
        nc.passive_branch_data.active[1] = false;
        let adm = build_admittances(&nc);
        assert_eq!(adm.yff[1], Complex64::new(0.0, 0.0));
        assert!(adm.ybus.get(1, 2).is_none() || adm.ybus.get(1, 2).unwrap().norm() < 1e-15);
    }
}
