//! Hierarchical DAE blocks.
//!
//! A [`Block`] owns its own variables and equations and a list of child
//! blocks, forming a tree. Flattening performs a depth-first traversal that
//! preserves declaration order and verifies the structural invariants:
//! one state equation per state variable, one algebraic equation per
//! algebraic variable, no duplicate variable uids, and every free variable
//! bound somewhere in the tree.
//!
//! Ports (input/output `Var` references) connect diagram nodes; a connection
//! is a pure variable rename performed with `subs`.

use crate::symbolic::{Expr, Var, VarUid};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vera_core::{VgError, VgResult};

/// One unit of a DAE model.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub name: String,
    /// External variables this block reads.
    pub inputs: Vec<Var>,
    /// Variables this block exposes to other blocks.
    pub outputs: Vec<Var>,
    pub parameters: Vec<Var>,
    pub state_vars: Vec<Var>,
    /// `state_eqs[i]` is dx/dt of `state_vars[i]`.
    pub state_eqs: Vec<Expr>,
    pub algebraic_vars: Vec<Var>,
    /// `algebraic_eqs[i] == 0` defines `algebraic_vars[i]`.
    pub algebraic_eqs: Vec<Expr>,
    pub children: Vec<Block>,
}

/// Flattened system in declaration order.
#[derive(Debug, Clone)]
pub struct FlatSystem {
    pub state_vars: Vec<Var>,
    pub state_eqs: Vec<Expr>,
    pub algebraic_vars: Vec<Var>,
    pub algebraic_eqs: Vec<Expr>,
    pub parameters: Vec<Var>,
}

impl FlatSystem {
    pub fn n_state(&self) -> usize {
        self.state_vars.len()
    }

    pub fn n_alg(&self) -> usize {
        self.algebraic_vars.len()
    }
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a state variable with its derivative equation.
    pub fn add_state(&mut self, var: Var, dxdt: Expr) {
        self.state_vars.push(var);
        self.state_eqs.push(dxdt);
    }

    /// Declare an algebraic variable with its residual equation (= 0).
    pub fn add_algebraic(&mut self, var: Var, residual: Expr) {
        self.algebraic_vars.push(var);
        self.algebraic_eqs.push(residual);
    }

    pub fn add_parameter(&mut self, var: Var) {
        self.parameters.push(var);
    }

    pub fn add_child(&mut self, child: Block) {
        self.children.push(child);
    }

    /// Connect `input` of this block (or a descendant) to `output`: every
    /// occurrence of the input variable is renamed to the output variable.
    pub fn connect(&mut self, input: &Var, output: &Var) {
        let mut map = HashMap::new();
        map.insert(input.uid, Expr::Var(output.clone()));
        self.rename_all(&map);
    }

    fn rename_all(&mut self, map: &HashMap<VarUid, Expr>) {
        for eq in self.state_eqs.iter_mut().chain(self.algebraic_eqs.iter_mut()) {
            *eq = eq.subs(map);
        }
        for child in &mut self.children {
            child.rename_all(map);
        }
    }

    /// Depth-first traversal over this block and every descendant.
    pub fn all_blocks(&self) -> Vec<&Block> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.all_blocks());
        }
        out
    }

    /// Flatten the tree into ordered variable/equation lists, verifying the
    /// block invariants. Any violation fails with `MalformedBlock`.
    pub fn flatten(&self) -> VgResult<FlatSystem> {
        let mut flat = FlatSystem {
            state_vars: Vec::new(),
            state_eqs: Vec::new(),
            algebraic_vars: Vec::new(),
            algebraic_eqs: Vec::new(),
            parameters: Vec::new(),
        };

        let mut bound: HashSet<VarUid> = HashSet::new();
        let mut seen_owned: HashSet<VarUid> = HashSet::new();

        for b in self.all_blocks() {
            if b.state_eqs.len() != b.state_vars.len() {
                return Err(VgError::MalformedBlock(format!(
                    "block '{}': {} state equations for {} state variables",
                    b.name,
                    b.state_eqs.len(),
                    b.state_vars.len()
                )));
            }
            if b.algebraic_eqs.len() != b.algebraic_vars.len() {
                return Err(VgError::MalformedBlock(format!(
                    "block '{}': {} algebraic equations for {} algebraic variables",
                    b.name,
                    b.algebraic_eqs.len(),
                    b.algebraic_vars.len()
                )));
            }

            for v in b.state_vars.iter().chain(b.algebraic_vars.iter()) {
                if !seen_owned.insert(v.uid) {
                    return Err(VgError::MalformedBlock(format!(
                        "duplicate variable '{}' (uid {})",
                        v.name, v.uid
                    )));
                }
            }

            bound.extend(b.state_vars.iter().map(|v| v.uid));
            bound.extend(b.algebraic_vars.iter().map(|v| v.uid));
            bound.extend(b.parameters.iter().map(|v| v.uid));
            bound.extend(b.inputs.iter().map(|v| v.uid));
            bound.extend(b.outputs.iter().map(|v| v.uid));

            flat.state_vars.extend(b.state_vars.iter().cloned());
            flat.state_eqs.extend(b.state_eqs.iter().cloned());
            flat.algebraic_vars.extend(b.algebraic_vars.iter().cloned());
            flat.algebraic_eqs.extend(b.algebraic_eqs.iter().cloned());
            flat.parameters.extend(b.parameters.iter().cloned());
        }

        // every free variable of every equation must be bound somewhere
        let mut free: HashMap<VarUid, Arc<str>> = HashMap::new();
        for eq in flat.state_eqs.iter().chain(flat.algebraic_eqs.iter()) {
            eq.free_vars(&mut free);
        }
        for (uid, name) in &free {
            if !bound.contains(uid) {
                return Err(VgError::MalformedBlock(format!(
                    "free variable '{name}' (uid {uid}) is not a state, algebraic, \
                     parameter or port of any block"
                )));
            }
        }

        Ok(flat)
    }
}

/// Handles to the variables of a [`swing_block`].
#[derive(Debug, Clone)]
pub struct SwingVars {
    pub delta: Var,
    pub omega: Var,
    pub pe: Var,
    pub pm: Var,
}

/// Classic single-machine swing block against a stiff bus:
/// `dδ/dt = Ω (ω − 1)`, `M dω/dt = Pm − Pe − D(ω − 1)`,
/// with the electrical power `Pe = Pmax sin δ` as an algebraic variable
/// and the mechanical power `Pm` as a parameter.
pub fn swing_block(name: &str, m: f64, d: f64, omega_base: f64, pmax: f64) -> (Block, SwingVars) {
    let delta = Var::new(format!("{name}_delta"));
    let omega = Var::new(format!("{name}_omega"));
    let pe = Var::new(format!("{name}_pe"));
    let pm = Var::new(format!("{name}_pm"));

    let mut b = Block::new(name);
    b.add_parameter(pm.clone());
    b.add_state(delta.clone(), omega_base * (Expr::from(&omega) - 1.0));
    b.add_state(
        omega.clone(),
        (Expr::from(&pm) - Expr::from(&pe) - d * (Expr::from(&omega) - 1.0)) / m,
    );
    b.add_algebraic(
        pe.clone(),
        Expr::from(&pe) - pmax * crate::symbolic::sin(Expr::from(&delta)),
    );
    (
        b,
        SwingVars {
            delta,
            omega,
            pe,
            pm,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::Expr;

    #[test]
    fn test_flatten_preserves_declaration_order() {
        let x1 = Var::new("x1");
        let x2 = Var::new("x2");
        let y = Var::new("y");

        let mut child = Block::new("child");
        child.add_state(x2.clone(), Expr::c(0.0));

        let mut root = Block::new("root");
        root.add_state(x1.clone(), Expr::c(1.0));
        root.add_algebraic(y.clone(), Expr::from(&y) - 1.0);
        root.add_child(child);

        let flat = root.flatten().unwrap();
        assert_eq!(flat.state_vars.len(), 2);
        assert_eq!(flat.state_vars[0].uid, x1.uid);
        assert_eq!(flat.state_vars[1].uid, x2.uid);
        assert_eq!(flat.algebraic_vars[0].uid, y.uid);
    }

    #[test]
    fn test_arity_mismatch_is_malformed() {
        let x = Var::new("x");
        let mut b = Block::new("bad");
        b.state_vars.push(x);
        // no matching equation
        assert!(matches!(b.flatten(), Err(VgError::MalformedBlock(_))));
    }

    #[test]
    fn test_duplicate_variable_is_malformed() {
        let x = Var::new("x");
        let mut b = Block::new("dup");
        b.add_state(x.clone(), Expr::c(0.0));
        let mut child = Block::new("child");
        child.add_algebraic(x.clone(), Expr::from(&x));
        b.add_child(child);
        assert!(matches!(b.flatten(), Err(VgError::MalformedBlock(_))));
    }

    #[test]
    fn test_unbound_free_variable_is_malformed() {
        let x = Var::new("x");
        let ghost = Var::new("ghost");
        let mut b = Block::new("b");
        b.add_state(x, Expr::from(&ghost));
        assert!(matches!(b.flatten(), Err(VgError::MalformedBlock(_))));
    }

    #[test]
    fn test_swing_block_flattens() {
        let (blk, vars) = swing_block("g1", 5.0, 2.0, 314.159, 1.5);
        let flat = blk.flatten().unwrap();
        assert_eq!(flat.n_state(), 2);
        assert_eq!(flat.n_alg(), 1);
        assert_eq!(flat.parameters.len(), 1);
        assert_eq!(flat.parameters[0].uid, vars.pm.uid);
    }

    #[test]
    fn test_connect_renames_variable() {
        let ext = Var::new("ext_signal");
        let x = Var::new("x");
        let inp = Var::new("inp");
        let mut b = Block::new("b");
        b.inputs.push(inp.clone());
        b.outputs.push(ext.clone());
        b.add_state(x, Expr::from(&inp) * 2.0);

        b.connect(&inp, &ext);
        let flat = b.flatten().unwrap();
        let mut free = HashMap::new();
        for eq in &flat.state_eqs {
            eq.free_vars(&mut free);
        }
        assert!(!free.contains_key(&inp.uid));
        assert!(free.contains_key(&ext.uid));
    }
}
