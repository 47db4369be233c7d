//! Pre-lowering snapshot of callee facts.
//!
//! Unbranching rewrites every procedure's signature (semi-det procs gain a
//! success output), so call sites must be rewritten against what callees
//! looked like *before* the pass, regardless of processing order. The
//! [`ProcInfoTable`] captures that snapshot; it also answers purity and
//! global-flow questions for the body builder's CSE and dead-code
//! decisions.

use std::collections::HashMap;

use plume_core::{Determinism, GlobalFlows, Module, ProcSpec};

/// Facts about one procedure as declared, before lowering.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub determinism: Determinism,
    pub arity: usize,
    pub pure: bool,
}

/// Callee facts keyed by `(name, overload id)` within the module.
#[derive(Debug, Default)]
pub struct ProcInfoTable {
    map: HashMap<(String, u32), ProcInfo>,
}

impl ProcInfoTable {
    pub fn from_module(module: &Module) -> Self {
        let mut map = HashMap::new();
        for (name, bucket) in &module.procs {
            for (i, def) in bucket.iter().enumerate() {
                map.insert(
                    (name.clone(), i as u32),
                    ProcInfo {
                        determinism: def.determinism,
                        arity: def.proto.params.len(),
                        pure: def.is_pure(),
                    },
                );
            }
        }
        ProcInfoTable { map }
    }

    /// Registers a generated procedure added after the snapshot.
    pub fn add(&mut self, spec: &ProcSpec, info: ProcInfo) {
        self.map.insert((spec.name.clone(), spec.id.0), info);
    }

    pub fn lookup(&self, spec: &ProcSpec) -> Option<&ProcInfo> {
        self.map.get(&(spec.name.clone(), spec.id.0))
    }

    /// Purity of a callee. Unknown (cross-module) callees are assumed
    /// impure so no optimisation reorders or removes them.
    pub fn is_pure(&self, spec: &ProcSpec) -> bool {
        self.lookup(spec).map(|i| i.pure).unwrap_or(false)
    }

    /// Global flows of a call to `spec`. Pure callees touch nothing;
    /// impure or unknown callees may touch anything.
    pub fn global_flows(&self, spec: &ProcSpec) -> GlobalFlows {
        if self.is_pure(spec) {
            GlobalFlows::none()
        } else {
            GlobalFlows::universal()
        }
    }
}
