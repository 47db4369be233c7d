//! Type and mode checking for plume modules.
//!
//! [`check_module`] drives the whole pass: declaration validation, then for
//! each strongly-connected component of the local call graph (bottom-up),
//! type inference iterated to a fixed point followed by mode checking of
//! each member. Every error found is collected; nothing stops at the first
//! problem. Procedures that produced diagnostics are reported in the
//! [`CheckReport`] so later passes can skip them.

pub mod binding;
pub mod foreign;
pub mod modecheck;
pub mod typecheck;
pub mod typing;
pub mod validate;

use std::collections::{BTreeMap, BTreeSet};

use plume_core::{sort_diagnostics, Diagnostic, ErrorKind, Module, ProcSpec};
use serde::Serialize;
use tracing::debug;

pub use binding::BindingState;
pub use foreign::{validate_foreign, ForeignArg};
pub use modecheck::mode_check_proc;
pub use typecheck::{type_check_proc, TypeCheckOutcome};
pub use typing::{Alternative, Typing};

/// Everything the checking pass learned about a module. Serializable so
/// drivers and tooling can emit machine-readable diagnostics.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    /// All diagnostics, sorted by source position where known.
    pub diags: Vec<Diagnostic>,
    /// Procedures with at least one diagnostic; these must not proceed to
    /// unbranching.
    pub failed: BTreeSet<ProcSpec>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.diags.is_empty()
    }
}

/// Checks every procedure in the module, bottom-up by call-graph SCC.
///
/// Cyclic components iterate type inference until parameter types stop
/// changing; overload resolution is flow-insensitive, so a handful of
/// rounds suffices. Only diagnostics from the final round are kept --
/// earlier rounds see provisional types and would duplicate reports.
pub fn check_module(module: &mut Module) -> CheckReport {
    let mut all = Vec::new();
    let mut failed = BTreeSet::new();

    for (spec, diag) in validate::validate_decls(module) {
        failed.insert(spec);
        all.push(diag);
    }

    for scc in module.local_call_sccs() {
        debug!(target: "types", "checking SCC of {} proc(s)", scc.len());
        let mut per_proc: BTreeMap<ProcSpec, Vec<Diagnostic>> = BTreeMap::new();

        // Type inference to a fixed point over the component.
        let max_rounds = scc.len() + 2;
        for round in 0..max_rounds {
            let mut changed = false;
            for spec in &scc {
                let mut def = module
                    .get_proc(spec)
                    .expect("SCC spec must resolve")
                    .clone();
                let outcome = typecheck::type_check_proc(module, &mut def);
                changed |= outcome.params_changed;
                per_proc.insert(spec.clone(), outcome.diags);
                *module.get_proc_mut(spec).expect("SCC spec must resolve") = def;
            }
            if !changed {
                debug!(target: "types", "SCC stable after {} round(s)", round + 1);
                break;
            }
        }

        // Mode checking, once types are settled. Skip members whose
        // inference already failed; their types are unreliable.
        for spec in &scc {
            let entry = per_proc.entry(spec.clone()).or_default();
            if !entry.is_empty() {
                continue;
            }
            let mut def = module
                .get_proc(spec)
                .expect("SCC spec must resolve")
                .clone();
            let diags = modecheck::mode_check_proc(module, &mut def);
            entry.extend(diags);
            *module.get_proc_mut(spec).expect("SCC spec must resolve") = def;
        }

        for (spec, diags) in per_proc {
            if !diags.is_empty() {
                failed.insert(spec);
                all.extend(diags);
            }
        }
    }

    // Inference may leave a public procedure's parameter unresolved even
    // when declarations were well-formed (e.g. a parameter the body never
    // constrains past a type variable).
    for spec in module.all_specs() {
        if failed.contains(&spec) {
            continue;
        }
        let def = module.get_proc(&spec).expect("enumerated spec");
        if !def.is_public() {
            continue;
        }
        for param in &def.proto.params {
            if !param.ty.is_resolved() {
                all.push(Diagnostic::new(
                    def.pos.clone(),
                    ErrorKind::UndeclaredParamType {
                        proc_name: def.proto.name.clone(),
                        param: param.name.clone(),
                    },
                ));
                failed.insert(spec.clone());
            }
        }
    }

    sort_diagnostics(&mut all);
    CheckReport { diags: all, failed }
}
