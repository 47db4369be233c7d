//! Lowering of checked plume modules to primitive form.
//!
//! [`lower_module`] drives three stages over a type-and-mode-checked
//! module:
//!
//! 1. **Unbranch** every procedure (including the procedures unbranching
//!    itself generates for loops, continuations, and closures), flattening
//!    structured control into call sequences with terminal conditionals.
//! 2. **Compile** each flattened body into a primitive [`plume_core::body::ProcBody`]
//!    through the optimising [`builder::BodyBuilder`], then run the
//!    backward pass for dead-code elimination and last-use marking.
//! 3. **Last-call analysis** converting tail-calls-modulo-cons to
//!    by-reference outputs.
//!
//! Procedures that failed checking are skipped throughout.

pub mod builder;
pub mod compile;
pub mod fold;
pub mod info;
pub mod lastcall;
pub mod unbranch;

use std::collections::{BTreeSet, VecDeque};

use plume_check::CheckReport;
use plume_core::{Module, ProcSpec};
use tracing::debug;

pub use builder::{backward_pass, BodyBuilder};
pub use compile::compile_proc;
pub use info::{ProcInfo, ProcInfoTable};
pub use lastcall::last_call_analysis;
pub use unbranch::{unbranch_proc, SUCCESS_FLAG};

/// Lowers every procedure the checking pass accepted to primitive form.
pub fn lower_module(module: &mut Module, report: &CheckReport) {
    lower_passing(module, &report.failed)
}

/// Lowers every procedure not named in `failed`.
pub fn lower_passing(module: &mut Module, failed: &BTreeSet<ProcSpec>) {
    // Callee facts are snapshotted before any signature changes so call
    // sites can be rewritten independent of processing order.
    let mut info = ProcInfoTable::from_module(module);
    let path = module.path.clone();

    // Unbranch, breadth-first over the worklist: generated procedures are
    // queued as they appear.
    let mut queue: VecDeque<ProcSpec> = module
        .all_specs()
        .into_iter()
        .filter(|s| !failed.contains(s))
        .collect();
    while let Some(spec) = queue.pop_front() {
        let mut def = module
            .get_proc(&spec)
            .expect("worklist spec must resolve")
            .clone();
        let generated = unbranch::unbranch_proc(&info, &mut def, &path);
        *module.get_proc_mut(&spec).expect("worklist spec must resolve") = def;
        for gen_def in generated {
            let gen_info = info::ProcInfo {
                determinism: gen_def.determinism,
                arity: gen_def.proto.params.len(),
                pure: gen_def.is_pure(),
            };
            let gen_spec = module.add_proc(gen_def);
            info.add(&gen_spec, gen_info);
            queue.push_back(gen_spec);
        }
    }

    // Compile to primitive bodies. Every callee signature is now in its
    // lowered form, so argument lists line up with parameters.
    for spec in module.all_specs() {
        if failed.contains(&spec) {
            continue;
        }
        let mut def = module
            .get_proc(&spec)
            .expect("enumerated spec must resolve")
            .clone();
        compile::compile_proc(module, &info, &mut def);
        *module.get_proc_mut(&spec).expect("enumerated spec must resolve") = def;
    }
    debug!(target: "builder", "module {} compiled to primitive form", module.path);

    lastcall::last_call_analysis(module, failed);
}
