//! Last-call analysis: tail-call-modulo-cons.
//!
//! A direct recursion followed only by destructive writes of its outputs
//! into freshly built structure can become a true tail call: the callee
//! writes those outputs through references into their destination fields
//! instead of returning them. Per leaf, the final block is partitioned
//! around the last call; statements independent of the call's outputs are
//! hoisted above it, and the residue must be `lpvm mutate` instructions
//! whose value argument comes from a call output, forming non-aliasing
//! chains. The matching output parameters become `OutByReference` and the
//! mutate value arguments `TakeReference`.
//!
//! Afterwards, every call site anywhere in the module is coerced to the
//! converted signatures, and any `OutByReference` call output whose single
//! later use is a mutate value is converted to `TakeReference` as well --
//! that lets even non-recursive calls write straight into destination
//! fields.

use std::collections::{BTreeMap, BTreeSet};

use plume_core::{
    FlowDirection, ForeignLang, Module, Prim, PrimArg, PrimFork, ProcBody,
    ProcImpl, ProcSpec, Spanned,
};
use tracing::debug;

/// Runs the analysis over every compiled procedure, bottom-up by SCC, then
/// propagates the converted signatures to every call site.
pub fn last_call_analysis(module: &mut Module, skip: &BTreeSet<ProcSpec>) {
    for scc in module.local_call_sccs() {
        for spec in scc {
            if skip.contains(&spec) {
                continue;
            }
            transform_proc(module, &spec);
        }
    }
    fixup_call_flows(module, skip);
    general_take_reference(module, skip);
}

/// Attempts the tail-call-modulo-cons transformation on one procedure.
fn transform_proc(module: &mut Module, spec: &ProcSpec) {
    let Some(def) = module.get_proc(spec) else {
        return;
    };
    let ProcImpl::Prim(_) = &def.impln else {
        return;
    };
    let mut def = def.clone();
    let ProcImpl::Prim(body) = &mut def.impln else {
        unreachable!()
    };

    let mut converted: BTreeSet<usize> = BTreeSet::new();
    for_each_leaf(body, &mut |prims| {
        converted.extend(transform_leaf(prims, spec));
    });

    if !converted.is_empty() {
        for &i in &converted {
            if let Some(param) = def.proto.params.get_mut(i) {
                param.flow = FlowDirection::OutByReference;
            }
        }
        debug!(target: "lastcall", "{}: outputs {:?} converted to by-reference",
               def.proto.name, converted);
        *module.get_proc_mut(spec).expect("spec resolved above") = def;
    }
}

/// Transforms one leaf block if it matches the pattern; returns the
/// converted parameter indices (empty when the leaf does not match).
fn transform_leaf(prims: &mut Vec<Spanned<Prim>>, self_spec: &ProcSpec) -> BTreeSet<usize> {
    let none = BTreeSet::new();
    let Some(call_idx) = prims
        .iter()
        .rposition(|p| matches!(p.node, Prim::Call { .. }))
    else {
        return none;
    };
    // Only direct recursion; mutual recursion is out of scope.
    {
        let Prim::Call { spec, .. } = &prims[call_idx].node else {
            unreachable!()
        };
        if spec != self_spec {
            return none;
        }
    }
    if call_idx == prims.len() - 1 {
        // Already a tail call.
        return none;
    }

    let call_outputs: BTreeMap<String, usize> = {
        let Prim::Call { args, .. } = &prims[call_idx].node else {
            unreachable!()
        };
        args.iter()
            .enumerate()
            .filter(|(_, a)| a.is_output())
            .filter_map(|(i, a)| a.var_name().map(|v| (v.to_string(), i)))
            .collect()
    };

    // Partition the statements after the call: anything that touches no
    // call output and no global can move above the call; the rest must be
    // the mutate chain.
    let after: Vec<Spanned<Prim>> = prims.drain(call_idx + 1..).collect();
    let mut tainted: BTreeSet<String> = call_outputs.keys().cloned().collect();
    let mut hoisted = Vec::new();
    let mut tail = Vec::new();
    for prim in after {
        let reads_tainted = prim
            .node
            .input_names()
            .iter()
            .any(|v| tainted.contains(v));
        if !reads_tainted && prim.node.global_flows().is_empty() {
            hoisted.push(prim);
        } else {
            tainted.extend(prim.node.output_names());
            tail.push(prim);
        }
    }

    let restore = |prims: &mut Vec<Spanned<Prim>>,
                   hoisted: Vec<Spanned<Prim>>,
                   tail: Vec<Spanned<Prim>>| {
        prims.extend(hoisted);
        prims.extend(tail);
    };

    if tail.is_empty() {
        // Everything hoists: plain tail call, nothing to convert.
        let last = prims.remove(call_idx);
        prims.extend(hoisted);
        prims.push(last);
        return none;
    }
    if !valid_mutate_chain(&tail, &call_outputs) {
        restore(prims, hoisted, tail);
        return none;
    }

    // Convert: the call's fed outputs go by reference, the mutate values
    // take references, and the hoistable code moves above the call.
    let mut converted = BTreeSet::new();
    for prim in &tail {
        let Prim::Foreign { args, .. } = &prim.node else {
            unreachable!("validated as mutate chain")
        };
        if let Some(v) = args[6].var_name() {
            if let Some(&pos) = call_outputs.get(v) {
                converted.insert(pos);
            }
        }
    }
    let mut last = prims.remove(call_idx);
    if let Prim::Call { args, .. } = &mut last.node {
        for (i, arg) in args.iter_mut().enumerate() {
            if converted.contains(&i) {
                if let PrimArg::Var { flow, .. } = arg {
                    *flow = FlowDirection::OutByReference;
                }
            }
        }
    }
    let mut tail = tail;
    for prim in &mut tail {
        if let Prim::Foreign { args, .. } = &mut prim.node {
            if let PrimArg::Var { name, flow, .. } = &mut args[6] {
                if call_outputs.contains_key(name.as_str()) {
                    *flow = FlowDirection::TakeReference;
                }
            }
        }
    }
    prims.extend(hoisted);
    prims.push(last);
    prims.extend(tail);
    converted
}

/// The residue after the last call must be `lpvm mutate` instructions fed
/// by call outputs, with non-aliasing carrier chains: each chain's head
/// structure comes from outside the call, links follow output-to-input,
/// and no two writes in one chain share an offset.
fn valid_mutate_chain(
    tail: &[Spanned<Prim>],
    call_outputs: &BTreeMap<String, usize>,
) -> bool {
    let mut links: BTreeMap<String, usize> = BTreeMap::new(); // in-addr -> index
    let mut chain_outs: BTreeSet<String> = BTreeSet::new();
    for (i, prim) in tail.iter().enumerate() {
        let Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } = &prim.node
        else {
            return false;
        };
        if name != "mutate" || args.len() != 7 {
            return false;
        }
        // The written value must be an output of the last call.
        let Some(value) = args[6].var_name() else {
            return false;
        };
        if !call_outputs.contains_key(value) {
            return false;
        }
        let Some(in_addr) = args[0].var_name() else {
            return false;
        };
        // The structure being written must not itself come from the call.
        if call_outputs.contains_key(in_addr) {
            return false;
        }
        if links.insert(in_addr.to_string(), i).is_some() {
            // Two writes through the same carrier: aliasing.
            return false;
        }
        if let Some(out_addr) = args[1].var_name() {
            chain_outs.insert(out_addr.to_string());
        }
    }
    // Walk each chain from its head checking offset disjointness.
    for (in_addr, &start) in &links {
        if chain_outs.contains(in_addr) {
            continue; // not a head
        }
        let mut offsets: BTreeSet<i64> = BTreeSet::new();
        let mut idx = Some(start);
        while let Some(i) = idx {
            let Prim::Foreign { args, .. } = &tail[i].node else {
                unreachable!()
            };
            let Some(off) = args[2].int_value() else {
                // Dynamic offsets cannot be proven disjoint.
                return false;
            };
            if !offsets.insert(off) {
                return false;
            }
            idx = args[1]
                .var_name()
                .and_then(|out| links.get(out).copied());
        }
    }
    true
}

/// Step 7: coerce `Out` actuals to `OutByReference` wherever the callee's
/// parameter now demands it.
fn fixup_call_flows(module: &mut Module, skip: &BTreeSet<ProcSpec>) {
    let mut flow_tables: BTreeMap<(String, u32), Vec<FlowDirection>> = BTreeMap::new();
    for (name, bucket) in &module.procs {
        for (i, def) in bucket.iter().enumerate() {
            flow_tables.insert(
                (name.clone(), i as u32),
                def.proto.params.iter().map(|p| p.flow).collect(),
            );
        }
    }
    for spec in module.all_specs() {
        if skip.contains(&spec) {
            continue;
        }
        let def = module.get_proc_mut(&spec).expect("enumerated spec");
        let ProcImpl::Prim(body) = &mut def.impln else {
            continue;
        };
        body.for_each_prim_mut(&mut |prim| {
            if let Prim::Call { spec: callee, args, .. } = &mut prim.node {
                let Some(flows) =
                    flow_tables.get(&(callee.name.clone(), callee.id.0))
                else {
                    return;
                };
                for (arg, &flow) in args.iter_mut().zip(flows) {
                    if flow == FlowDirection::OutByReference {
                        if let PrimArg::Var {
                            flow: arg_flow, ..
                        } = arg
                        {
                            if *arg_flow == FlowDirection::Out {
                                *arg_flow = FlowDirection::OutByReference;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Step 6: an `OutByReference` output whose single later use is a mutate
/// value becomes `TakeReference`, letting the callee write the field
/// directly even without recursion.
fn general_take_reference(module: &mut Module, skip: &BTreeSet<ProcSpec>) {
    for spec in module.all_specs() {
        if skip.contains(&spec) {
            continue;
        }
        let def = module.get_proc_mut(&spec).expect("enumerated spec");
        let ProcImpl::Prim(body) = &mut def.impln else {
            continue;
        };
        convert_single_use_values(body);
    }
}

fn convert_single_use_values(body: &mut ProcBody) {
    // Variables read anywhere below this block's straight-line code.
    let mut fork_reads: BTreeSet<String> = BTreeSet::new();
    if let PrimFork::Fork { var, bodies, .. } = &body.fork {
        fork_reads.insert(var.clone());
        for b in bodies {
            b.for_each_prim(&mut |p| {
                fork_reads.extend(p.node.input_names());
            });
        }
    }

    for i in 0..body.prims.len() {
        let by_ref_outs: Vec<String> = match &body.prims[i].node {
            Prim::Call { args, .. } => args
                .iter()
                .filter(|a| {
                    matches!(
                        a,
                        PrimArg::Var {
                            flow: FlowDirection::OutByReference,
                            ..
                        }
                    )
                })
                .filter_map(|a| a.var_name().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        for var in by_ref_outs {
            if fork_reads.contains(&var) {
                continue;
            }
            let mut uses = Vec::new();
            for (j, later) in body.prims.iter().enumerate().skip(i + 1) {
                for name in later.node.input_names() {
                    if name == var {
                        uses.push(j);
                    }
                }
            }
            let [only_use] = uses.as_slice() else {
                continue;
            };
            let j = *only_use;
            if let Prim::Foreign {
                lang: ForeignLang::Lpvm,
                name,
                args,
                ..
            } = &mut body.prims[j].node
            {
                if name == "mutate" && args.len() == 7 {
                    if let PrimArg::Var {
                        name: vname, flow, ..
                    } = &mut args[6]
                    {
                        if *vname == var {
                            *flow = FlowDirection::TakeReference;
                        }
                    }
                }
            }
        }
    }

    if let PrimFork::Fork { bodies, .. } = &mut body.fork {
        for b in bodies {
            convert_single_use_values(b);
        }
    }
}

/// Applies `f` to the straight-line prims of every leaf block.
fn for_each_leaf(body: &mut ProcBody, f: &mut impl FnMut(&mut Vec<Spanned<Prim>>)) {
    match &mut body.fork {
        PrimFork::NoFork => f(&mut body.prims),
        PrimFork::Fork { bodies, .. } => {
            for b in bodies {
                for_each_leaf(b, f);
            }
        }
    }
}
