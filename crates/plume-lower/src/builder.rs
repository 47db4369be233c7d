//! The body builder: assembles primitive bodies bottom-up while
//! optimising.
//!
//! The forward pass accumulates placed primitives together with a copy
//! substitution, a table of recorded (pure) calls for common-subexpression
//! elimination, and the most recent value loaded from each global. Every
//! appended instruction is rewritten through the substitution, constant
//! folded, checked against the CSE table, and only then emitted.
//!
//! Forks are built with `build_fork` / `begin_branch` / `end_branch` /
//! `complete_fork`. A fork whose switch variable already has a constant
//! substitution emits only the selected branch. Entering branch `i`
//! extends that branch's substitution with `var = i`, so a later fork on a
//! variable that is constant per branch resolves to a known value inside
//! every branch and its test is elided -- fork fusion. Instructions and
//! forks arriving after a completed fork are distributed into every branch
//! (forks are terminal; nothing may follow them at the same level).
//!
//! The backward pass ([`backward_pass`]) walks the finished body bottom-up:
//! it folds moves into renames, drops pure instructions whose outputs are
//! never used, and marks each input argument's final use.

use std::collections::{BTreeSet, HashMap, HashSet};

use plume_core::{
    ForeignLang, GlobalInfo, Prim, PrimArg, PrimFork, ProcBody, ProcSpec,
    SourcePos, Spanned, StringVariant, TypeSpec,
};
use tracing::trace;

use crate::fold;
use crate::info::ProcInfoTable;

/// Builds one procedure body.
pub struct BodyBuilder<'a> {
    info: &'a ProcInfoTable,
    root: BuildNode,
    tmp_count: u32,
}

impl<'a> BodyBuilder<'a> {
    pub fn new(info: &'a ProcInfoTable, tmp_count: u32) -> Self {
        BodyBuilder {
            info,
            root: BuildNode::Open(Block::default()),
            tmp_count,
        }
    }

    /// Mints a fresh temporary name.
    pub fn next_tmp(&mut self) -> String {
        let n = self.tmp_count;
        self.tmp_count += 1;
        plume_core::temp_name(n)
    }

    /// Global flows of a call to `spec`, from the shared callee table.
    pub fn callee_global_flows(&self, spec: &ProcSpec) -> plume_core::GlobalFlows {
        self.info.global_flows(spec)
    }

    /// Appends one instruction, applying the rewrite rules.
    pub fn instr(&mut self, prim: Prim, pos: Option<SourcePos>) {
        self.root.instr(prim, pos, self.info);
    }

    /// Starts a terminal fork on `var`.
    pub fn build_fork(&mut self, var: String, ty: TypeSpec) {
        self.root.build_fork(var, ty);
    }

    pub fn begin_branch(&mut self) {
        self.root.begin_branch();
    }

    pub fn end_branch(&mut self) {
        self.root.end_branch();
    }

    pub fn complete_fork(&mut self) {
        self.root.complete_fork();
    }

    /// Finishes building, returning the assembled body and the threaded
    /// temporary counter.
    pub fn finish(self) -> (ProcBody, u32) {
        (self.root.extract(), self.tmp_count)
    }
}

// ---------------------------------------------------------------------------
// Build tree
// ---------------------------------------------------------------------------

enum BuildNode {
    /// A straight-line block accepting instructions.
    Open(Block),
    /// A fork under construction or completed.
    Fork(Box<ForkNode>),
}

#[derive(Default)]
struct Block {
    prims: Vec<Spanned<Prim>>,
    /// Variable -> the argument it is proven equal to.
    subst: HashMap<String, PrimArg>,
    /// Canonicalised pure instruction -> its recorded output arguments.
    recorded: HashMap<CanonPrim, Vec<PrimArg>>,
    /// Global -> the argument last loaded from or stored to it.
    globals_loaded: HashMap<GlobalInfo, PrimArg>,
    /// Variables written in this block.
    defs: HashSet<String>,
}

struct ForkNode {
    stem: Block,
    var: String,
    ty: TypeSpec,
    /// Constant value of the switch variable, when the substitution knows
    /// it: only that branch will be emitted.
    known: Option<i64>,
    branches: Vec<BuildNode>,
    in_branch: bool,
    complete: bool,
}

impl BuildNode {
    /// `true` while this subtree still has an unfinished fork or branch.
    fn is_building(&self) -> bool {
        match self {
            BuildNode::Open(_) => false,
            BuildNode::Fork(f) => {
                !f.complete || f.branches.iter().any(BuildNode::is_building)
            }
        }
    }

    fn instr(&mut self, prim: Prim, pos: Option<SourcePos>, info: &ProcInfoTable) {
        match self {
            BuildNode::Open(block) => block.append(prim, pos, info),
            BuildNode::Fork(f) => {
                if !f.complete {
                    assert!(f.in_branch, "instruction emitted between fork branches");
                    f.branches
                        .last_mut()
                        .expect("in_branch implies a branch")
                        .instr(prim, pos, info);
                } else {
                    for branch in &mut f.branches {
                        branch.instr(prim.clone(), pos.clone(), info);
                    }
                }
            }
        }
    }

    fn build_fork(&mut self, var: String, ty: TypeSpec) {
        match self {
            BuildNode::Open(block) => {
                let known = match block.resolve(&PrimArg::in_var(var.clone(), ty.clone()))
                {
                    PrimArg::Int { value, .. } => Some(value),
                    _ => None,
                };
                if known.is_some() {
                    trace!(target: "builder", "fork on {} has known value", var);
                }
                let stem = std::mem::take(block);
                *self = BuildNode::Fork(Box::new(ForkNode {
                    stem,
                    var,
                    ty,
                    known,
                    branches: Vec::new(),
                    in_branch: false,
                    complete: false,
                }));
            }
            BuildNode::Fork(f) => {
                if !f.complete {
                    assert!(f.in_branch, "fork started between branches");
                    f.branches
                        .last_mut()
                        .expect("in_branch implies a branch")
                        .build_fork(var, ty);
                } else {
                    // A fork after a completed fork is pushed into every
                    // branch; where the branch knows the switch value it
                    // collapses -- fork fusion.
                    for branch in &mut f.branches {
                        branch.build_fork(var.clone(), ty.clone());
                    }
                }
            }
        }
    }

    fn begin_branch(&mut self) {
        match self {
            BuildNode::Open(_) => panic!("begin_branch outside a fork"),
            BuildNode::Fork(f) => {
                if !f.complete {
                    if f.in_branch {
                        f.branches
                            .last_mut()
                            .expect("in_branch implies a branch")
                            .begin_branch();
                    } else {
                        let idx = f.branches.len() as i64;
                        let mut block = Block {
                            prims: Vec::new(),
                            subst: f.stem.subst.clone(),
                            recorded: f.stem.recorded.clone(),
                            globals_loaded: f.stem.globals_loaded.clone(),
                            defs: HashSet::new(),
                        };
                        if f.known.is_none() {
                            block.subst.insert(
                                f.var.clone(),
                                PrimArg::Int {
                                    value: idx,
                                    ty: f.ty.clone(),
                                },
                            );
                        }
                        f.branches.push(BuildNode::Open(block));
                        f.in_branch = true;
                    }
                } else {
                    for branch in &mut f.branches {
                        branch.begin_branch();
                    }
                }
            }
        }
    }

    fn end_branch(&mut self) {
        match self {
            BuildNode::Open(_) => panic!("end_branch outside a fork"),
            BuildNode::Fork(f) => {
                if !f.complete {
                    assert!(f.in_branch, "end_branch without begin_branch");
                    if f.branches
                        .last()
                        .expect("in_branch implies a branch")
                        .is_building()
                    {
                        f.branches.last_mut().unwrap().end_branch();
                    } else {
                        f.in_branch = false;
                    }
                } else {
                    for branch in &mut f.branches {
                        branch.end_branch();
                    }
                }
            }
        }
    }

    fn complete_fork(&mut self) {
        match self {
            BuildNode::Open(_) => panic!("complete_fork outside a fork"),
            BuildNode::Fork(f) => {
                if !f.complete {
                    if f.in_branch {
                        f.branches
                            .last_mut()
                            .expect("in_branch implies a branch")
                            .complete_fork();
                    } else {
                        f.complete = true;
                    }
                } else {
                    for branch in &mut f.branches {
                        branch.complete_fork();
                    }
                }
            }
        }
    }

    /// Converts the build tree into a [`ProcBody`]. Known-value forks emit
    /// only the selected branch, with no fork at all.
    fn extract(self) -> ProcBody {
        match self {
            BuildNode::Open(block) => ProcBody {
                prims: block.prims,
                fork: PrimFork::NoFork,
            },
            BuildNode::Fork(f) => {
                let fork = *f;
                let mut body = ProcBody {
                    prims: fork.stem.prims,
                    fork: PrimFork::NoFork,
                };
                match fork.known {
                    Some(k) => {
                        let idx = k as usize;
                        if let Some(branch) =
                            fork.branches.into_iter().nth(idx)
                        {
                            let sub = branch.extract();
                            body.prims.extend(sub.prims);
                            body.fork = sub.fork;
                        }
                    }
                    None => {
                        body.fork = PrimFork::Fork {
                            var: fork.var,
                            ty: fork.ty,
                            last_use: false,
                            bodies: fork
                                .branches
                                .into_iter()
                                .map(BuildNode::extract)
                                .collect(),
                        };
                    }
                }
                body
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Straight-line block: the instruction rewrite rules
// ---------------------------------------------------------------------------

impl Block {
    /// Follows the substitution from `arg` to its ultimate value.
    fn resolve(&self, arg: &PrimArg) -> PrimArg {
        let mut current = arg.clone();
        let mut hops = 0;
        while let PrimArg::Var { name, flow, .. } = &current {
            if !flow.flows_in() {
                break;
            }
            match self.subst.get(name) {
                Some(next) => current = next.clone(),
                None => break,
            }
            hops += 1;
            if hops > 1000 {
                unreachable!("substitution cycle");
            }
        }
        current
    }

    /// Rewrites every input argument through the substitution.
    fn rewrite_inputs(&self, prim: &mut Prim) {
        fn rewrite(block: &Block, arg: &mut PrimArg) {
            match arg {
                PrimArg::Var { flow, .. } if flow.flows_in() => {
                    *arg = block.resolve(arg);
                }
                PrimArg::ProcRef { closed, .. } => {
                    for a in closed {
                        rewrite(block, a);
                    }
                }
                _ => {}
            }
        }
        if let Prim::Higher { func, .. } = prim {
            rewrite(self, func);
        }
        for arg in prim.args_mut() {
            rewrite(self, arg);
        }
    }

    fn append(&mut self, prim: Prim, pos: Option<SourcePos>, info: &ProcInfoTable) {
        let mut prim = prim;
        self.rewrite_inputs(&mut prim);
        let prim = fold::simplify(prim);

        // Copy propagation: a move proves its destination equal to its
        // source. The move itself is still emitted; the backward pass
        // removes it if nothing turns out to need it.
        if let Some((src, dst)) = prim.as_move() {
            if let PrimArg::Var { name: dst_name, .. } = dst {
                let dst_name = dst_name.clone();
                self.subst.insert(dst_name.clone(), as_input(src));
                self.defs.insert(dst_name);
                self.prims.push(Spanned::new(prim, pos));
                return;
            }
        }

        // Global load forwarding: a load of a global we already hold
        // becomes a move; a store of the value the global already holds
        // vanishes.
        if let Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } = &prim
        {
            if name == "load" && args.len() == 2 {
                if let PrimArg::Global { info: global, .. } = &args[0] {
                    if let Some(loaded) = self.globals_loaded.get(global) {
                        let replacement =
                            Prim::move_prim(loaded.clone(), args[1].clone());
                        self.append(replacement, pos, info);
                        return;
                    }
                }
            }
            if name == "store" && args.len() == 2 {
                if let PrimArg::Global { info: global, .. } = &args[1] {
                    if let Some(held) = self.globals_loaded.get(global) {
                        if canon_arg(held) == canon_arg(&self.resolve(&args[0])) {
                            trace!(target: "builder", "redundant store to {} dropped",
                                   global);
                            return;
                        }
                    }
                }
            }
        }

        // Common subexpression elimination: a pure instruction whose
        // canonical form was recorded earlier is replaced by moves from
        // the recorded outputs.
        let pure = prim_is_pure(&prim, info) && prim.global_flows().is_empty();
        if pure {
            let (key, outs) = canonical(&prim);
            if let Some(recorded) = self.recorded.get(&key).cloned() {
                trace!(target: "builder", "CSE hit for {}", prim);
                for (rec, cur) in recorded.into_iter().zip(outs) {
                    self.append(Prim::move_prim(rec, cur), pos.clone(), info);
                }
                return;
            }
        }

        // Emit. Track definitions, invalidate globals the instruction
        // writes, and remember loads/stores.
        for out in prim.output_names() {
            self.defs.insert(out);
        }
        let flows = prim.global_flows();
        if flows.universal {
            self.globals_loaded.clear();
        } else {
            for g in &flows.outs {
                self.globals_loaded.remove(g);
            }
        }
        if let Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            args,
            ..
        } = &prim
        {
            if name == "load" && args.len() == 2 {
                if let PrimArg::Global { info: global, .. } = &args[0] {
                    self.globals_loaded
                        .insert(global.clone(), as_input(&args[1]));
                }
            }
            if name == "store" && args.len() == 2 {
                if let PrimArg::Global { info: global, .. } = &args[1] {
                    self.globals_loaded
                        .insert(global.clone(), as_input(&args[0]));
                }
            }
        }
        if pure {
            let (key, outs) = canonical(&prim);
            self.recorded
                .insert(key, outs.iter().map(as_input).collect());
            for (equiv, equiv_outs) in fold::equivalents(&prim) {
                let (ekey, _) = canonical(&equiv);
                self.recorded.entry(ekey).or_insert(equiv_outs);
            }
        }
        self.prims.push(Spanned::new(prim, pos));
    }
}

fn prim_is_pure(prim: &Prim, info: &ProcInfoTable) -> bool {
    match prim {
        Prim::Call { spec, .. } => info.is_pure(spec),
        Prim::Higher { .. } => false,
        Prim::Foreign { .. } => prim.foreign_is_pure(),
    }
}

/// An argument as usable input elsewhere: variables lose output flow and
/// last-use marks.
fn as_input(arg: &PrimArg) -> PrimArg {
    match arg {
        PrimArg::Var { name, ty, .. } => PrimArg::in_var(name.clone(), ty.clone()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Canonical forms for the CSE table
// ---------------------------------------------------------------------------

/// An argument stripped of flow, last-use, and type-level noise, hashable
/// for table lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CanonArg {
    Var(String),
    Int(i64),
    Float(u64),
    Str(String, StringVariant),
    Char(char),
    Global(GlobalInfo),
    ProcRef(ProcSpec, Vec<CanonArg>),
    Undef,
}

fn canon_arg(arg: &PrimArg) -> CanonArg {
    match arg {
        PrimArg::Var { name, .. } => CanonArg::Var(name.clone()),
        PrimArg::Int { value, .. } => CanonArg::Int(*value),
        PrimArg::Float { value, .. } => CanonArg::Float(value.to_bits()),
        PrimArg::Str { value, variant } => CanonArg::Str(value.clone(), *variant),
        PrimArg::Char(c) => CanonArg::Char(*c),
        PrimArg::ProcRef { spec, closed, .. } => CanonArg::ProcRef(
            spec.clone(),
            closed.iter().map(canon_arg).collect(),
        ),
        PrimArg::Global { info, .. } => CanonArg::Global(info.clone()),
        PrimArg::Unneeded | PrimArg::Undef(_) => CanonArg::Undef,
    }
}

/// A pure instruction reduced to its identity and inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CanonPrim {
    tag: String,
    ins: Vec<CanonArg>,
}

/// Splits an instruction into its canonical input form and its output
/// arguments.
fn canonical(prim: &Prim) -> (CanonPrim, Vec<PrimArg>) {
    let tag = match prim {
        Prim::Call { spec, .. } => format!("call {}", spec),
        Prim::Higher { .. } => "higher".to_string(),
        Prim::Foreign { lang, name, .. } => format!("{} {}", lang, name),
    };
    let mut ins = Vec::new();
    let mut outs = Vec::new();
    for arg in prim.args() {
        if arg.is_output() {
            outs.push(arg.clone());
        } else if !matches!(arg, PrimArg::Unneeded) {
            ins.push(canon_arg(arg));
        }
    }
    (CanonPrim { tag, ins }, outs)
}

// ---------------------------------------------------------------------------
// Backward pass
// ---------------------------------------------------------------------------

/// Bottom-up cleanup: rename moves away, drop dead pure instructions, and
/// mark last uses. `used_later` enters holding the variables the caller
/// needs (the procedure's outputs) and leaves holding everything this body
/// reads.
pub fn backward_pass(
    body: &mut ProcBody,
    used_later: &mut BTreeSet<String>,
    info: &ProcInfoTable,
) {
    // The fork is the last thing executed: process it first.
    if let PrimFork::Fork {
        var,
        last_use,
        bodies,
        ..
    } = &mut body.fork
    {
        let mut union = BTreeSet::new();
        for branch in bodies {
            let mut branch_used = used_later.clone();
            backward_pass(branch, &mut branch_used, info);
            union.extend(branch_used);
        }
        *used_later = union;
        *last_use = !used_later.contains(var);
        used_later.insert(var.clone());
    }

    let block_defs: HashSet<String> = body
        .prims
        .iter()
        .flat_map(|p| p.node.output_names())
        .collect();

    let mut renames: HashMap<String, String> = HashMap::new();
    let mut kept: Vec<Spanned<Prim>> = Vec::new();

    for mut prim in body.prims.drain(..).rev() {
        apply_renames(&mut prim.node, &renames);

        // Dead instruction: pure, writes no global, and nothing reads its
        // outputs.
        let outs = prim.node.output_names();
        let pure = prim_is_pure(&prim.node, info)
            && !prim.node.global_flows().universal
            && prim.node.global_flows().outs.is_empty();
        if pure && outs.iter().all(|o| !used_later.contains(o)) {
            trace!(target: "builder", "dead instruction removed: {}", prim.node);
            continue;
        }

        // A move to a live variable from a variable defined in this block
        // and unused later becomes a rename of the definition itself.
        if let Some((src, dst)) = prim.node.as_move() {
            if let (
                PrimArg::Var { name: src_name, .. },
                PrimArg::Var { name: dst_name, .. },
            ) = (src, dst)
            {
                if !used_later.contains(src_name) && block_defs.contains(src_name) {
                    renames.insert(src_name.clone(), dst_name.clone());
                    continue;
                }
            }
        }

        // Mark final uses, then account for this instruction's reads and
        // writes.
        for out in &outs {
            used_later.remove(out);
        }
        mark_last_uses(&mut prim.node, used_later);
        for input in prim.node.input_names() {
            used_later.insert(input);
        }
        kept.push(prim);
    }
    kept.reverse();
    body.prims = kept;
}

fn apply_renames(prim: &mut Prim, renames: &HashMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    fn fix(arg: &mut PrimArg, renames: &HashMap<String, String>) {
        match arg {
            PrimArg::Var { name, .. } => {
                if let Some(new) = renames.get(name) {
                    *name = new.clone();
                }
            }
            PrimArg::ProcRef { closed, .. } => {
                for a in closed {
                    fix(a, renames);
                }
            }
            _ => {}
        }
    }
    if let Prim::Higher { func, .. } = prim {
        fix(func, renames);
    }
    for arg in prim.args_mut() {
        fix(arg, renames);
    }
}

fn mark_last_uses(prim: &mut Prim, used_later: &BTreeSet<String>) {
    fn mark(arg: &mut PrimArg, used_later: &BTreeSet<String>) {
        match arg {
            PrimArg::Var {
                name,
                flow,
                last_use,
                ..
            } => {
                if flow.flows_in() && !used_later.contains(name) {
                    *last_use = true;
                }
            }
            PrimArg::ProcRef { closed, .. } => {
                for a in closed {
                    mark(a, used_later);
                }
            }
            _ => {}
        }
    }
    if let Prim::Higher { func, .. } = prim {
        mark(func, used_later);
    }
    for arg in prim.args_mut() {
        mark(arg, used_later);
    }
}
