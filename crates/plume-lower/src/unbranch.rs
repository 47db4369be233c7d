//! Unbranching: flattening structured control into primitive-ready bodies.
//!
//! Consumes a type-and-mode-checked body and produces a statement list in
//! which every non-final statement is a call, foreign call, or `Nop`, and
//! the final statement (if any) is a conditional whose condition is a
//! single boolean test of a variable, with branches of the same shape.
//!
//! The compilation is continuation-passing: each construct is compiled
//! against a success continuation and (in test context) a failure
//! continuation. Semi-deterministic procedures gain a trailing boolean
//! output -- the success flag -- and become deterministic: success paths
//! write `true`, failure paths `false`. Loops are lifted into fresh `next`
//! and `brk` procedures; non-trivial continuations are lifted into fresh
//! procedures instead of being duplicated into both arms of a conditional;
//! anonymous procedures are hoisted to top-level closure procedures taking
//! their captures as leading parameters.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use plume_core::{
    ArgFlowType, Determinism, Exp, ExpNode, FlowDirection, ModulePath, Param,
    ProcDef, ProcId, ProcImpl, ProcProto, ProcSpec, ProcVariant, Spanned, Stmt,
    StmtNode, TypeSpec,
};
use tracing::debug;

use crate::info::ProcInfoTable;

/// Name of the success-flag output added to lowered semi-det procedures.
pub const SUCCESS_FLAG: &str = "succ#";

/// Continuations over the threshold are lifted into fresh procedures
/// rather than duplicated inline.
const CONT_INLINE_LIMIT: usize = 3;

/// A success or failure continuation: the statements to run next. Shared
/// so that lifting happens at most once per continuation.
#[derive(Clone)]
struct Cont(Rc<Vec<StmtNode>>);

impl Cont {
    fn of(stmts: Vec<StmtNode>) -> Self {
        Cont(Rc::new(stmts))
    }

    fn empty() -> Self {
        Cont(Rc::new(Vec::new()))
    }
}

/// The calls that `Next` and `Break` compile into inside a loop.
struct LoopCtx {
    next_call: StmtNode,
    brk_call: StmtNode,
}

/// Flattens one procedure. Generated procedures (lifted loops,
/// continuations, closures) are returned for the caller to add to the
/// module and process in turn.
pub fn unbranch_proc(
    info: &ProcInfoTable,
    def: &mut ProcDef,
    module_path: &ModulePath,
) -> Vec<ProcDef> {
    let ProcImpl::Source(stmts) = &mut def.impln else {
        return Vec::new();
    };
    let body = std::mem::take(stmts);

    let semidet = def.determinism == Determinism::SemiDet;
    if semidet {
        def.proto.params.push(Param::new(
            SUCCESS_FLAG,
            TypeSpec::bool(),
            FlowDirection::Out,
        ));
        def.var_types
            .insert(SUCCESS_FLAG.to_string(), TypeSpec::bool());
        def.determinism = Determinism::Det;
    }

    let outputs: Vec<Param> = def
        .proto
        .params
        .iter()
        .filter(|p| p.flow.flows_out())
        .cloned()
        .collect();

    let mut ub = Unbrancher {
        info,
        module_path: module_path.clone(),
        proc_name: def.proto.name.clone(),
        outputs,
        var_types: std::mem::take(&mut def.var_types),
        temp_count: def.temp_count,
        gen_count: 0,
        new_procs: Vec::new(),
        lifted: HashMap::new(),
    };

    let (cont, fail) = if semidet {
        (
            Cont::of(vec![set_flag_stmt(true)]),
            Some(Cont::of(vec![set_flag_stmt(false)])),
        )
    } else {
        (Cont::empty(), None)
    };
    let flat = ub.compile_stmts(&body, cont, fail, None);

    def.var_types = ub.var_types;
    def.temp_count = ub.temp_count;
    def.impln = ProcImpl::Source(flat);
    debug!(target: "unbranch", "{} unbranched, {} generated proc(s)",
           def.proto.name, ub.new_procs.len());
    ub.new_procs
}

/// `foreign llvm move(<flag>, ?succ#)`.
fn set_flag_stmt(value: bool) -> StmtNode {
    Spanned::unplaced(Stmt::Foreign {
        lang: "llvm".to_string(),
        name: "move".to_string(),
        flags: Vec::new(),
        args: vec![
            Spanned::unplaced(Exp::Typed {
                exp: Box::new(Spanned::unplaced(Exp::IntLit(value as i64))),
                ty: TypeSpec::bool(),
                cast: false,
            }),
            Spanned::unplaced(Exp::out_var(SUCCESS_FLAG)),
        ],
    })
}

struct Unbrancher<'a> {
    info: &'a ProcInfoTable,
    module_path: ModulePath,
    proc_name: String,
    outputs: Vec<Param>,
    var_types: BTreeMap<String, TypeSpec>,
    temp_count: u32,
    gen_count: u32,
    new_procs: Vec<ProcDef>,
    /// Continuations already lifted, keyed by shared-pointer identity.
    lifted: HashMap<usize, StmtNode>,
}

impl<'a> Unbrancher<'a> {
    fn fresh_tmp(&mut self, ty: TypeSpec) -> String {
        let name = plume_core::temp_name(self.temp_count);
        self.temp_count += 1;
        self.var_types.insert(name.clone(), ty);
        name
    }

    /// Materialises a continuation at a use site: inline when trivial,
    /// otherwise a call to a procedure lifted from it (once).
    fn use_cont(&mut self, cont: &Cont) -> Vec<StmtNode> {
        if cont.0.len() <= CONT_INLINE_LIMIT {
            return (*cont.0).clone();
        }
        let key = Rc::as_ptr(&cont.0) as usize;
        if let Some(call) = self.lifted.get(&key) {
            return vec![call.clone()];
        }
        let call = self.lift_proc("cont", (*cont.0).clone(), &[]);
        self.lifted.insert(key, call.clone());
        vec![call]
    }

    /// Creates a generated procedure from `body` and returns the call to
    /// it. Inputs are the body's free variables (plus `extra_reads`, used
    /// for `Break` statements that will become calls); outputs are the
    /// enclosing procedure's outputs.
    fn lift_proc(
        &mut self,
        kind: &str,
        body: Vec<StmtNode>,
        break_reads: &[String],
    ) -> StmtNode {
        let name = format!("{}${}{}", self.proc_name, kind, self.gen_count);
        self.gen_count += 1;

        let output_names: BTreeSet<String> =
            self.outputs.iter().map(|p| p.name.clone()).collect();
        let mut scan = FreeVarScan::new(break_reads.to_vec());
        scan.stmts(&body);
        let inputs: Vec<String> = scan
            .free
            .into_iter()
            .filter(|v| !output_names.contains(v))
            .collect();

        let mut params: Vec<Param> = inputs
            .iter()
            .map(|v| {
                Param::new(
                    v.clone(),
                    self.var_types.get(v).cloned().unwrap_or(TypeSpec::Any),
                    FlowDirection::In,
                )
            })
            .collect();
        params.extend(self.outputs.iter().cloned());

        let mut def = ProcDef::new(
            ProcProto::new(name.clone(), params),
            ProcImpl::Source(body),
            Determinism::Det,
        );
        def.variant = ProcVariant::Generated;
        def.temp_count = self.temp_count;
        def.var_types = self.var_types.clone();

        let args: Vec<ExpNode> = inputs
            .iter()
            .map(|v| Spanned::unplaced(Exp::in_var(v.clone())))
            .chain(
                self.outputs
                    .iter()
                    .map(|p| Spanned::unplaced(Exp::out_var(p.name.clone()))),
            )
            .collect();
        let call = Spanned::unplaced(Stmt::Call {
            module: self.module_path.clone(),
            name: name.clone(),
            id: Some(ProcId(0)),
            resourceful: false,
            args,
        });

        self.new_procs.push(def);
        debug!(target: "unbranch", "lifted {} proc {}", kind, name);
        call
    }

    fn compile_stmts(
        &mut self,
        stmts: &[StmtNode],
        cont: Cont,
        fail: Option<Cont>,
        lp: Option<&LoopCtx>,
    ) -> Vec<StmtNode> {
        let Some((first, rest)) = stmts.split_first() else {
            return self.use_cont(&cont);
        };
        let pos = first.pos.clone();
        match &first.node {
            Stmt::Call {
                module,
                name,
                id,
                resourceful,
                args,
            } => {
                let mut args = args.clone();
                for arg in &mut args {
                    self.hoist_closures(arg);
                }
                // A call that can fail compiles to the call with a fresh
                // success-flag output, then a test of the flag. The callee
                // gains the matching parameter when it is lowered itself
                // (det callees with a declared trailing bool output just
                // leave that argument implicit at the call site).
                let needs_flag = id
                    .and_then(|pid| {
                        self.info.lookup(&ProcSpec::local(
                            self.module_path.clone(),
                            name.clone(),
                            pid,
                        ))
                    })
                    .map(|callee| {
                        args.len() == callee.arity
                            && callee.determinism == Determinism::SemiDet
                            || args.len() + 1 == callee.arity
                    })
                    .unwrap_or(false);
                if needs_flag {
                    let fail = fail.clone().expect(
                        "mode checking admits failing calls only in test context",
                    );
                    let tv = self.fresh_tmp(TypeSpec::bool());
                    args.push(Spanned::unplaced(Exp::out_var(tv.clone())));
                    let call = Spanned::new(
                        Stmt::Call {
                            module: module.clone(),
                            name: name.clone(),
                            id: *id,
                            resourceful: *resourceful,
                            args,
                        },
                        pos.clone(),
                    );
                    let then = self.compile_stmts(rest, cont, Some(fail.clone()), lp);
                    let els = self.use_cont(&fail);
                    vec![
                        call,
                        Spanned::new(
                            Stmt::Cond {
                                test: Box::new(Spanned::unplaced(Stmt::TestBool(
                                    Spanned::unplaced(Exp::in_var(tv)),
                                ))),
                                then,
                                els,
                                cond_vars: None,
                                exit_vars: None,
                            },
                            pos,
                        ),
                    ]
                } else {
                    let call = Spanned::new(
                        Stmt::Call {
                            module: module.clone(),
                            name: name.clone(),
                            id: *id,
                            resourceful: *resourceful,
                            args,
                        },
                        pos,
                    );
                    let mut out = vec![call];
                    out.extend(self.compile_stmts(rest, cont, fail, lp));
                    out
                }
            }
            Stmt::Foreign { .. } => {
                let mut stmt = first.clone();
                if let Stmt::Foreign { args, .. } = &mut stmt.node {
                    for arg in args {
                        self.hoist_closures(arg);
                    }
                }
                let mut out = vec![stmt];
                out.extend(self.compile_stmts(rest, cont, fail, lp));
                out
            }
            Stmt::Nop => self.compile_stmts(rest, cont, fail, lp),
            Stmt::TestBool(exp) => {
                let fail = fail.expect("test outside of test context");
                let (mut out, var) = self.test_var(exp);
                let then = self.compile_stmts(rest, cont, Some(fail.clone()), lp);
                let els = self.use_cont(&fail);
                out.push(Spanned::new(
                    Stmt::Cond {
                        test: Box::new(Spanned::unplaced(Stmt::TestBool(
                            Spanned::unplaced(Exp::in_var(var)),
                        ))),
                        then,
                        els,
                        cond_vars: None,
                        exit_vars: None,
                    },
                    pos,
                ));
                out
            }
            Stmt::And(inner) => {
                let mut combined: Vec<StmtNode> = inner.clone();
                combined.extend_from_slice(rest);
                self.compile_stmts(&combined, cont, fail, lp)
            }
            Stmt::Or { alts, .. } => {
                let rest_cont =
                    Cont::of(self.compile_stmts(rest, cont, fail.clone(), lp));
                let mut current = fail.unwrap_or_else(Cont::empty);
                for alt in alts.iter().rev() {
                    let code = self.compile_stmts(
                        std::slice::from_ref(alt),
                        rest_cont.clone(),
                        Some(current),
                        lp,
                    );
                    current = Cont::of(code);
                }
                (*current.0).clone()
            }
            Stmt::Not(inner) => {
                let fail = fail.expect("negation outside of test context");
                let rest_code =
                    Cont::of(self.compile_stmts(rest, cont, Some(fail.clone()), lp));
                self.compile_stmts(
                    std::slice::from_ref(inner.as_ref()),
                    fail,
                    Some(rest_code),
                    lp,
                )
            }
            Stmt::Cond {
                test, then, els, ..
            } => {
                let rest_cont =
                    Cont::of(self.compile_stmts(rest, cont, fail.clone(), lp));
                let then_code =
                    self.compile_stmts(then, rest_cont.clone(), fail.clone(), lp);
                let els_code = self.compile_stmts(els, rest_cont, fail.clone(), lp);
                self.compile_stmts(
                    std::slice::from_ref(test.as_ref()),
                    Cont::of(then_code),
                    Some(Cont::of(els_code)),
                    lp,
                )
            }
            Stmt::Loop { body, .. } => {
                // The continuation of the loop is the break target.
                let k = self.compile_stmts(rest, cont, fail.clone(), lp);
                let brk_call = self.lift_proc("brk", k, &[]);
                let brk_reads: Vec<String> = call_input_vars(&brk_call);

                // The loop body becomes a fresh procedure calling itself
                // at `Next` (and at the end) and the break proc at
                // `Break`. Its parameters are the body's free variables.
                let name = format!("{}$next{}", self.proc_name, self.gen_count);
                self.gen_count += 1;
                let output_names: BTreeSet<String> =
                    self.outputs.iter().map(|p| p.name.clone()).collect();
                let mut scan = FreeVarScan::new(brk_reads);
                scan.stmts(body);
                let inputs: Vec<String> = scan
                    .free
                    .into_iter()
                    .filter(|v| !output_names.contains(v))
                    .collect();

                let next_args: Vec<ExpNode> = inputs
                    .iter()
                    .map(|v| Spanned::unplaced(Exp::in_var(v.clone())))
                    .chain(self.outputs.iter().map(|p| {
                        Spanned::unplaced(Exp::out_var(p.name.clone()))
                    }))
                    .collect();
                let next_call = Spanned::unplaced(Stmt::Call {
                    module: self.module_path.clone(),
                    name: name.clone(),
                    id: Some(ProcId(0)),
                    resourceful: false,
                    args: next_args,
                });

                let ctx = LoopCtx {
                    next_call: next_call.clone(),
                    brk_call,
                };
                let next_body = self.compile_stmts(
                    body,
                    Cont::of(vec![next_call.clone()]),
                    fail,
                    Some(&ctx),
                );

                let mut params: Vec<Param> = inputs
                    .iter()
                    .map(|v| {
                        Param::new(
                            v.clone(),
                            self.var_types.get(v).cloned().unwrap_or(TypeSpec::Any),
                            FlowDirection::In,
                        )
                    })
                    .collect();
                params.extend(self.outputs.iter().cloned());
                let mut def = ProcDef::new(
                    ProcProto::new(name, params),
                    ProcImpl::Source(next_body),
                    Determinism::Det,
                );
                def.variant = ProcVariant::Generated;
                def.temp_count = self.temp_count;
                def.var_types = self.var_types.clone();
                self.new_procs.push(def);

                vec![next_call]
            }
            Stmt::UseResources { body, .. } => {
                // Resources are already parameters; the scope wrapper has
                // served its purpose in mode checking.
                let mut combined: Vec<StmtNode> = body.clone();
                combined.extend_from_slice(rest);
                self.compile_stmts(&combined, cont, fail, lp)
            }
            Stmt::Fail => {
                // Code already emitted for earlier alternatives stays; a
                // failure simply continues into the failure continuation.
                match fail {
                    Some(f) => self.use_cont(&f),
                    None => Vec::new(),
                }
            }
            Stmt::Break => {
                let ctx = lp.expect("break outside a loop survived mode checking");
                vec![ctx.brk_call.clone()]
            }
            Stmt::Next => {
                let ctx = lp.expect("next outside a loop survived mode checking");
                vec![ctx.next_call.clone()]
            }
            Stmt::Case { .. } => {
                unreachable!("Case statements are eliminated before the middle-end")
            }
        }
    }

    /// Ensures the test expression is a variable, introducing a temporary
    /// move when it is a constant.
    fn test_var(&mut self, exp: &ExpNode) -> (Vec<StmtNode>, String) {
        if let Some(name) = exp.node.var_name() {
            return (Vec::new(), name.to_string());
        }
        let tv = self.fresh_tmp(TypeSpec::bool());
        let mv = Spanned::unplaced(Stmt::Foreign {
            lang: "llvm".to_string(),
            name: "move".to_string(),
            flags: Vec::new(),
            args: vec![
                Spanned::unplaced(Exp::Typed {
                    exp: Box::new(exp.clone()),
                    ty: TypeSpec::bool(),
                    cast: false,
                }),
                Spanned::unplaced(Exp::out_var(tv.clone())),
            ],
        });
        (vec![mv], tv)
    }

    /// Replaces an anonymous procedure argument with a reference to a
    /// hoisted top-level closure procedure whose leading parameters are
    /// the captured variables.
    fn hoist_closures(&mut self, arg: &mut ExpNode) {
        match &mut arg.node {
            Exp::AnonProc { mods, params, body } => {
                let param_names: BTreeSet<String> =
                    params.iter().map(|p| p.name.clone()).collect();
                let mut scan = FreeVarScan::new(Vec::new());
                scan.written.extend(param_names);
                scan.stmts(body);
                let captures: Vec<String> = scan.free.into_iter().collect();

                let name = format!(
                    "{}$closure{}",
                    self.proc_name, self.gen_count
                );
                self.gen_count += 1;

                let mut cl_params: Vec<Param> = captures
                    .iter()
                    .map(|v| Param {
                        name: v.clone(),
                        ty: self.var_types.get(v).cloned().unwrap_or(TypeSpec::Any),
                        flow: FlowDirection::In,
                        flow_type: ArgFlowType::Free,
                    })
                    .collect();
                cl_params.extend(params.iter().cloned());

                let mut def = ProcDef::new(
                    ProcProto::new(name.clone(), cl_params),
                    ProcImpl::Source(std::mem::take(body)),
                    mods.determinism,
                );
                def.variant = ProcVariant::Closure;
                def.impurity = mods.impurity;
                def.var_types = self.var_types.clone();
                self.new_procs.push(def);
                debug!(target: "unbranch", "hoisted closure {}", name);

                let spec = ProcSpec::local(
                    self.module_path.clone(),
                    name,
                    ProcId(0),
                );
                arg.node = Exp::ProcRef {
                    spec,
                    closed: captures
                        .iter()
                        .map(|v| Spanned::unplaced(Exp::in_var(v.clone())))
                        .collect(),
                };
            }
            Exp::Typed { exp, .. } => self.hoist_closures(exp),
            _ => {}
        }
    }
}

/// Input variables of a lifted-procedure call statement.
fn call_input_vars(call: &StmtNode) -> Vec<String> {
    let Stmt::Call { args, .. } = &call.node else {
        return Vec::new();
    };
    args.iter()
        .filter(|a| a.node.var_flow().is_some_and(|f| f.flows_in()))
        .filter_map(|a| a.node.var_name().map(str::to_string))
        .collect()
}

/// Sequential free-variable analysis: a variable read before this scan has
/// seen a write of it is free. `Break` statements read `break_reads`.
struct FreeVarScan {
    free: BTreeSet<String>,
    written: BTreeSet<String>,
    break_reads: Vec<String>,
}

impl FreeVarScan {
    fn new(break_reads: Vec<String>) -> Self {
        FreeVarScan {
            free: BTreeSet::new(),
            written: BTreeSet::new(),
            break_reads,
        }
    }

    fn read(&mut self, var: &str) {
        if !self.written.contains(var) {
            self.free.insert(var.to_string());
        }
    }

    fn exp(&mut self, exp: &ExpNode) {
        match &exp.node {
            Exp::Var { name, flow, .. } => {
                if flow.flows_out() {
                    self.written.insert(name.clone());
                } else {
                    self.read(name);
                }
            }
            Exp::Typed { exp, .. } => self.exp(exp),
            Exp::ProcRef { closed, .. } => {
                for e in closed {
                    self.exp(e);
                }
            }
            Exp::AnonProc { params, body, .. } => {
                let mut inner = FreeVarScan::new(Vec::new());
                inner.written = self.written.clone();
                inner
                    .written
                    .extend(params.iter().map(|p| p.name.clone()));
                inner.stmts(body);
                self.free.extend(inner.free);
            }
            Exp::IntLit(_) | Exp::FloatLit(_) | Exp::StrLit(_) | Exp::CharLit(_) => {}
        }
    }

    fn stmts(&mut self, stmts: &[StmtNode]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &StmtNode) {
        match &stmt.node {
            Stmt::Call { args, .. } | Stmt::Foreign { args, .. } => {
                for a in args {
                    self.exp(a);
                }
            }
            Stmt::TestBool(exp) => self.exp(exp),
            Stmt::And(inner) => self.stmts(inner),
            Stmt::Or { alts, .. } => {
                let before = self.written.clone();
                let mut common: Option<BTreeSet<String>> = None;
                for alt in alts {
                    let mut branch = FreeVarScan::new(self.break_reads.clone());
                    branch.written = before.clone();
                    branch.stmt(alt);
                    self.free.extend(branch.free);
                    let wrote: BTreeSet<String> =
                        branch.written.difference(&before).cloned().collect();
                    common = Some(match common {
                        None => wrote,
                        Some(c) => c.intersection(&wrote).cloned().collect(),
                    });
                }
                if let Some(c) = common {
                    self.written.extend(c);
                }
            }
            Stmt::Not(inner) => {
                let mut branch = FreeVarScan::new(self.break_reads.clone());
                branch.written = self.written.clone();
                branch.stmt(inner);
                self.free.extend(branch.free);
            }
            Stmt::Cond {
                test, then, els, ..
            } => {
                let before = self.written.clone();
                let mut test_scan = FreeVarScan::new(self.break_reads.clone());
                test_scan.written = before.clone();
                test_scan.stmt(test);
                self.free.extend(test_scan.free.iter().cloned());

                let mut then_scan = FreeVarScan::new(self.break_reads.clone());
                then_scan.written = test_scan.written.clone();
                then_scan.stmts(then);
                self.free.extend(then_scan.free);

                let mut els_scan = FreeVarScan::new(self.break_reads.clone());
                els_scan.written = before.clone();
                els_scan.stmts(els);
                self.free.extend(els_scan.free);

                let joined: BTreeSet<String> = then_scan
                    .written
                    .intersection(&els_scan.written)
                    .cloned()
                    .collect();
                self.written.extend(joined);
            }
            Stmt::Loop { body, .. } => {
                let mut branch = FreeVarScan::new(self.break_reads.clone());
                branch.written = self.written.clone();
                branch.stmts(body);
                self.free.extend(branch.free);
            }
            Stmt::UseResources { body, .. } => self.stmts(body),
            Stmt::Break => {
                let reads = self.break_reads.clone();
                for v in reads {
                    self.read(&v);
                }
            }
            Stmt::Nop | Stmt::Fail | Stmt::Next => {}
            Stmt::Case { .. } => {
                unreachable!("Case statements are eliminated before the middle-end")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::Module;

    fn call(name: &str, args: Vec<Exp>) -> StmtNode {
        Spanned::unplaced(Stmt::Call {
            module: ModulePath::local(),
            name: name.into(),
            id: Some(ProcId(0)),
            resourceful: false,
            args: args.into_iter().map(Spanned::unplaced).collect(),
        })
    }

    fn det_proc(name: &str, params: Vec<Param>, body: Vec<StmtNode>) -> ProcDef {
        ProcDef::new(
            ProcProto::new(name, params),
            ProcImpl::Source(body),
            Determinism::Det,
        )
    }

    fn stmt_names(stmts: &[StmtNode]) -> Vec<String> {
        stmts
            .iter()
            .map(|s| match &s.node {
                Stmt::Call { name, .. } => name.clone(),
                Stmt::Foreign { name, .. } => format!("foreign {}", name),
                Stmt::Cond { .. } => "cond".into(),
                other => format!("{:?}", other).split(' ').next().unwrap().into(),
            })
            .collect()
    }

    #[test]
    fn flat_body_passes_through() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(det_proc("step", vec![], vec![]));
        let info = ProcInfoTable::from_module(&m);
        let mut def = det_proc("caller", vec![], vec![call("step", vec![])]);
        let new = unbranch_proc(&info, &mut def, &m.path);
        assert!(new.is_empty());
        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        assert_eq!(stmt_names(stmts), vec!["step"]);
    }

    #[test]
    fn semidet_proc_gains_success_flag() {
        let m = Module::new(ModulePath::from_name("m"));
        let info = ProcInfoTable::from_module(&m);
        let mut def = ProcDef::new(
            ProcProto::new(
                "check",
                vec![Param::new("b", TypeSpec::bool(), FlowDirection::In)],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::TestBool(
                Spanned::unplaced(Exp::in_var("b")),
            ))]),
            Determinism::SemiDet,
        );
        unbranch_proc(&info, &mut def, &m.path);

        // One extra bool output, and the proc is now det.
        assert_eq!(def.proto.params.len(), 2);
        let flag = &def.proto.params[1];
        assert_eq!(flag.name, SUCCESS_FLAG);
        assert_eq!(flag.ty, TypeSpec::bool());
        assert!(flag.flow.flows_out());
        assert_eq!(def.determinism, Determinism::Det);

        // Body: a Cond on b whose arms set the flag.
        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        assert_eq!(stmts.len(), 1);
        let Stmt::Cond { test, then, els, .. } = &stmts[0].node else {
            panic!("expected cond, got {:?}", stmts[0].node)
        };
        assert!(matches!(test.node, Stmt::TestBool(_)));
        assert_eq!(stmt_names(then), vec!["foreign move"]);
        assert_eq!(stmt_names(els), vec!["foreign move"]);
    }

    #[test]
    fn loop_lifts_next_and_brk() {
        // do { if b:: break; c } d  with d non-trivial.
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(det_proc("c", vec![], vec![]));
        m.add_proc(det_proc("d1", vec![], vec![]));
        m.add_proc(det_proc("d2", vec![], vec![]));
        m.add_proc(det_proc("d3", vec![], vec![]));
        m.add_proc(det_proc("d4", vec![], vec![]));
        let info = ProcInfoTable::from_module(&m);

        let body = vec![
            Spanned::unplaced(Stmt::Loop {
                body: vec![
                    Spanned::unplaced(Stmt::Cond {
                        test: Box::new(Spanned::unplaced(Stmt::TestBool(
                            Spanned::unplaced(Exp::in_var("b")),
                        ))),
                        then: vec![Spanned::unplaced(Stmt::Break)],
                        els: vec![],
                        cond_vars: None,
                        exit_vars: None,
                    }),
                    call("c", vec![]),
                ],
                exit_vars: None,
            }),
            call("d1", vec![]),
            call("d2", vec![]),
            call("d3", vec![]),
            call("d4", vec![]),
        ];
        let mut def = det_proc(
            "run",
            vec![Param::new("b", TypeSpec::bool(), FlowDirection::In)],
            body,
        );
        def.var_types.insert("b".into(), TypeSpec::bool());
        let new = unbranch_proc(&info, &mut def, &m.path);

        // Two generated procs: the break continuation and the loop body.
        assert_eq!(new.len(), 2);
        let brk = &new[0];
        let next = &new[1];
        assert!(brk.proto.name.starts_with("run$brk"));
        assert!(next.proto.name.starts_with("run$next"));
        assert_eq!(brk.variant, ProcVariant::Generated);

        // brk holds the continuation d1..d4.
        let ProcImpl::Source(brk_body) = &brk.impln else { panic!() };
        assert_eq!(stmt_names(brk_body), vec!["d1", "d2", "d3", "d4"]);

        // next: if b then call brk else { c; next }.
        let ProcImpl::Source(next_body) = &next.impln else { panic!() };
        let Stmt::Cond { then, els, .. } = &next_body[0].node else {
            panic!("expected cond at head of next")
        };
        assert_eq!(stmt_names(then), vec![brk.proto.name.clone()]);
        assert_eq!(
            stmt_names(els),
            vec!["c".to_string(), next.proto.name.clone()]
        );

        // The caller body reduces to one call of next.
        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        assert_eq!(stmt_names(stmts), vec![next.proto.name.clone()]);
    }

    #[test]
    fn short_continuation_duplicates_inline() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(det_proc("a", vec![], vec![]));
        m.add_proc(det_proc("tail", vec![], vec![]));
        let info = ProcInfoTable::from_module(&m);

        let body = vec![
            Spanned::unplaced(Stmt::Cond {
                test: Box::new(Spanned::unplaced(Stmt::TestBool(
                    Spanned::unplaced(Exp::in_var("b")),
                ))),
                then: vec![call("a", vec![])],
                els: vec![],
                cond_vars: None,
                exit_vars: None,
            }),
            call("tail", vec![]),
        ];
        let mut def = det_proc(
            "run",
            vec![Param::new("b", TypeSpec::bool(), FlowDirection::In)],
            body,
        );
        let new = unbranch_proc(&info, &mut def, &m.path);
        assert!(new.is_empty(), "short continuation must not lift");

        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        let Stmt::Cond { then, els, .. } = &stmts[0].node else { panic!() };
        // tail appears in both arms.
        assert_eq!(stmt_names(then), vec!["a", "tail"]);
        assert_eq!(stmt_names(els), vec!["tail"]);
    }

    #[test]
    fn long_continuation_lifts_once() {
        let mut m = Module::new(ModulePath::from_name("m"));
        for n in ["a", "t1", "t2", "t3", "t4"] {
            m.add_proc(det_proc(n, vec![], vec![]));
        }
        let info = ProcInfoTable::from_module(&m);

        let body = vec![
            Spanned::unplaced(Stmt::Cond {
                test: Box::new(Spanned::unplaced(Stmt::TestBool(
                    Spanned::unplaced(Exp::in_var("b")),
                ))),
                then: vec![call("a", vec![])],
                els: vec![],
                cond_vars: None,
                exit_vars: None,
            }),
            call("t1", vec![]),
            call("t2", vec![]),
            call("t3", vec![]),
            call("t4", vec![]),
        ];
        let mut def = det_proc(
            "run",
            vec![Param::new("b", TypeSpec::bool(), FlowDirection::In)],
            body,
        );
        let new = unbranch_proc(&info, &mut def, &m.path);
        assert_eq!(new.len(), 1, "continuation lifted exactly once");
        assert!(new[0].proto.name.starts_with("run$cont"));

        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        let Stmt::Cond { then, els, .. } = &stmts[0].node else { panic!() };
        let cont_name = new[0].proto.name.clone();
        assert_eq!(stmt_names(then), vec!["a".to_string(), cont_name.clone()]);
        assert_eq!(stmt_names(els), vec![cont_name]);
    }

    #[test]
    fn semidet_call_gets_flag_and_test() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(ProcDef::new(
            ProcProto::new(
                "check",
                vec![Param::new("x", TypeSpec::int(), FlowDirection::In)],
            ),
            ProcImpl::Source(vec![]),
            Determinism::SemiDet,
        ));
        let info = ProcInfoTable::from_module(&m);

        let mut def = ProcDef::new(
            ProcProto::new(
                "caller",
                vec![Param::new("x", TypeSpec::int(), FlowDirection::In)],
            ),
            ProcImpl::Source(vec![call("check", vec![Exp::in_var("x")])]),
            Determinism::SemiDet,
        );
        unbranch_proc(&info, &mut def, &m.path);

        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        // call check(x, ?tmp); if tmp :: succ# := true | succ# := false
        let Stmt::Call { name, args, .. } = &stmts[0].node else { panic!() };
        assert_eq!(name, "check");
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].node.var_flow(), Some(FlowDirection::Out));
        let Stmt::Cond { .. } = &stmts[1].node else {
            panic!("flag test expected")
        };
    }

    #[test]
    fn anon_proc_hoists_with_captures() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(det_proc(
            "apply",
            vec![
                Param::new("f", TypeSpec::Any, FlowDirection::In),
                Param::new("r", TypeSpec::int(), FlowDirection::Out),
            ],
            vec![],
        ));
        let info = ProcInfoTable::from_module(&m);

        let anon = Exp::AnonProc {
            mods: Default::default(),
            params: vec![
                Param::new("y", TypeSpec::int(), FlowDirection::In),
                Param::new("z", TypeSpec::int(), FlowDirection::Out),
            ],
            body: vec![Spanned::unplaced(Stmt::Foreign {
                lang: "llvm".into(),
                name: "add".into(),
                flags: vec![],
                args: vec![
                    Spanned::unplaced(Exp::in_var("y")),
                    Spanned::unplaced(Exp::in_var("captured")),
                    Spanned::unplaced(Exp::out_var("z")),
                ],
            })],
        };
        let mut def = det_proc(
            "outer",
            vec![
                Param::new("captured", TypeSpec::int(), FlowDirection::In),
                Param::new("r", TypeSpec::int(), FlowDirection::Out),
            ],
            vec![call("apply", vec![anon, Exp::out_var("r")])],
        );
        def.var_types.insert("captured".into(), TypeSpec::int());
        let new = unbranch_proc(&info, &mut def, &m.path);

        assert_eq!(new.len(), 1);
        let closure = &new[0];
        assert_eq!(closure.variant, ProcVariant::Closure);
        // Leading captured param marked Free, then y and z.
        assert_eq!(closure.proto.params[0].name, "captured");
        assert_eq!(closure.proto.params[0].flow_type, ArgFlowType::Free);
        assert_eq!(closure.proto.params[1].name, "y");

        // The call site now passes a proc reference closing over captured.
        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        let Stmt::Call { args, .. } = &stmts[0].node else { panic!() };
        let Exp::ProcRef { spec, closed } = &args[0].node else {
            panic!("expected hoisted proc ref")
        };
        assert!(spec.name.starts_with("outer$closure"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].node.var_name(), Some("captured"));
    }

    #[test]
    fn negation_swaps_continuations() {
        let m = Module::new(ModulePath::from_name("m"));
        let info = ProcInfoTable::from_module(&m);
        let mut def = ProcDef::new(
            ProcProto::new(
                "notb",
                vec![Param::new("b", TypeSpec::bool(), FlowDirection::In)],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Not(Box::new(
                Spanned::unplaced(Stmt::TestBool(Spanned::unplaced(Exp::in_var(
                    "b",
                )))),
            )))]),
            Determinism::SemiDet,
        );
        unbranch_proc(&info, &mut def, &m.path);

        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        let Stmt::Cond { then, els, .. } = &stmts[0].node else { panic!() };
        // b true -> the test fails -> flag false; b false -> flag true.
        let Stmt::Foreign { args, .. } = &then[0].node else { panic!() };
        let Exp::Typed { exp, .. } = &args[0].node else { panic!() };
        assert_eq!(exp.node, Exp::IntLit(0));
        let Stmt::Foreign { args, .. } = &els[0].node else { panic!() };
        let Exp::Typed { exp, .. } = &args[0].node else { panic!() };
        assert_eq!(exp.node, Exp::IntLit(1));
    }

    #[test]
    fn unbranched_shape_invariant() {
        // Whatever comes out: only flat statements, Cond last, tests are
        // single TestBool of a variable.
        fn assert_shape(stmts: &[StmtNode]) {
            for (i, s) in stmts.iter().enumerate() {
                match &s.node {
                    Stmt::Call { .. } | Stmt::Foreign { .. } | Stmt::Nop => {}
                    Stmt::Cond { test, then, els, .. } => {
                        assert_eq!(i, stmts.len() - 1, "Cond must be final");
                        let Stmt::TestBool(exp) = &test.node else {
                            panic!("cond test must be TestBool")
                        };
                        assert!(exp.node.var_name().is_some());
                        assert_shape(then);
                        assert_shape(els);
                    }
                    other => panic!("structured statement survived: {:?}", other),
                }
            }
        }

        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(det_proc("w", vec![], vec![]));
        let info = ProcInfoTable::from_module(&m);
        let mut def = ProcDef::new(
            ProcProto::new(
                "shape",
                vec![
                    Param::new("p", TypeSpec::bool(), FlowDirection::In),
                    Param::new("q", TypeSpec::bool(), FlowDirection::In),
                ],
            ),
            ProcImpl::Source(vec![
                Spanned::unplaced(Stmt::Or {
                    alts: vec![
                        Spanned::unplaced(Stmt::TestBool(Spanned::unplaced(
                            Exp::in_var("p"),
                        ))),
                        Spanned::unplaced(Stmt::TestBool(Spanned::unplaced(
                            Exp::in_var("q"),
                        ))),
                    ],
                    exit_vars: None,
                }),
                call("w", vec![]),
            ]),
            Determinism::SemiDet,
        );
        unbranch_proc(&info, &mut def, &m.path);
        let ProcImpl::Source(stmts) = &def.impln else { panic!() };
        assert_shape(stmts);
    }
}
