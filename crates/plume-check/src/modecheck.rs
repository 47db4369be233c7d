//! Phase 2 of checking: mode resolution.
//!
//! Re-traverses a body with types fixed, selects the procedure variant for
//! each call from the actual argument modes, rewrites argument flow
//! directions, and threads a [`BindingState`] through every statement.
//!
//! Statements whose inputs are not yet bound are *delayed*: held in a
//! worklist keyed by the awaited variable set and re-examined whenever a
//! commitment binds new variables. This is what reorders statements by data
//! dependency. A statement still waiting at the end of its sequence reports
//! uninitialised inputs.

use std::collections::BTreeMap;

use plume_core::{
    Determinism, Diagnostic, ErrorKind, Exp, ExpNode, FlowDirection, Module,
    ProcDef, ProcId, SourcePos, Stmt, StmtNode, TypeSpec, VarSet,
};
use tracing::{debug, trace};

use crate::binding::BindingState;
use crate::foreign::{self, ForeignArg};

/// Mode-checks one procedure, rewriting its body statements in place.
pub fn mode_check_proc(module: &Module, def: &mut ProcDef) -> Vec<Diagnostic> {
    let plume_core::ProcImpl::Source(stmts) = &mut def.impln else {
        return Vec::new();
    };
    let body = std::mem::take(stmts);

    let mut entry_vars = VarSet::new();
    let mut resources = VarSet::new();
    for param in &def.proto.params {
        if param.flow.flows_in() {
            entry_vars.insert(param.name.clone());
        }
        if param.flow_type == plume_core::ArgFlowType::Resource {
            resources.insert(param.name.clone());
        }
    }

    // Everything some statement could ever bind: parameters plus every
    // output-flow variable occurrence. Waiting on anything else is a
    // reference to a variable that simply does not exist.
    let mut bindable: VarSet =
        def.proto.params.iter().map(|p| p.name.clone()).collect();
    for stmt in &body {
        collect_bindable(stmt, &mut bindable);
    }

    let mut checker = ModeChecker {
        module,
        var_types: def.var_types.clone(),
        diags: Vec::new(),
        loop_breaks: Vec::new(),
        resources,
        bindable,
    };

    let mut out = Vec::new();
    let state = checker.check_stmts(
        body,
        BindingState::entry(entry_vars),
        def.determinism,
        &mut out,
    );

    // Every output must be bound wherever the body can succeed.
    if state.can_succeed() {
        let bound = state.vars();
        for param in def.proto.params.iter().filter(|p| p.flow.flows_out()) {
            if !bound.contains(&param.name) {
                let kind = if param.flow_type == plume_core::ArgFlowType::Resource {
                    ErrorKind::ResourceOutputNotBound {
                        resource: param.name.clone(),
                    }
                } else {
                    ErrorKind::UninitialisedInput {
                        name: param.name.clone(),
                    }
                };
                checker.diags.push(Diagnostic::new(def.pos.clone(), kind));
            }
        }
    }

    def.impln = plume_core::ProcImpl::Source(out);
    debug!(target: "modes", "mode checked {} with {} diagnostics",
           def.proto.name, checker.diags.len());
    checker.diags
}

/// The actual mode of one argument at a call site.
struct Actual {
    var: Option<String>,
    flow: FlowDirection,
    available: bool,
}

struct ModeChecker<'a> {
    module: &'a Module,
    var_types: BTreeMap<String, TypeSpec>,
    diags: Vec<Diagnostic>,
    /// One frame per enclosing loop, collecting the states at its `Break`s.
    loop_breaks: Vec<Vec<BindingState>>,
    /// Resource parameter names usable at this point.
    resources: VarSet,
    /// Variables some statement or parameter can bind.
    bindable: VarSet,
}

type Delayed = Vec<(VarSet, StmtNode)>;

impl<'a> ModeChecker<'a> {
    fn check_stmts(
        &mut self,
        stmts: Vec<StmtNode>,
        mut state: BindingState,
        det: Determinism,
        out: &mut Vec<StmtNode>,
    ) -> BindingState {
        let mut delayed: Delayed = Vec::new();
        for stmt in stmts {
            state = self.check_stmt(stmt, state, det, out, &mut delayed);
        }
        for (await_set, stmt) in delayed {
            for var in await_set {
                let kind = if self.bindable.contains(&var) {
                    ErrorKind::UninitialisedInput { name: var }
                } else {
                    ErrorKind::UnknownVariable { name: var }
                };
                self.diags.push(Diagnostic::new(stmt.pos.clone(), kind));
            }
        }
        state
    }

    /// Re-examines delayed statements after new bindings.
    fn drain(
        &mut self,
        mut state: BindingState,
        det: Determinism,
        out: &mut Vec<StmtNode>,
        delayed: &mut Delayed,
    ) -> BindingState {
        loop {
            let bound = state.vars();
            let Some(i) = delayed
                .iter()
                .position(|(awaits, _)| awaits.is_subset(&bound))
            else {
                return state;
            };
            let (_, stmt) = delayed.remove(i);
            trace!(target: "modes", "resuming delayed statement");
            state = self.check_stmt(stmt, state, det, out, delayed);
        }
    }

    fn check_stmt(
        &mut self,
        stmt: StmtNode,
        state: BindingState,
        det: Determinism,
        out: &mut Vec<StmtNode>,
        delayed: &mut Delayed,
    ) -> BindingState {
        let pos = stmt.pos.clone();
        match stmt.node {
            Stmt::Call {
                module,
                name,
                id,
                resourceful,
                args,
            } => self.check_call(
                module, name, id, resourceful, args, pos, state, det, out, delayed,
            ),
            Stmt::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                self.check_foreign(lang, name, flags, args, pos, state, det, out, delayed)
            }
            Stmt::TestBool(exp) => {
                if det == Determinism::Det {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::DeterminismViolation {
                            name: "<test>".to_string(),
                            callee: Determinism::SemiDet,
                            context: det,
                        },
                    ));
                }
                if let Some(var) = exp.node.var_name() {
                    if !state.is_bound(var) {
                        let mut awaits = VarSet::new();
                        awaits.insert(var.to_string());
                        delayed.push((
                            awaits,
                            StmtNode::new(Stmt::TestBool(exp), pos),
                        ));
                        return state;
                    }
                }
                out.push(StmtNode::new(Stmt::TestBool(exp), pos));
                state.seq_semidet(Vec::new())
            }
            Stmt::And(stmts) => self.check_stmts(stmts, state, det, out),
            Stmt::Or { alts, .. } => {
                let mut checked = Vec::new();
                let mut exit: Option<BindingState> = None;
                let entry_bound = state.vars();
                for alt in alts {
                    let mut alt_out = Vec::new();
                    let alt_state = self.check_stmts(
                        vec![alt],
                        state.clone(),
                        Determinism::SemiDet,
                        &mut alt_out,
                    );
                    checked.push(reconstitute(alt_out));
                    exit = Some(match exit {
                        Some(e) => e.join(&alt_state),
                        None => alt_state,
                    });
                }
                let exit = exit.unwrap_or_else(|| state.clone().seq_unreachable());
                let exit_vars: VarSet =
                    exit.vars().difference(&entry_bound).cloned().collect();
                out.push(StmtNode::new(
                    Stmt::Or {
                        alts: checked,
                        exit_vars: Some(exit_vars),
                    },
                    pos,
                ));
                exit
            }
            Stmt::Not(inner) => {
                let mut inner_out = Vec::new();
                self.check_stmts(
                    vec![*inner],
                    state.clone(),
                    Determinism::SemiDet,
                    &mut inner_out,
                );
                out.push(StmtNode::new(
                    Stmt::Not(Box::new(reconstitute(inner_out))),
                    pos,
                ));
                // A negation exports no bindings and may fail.
                state.seq_semidet(Vec::new())
            }
            Stmt::Cond {
                test,
                then,
                els,
                ..
            } => {
                let entry_bound = state.vars();
                let mut test_out = Vec::new();
                let test_state = self.check_stmts(
                    vec![*test],
                    state.clone(),
                    Determinism::SemiDet,
                    &mut test_out,
                );
                let cond_vars: VarSet = test_state
                    .vars()
                    .difference(&entry_bound)
                    .cloned()
                    .collect();

                let mut then_out = Vec::new();
                let then_state =
                    self.check_stmts(then, test_state, det, &mut then_out);
                let mut els_out = Vec::new();
                let els_state =
                    self.check_stmts(els, state.clone(), det, &mut els_out);

                let exit = then_state.join(&els_state);
                let exit_vars: VarSet =
                    exit.vars().difference(&entry_bound).cloned().collect();
                out.push(StmtNode::new(
                    Stmt::Cond {
                        test: Box::new(reconstitute(test_out)),
                        then: then_out,
                        els: els_out,
                        cond_vars: Some(cond_vars),
                        exit_vars: Some(exit_vars),
                    },
                    pos,
                ));
                exit
            }
            Stmt::Loop { body, .. } => {
                self.loop_breaks.push(Vec::new());
                let mut body_out = Vec::new();
                self.check_stmts(body, state.clone(), det, &mut body_out);
                let breaks = self.loop_breaks.pop().expect("pushed above");
                // A loop with no break cannot be left.
                let exit = breaks
                    .into_iter()
                    .fold(BindingState::Impossible, |acc, b| acc.join(&b));
                let exit_vars: VarSet = exit.vars();
                out.push(StmtNode::new(
                    Stmt::Loop {
                        body: body_out,
                        exit_vars: Some(exit_vars),
                    },
                    pos,
                ));
                exit
            }
            Stmt::UseResources { resources, body } => {
                let added: Vec<String> = resources
                    .iter()
                    .map(|r| r.name.clone())
                    .filter(|n| self.resources.insert(n.clone()))
                    .collect();
                let mut inner_state = state;
                inner_state.bind_all(resources.iter().map(|r| r.name.clone()));
                let mut body_out = Vec::new();
                let end = self.check_stmts(body, inner_state, det, &mut body_out);
                for name in added {
                    self.resources.remove(&name);
                }
                out.push(StmtNode::new(
                    Stmt::UseResources {
                        resources,
                        body: body_out,
                    },
                    pos,
                ));
                end
            }
            Stmt::Nop => {
                out.push(StmtNode::new(Stmt::Nop, pos));
                state
            }
            Stmt::Fail => {
                out.push(StmtNode::new(Stmt::Fail, pos));
                state.seq_unreachable()
            }
            Stmt::Break => {
                match self.loop_breaks.last_mut() {
                    Some(frame) => frame.push(state.clone()),
                    None => self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::LoopControlOutsideLoop {
                            stmt: "break".to_string(),
                        },
                    )),
                }
                out.push(StmtNode::new(Stmt::Break, pos));
                state.seq_unreachable()
            }
            Stmt::Next => {
                if self.loop_breaks.is_empty() {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::LoopControlOutsideLoop {
                            stmt: "next".to_string(),
                        },
                    ));
                }
                out.push(StmtNode::new(Stmt::Next, pos));
                state.seq_unreachable()
            }
            Stmt::Case { .. } => {
                unreachable!("Case statements are eliminated before the middle-end")
            }
        }
    }

    /// Mode resolution for one call, per the exact-match / delayable-match
    /// / no-match cascade.
    #[allow(clippy::too_many_arguments)]
    fn check_call(
        &mut self,
        path: plume_core::ModulePath,
        name: String,
        id: Option<ProcId>,
        resourceful: bool,
        mut args: Vec<ExpNode>,
        pos: Option<SourcePos>,
        state: BindingState,
        det: Determinism,
        out: &mut Vec<StmtNode>,
        delayed: &mut Delayed,
    ) -> BindingState {
        let candidates: Vec<ProcId> = match id {
            Some(pid) => vec![pid],
            None => (0..self.module.overloads(&name).len() as u32)
                .map(ProcId)
                .collect(),
        };
        if candidates.is_empty() {
            // Phase 1 reported the unknown procedure.
            return state;
        }

        let actuals: Vec<Actual> = args
            .iter()
            .map(|arg| self.actual_of(arg, &state))
            .collect();

        // Explicit inputs that are not bound yet: wait for them.
        let rigid_awaits: VarSet = actuals
            .iter()
            .filter(|a| a.flow.flows_in() && !a.available)
            .filter_map(|a| a.var.clone())
            .collect();
        if !rigid_awaits.is_empty() {
            delayed.push((
                rigid_awaits,
                StmtNode::new(
                    Stmt::Call {
                        module: path,
                        name,
                        id,
                        resourceful,
                        args,
                    },
                    pos,
                ),
            ));
            return state;
        }

        let flexible: Vec<String> = actuals
            .iter()
            .filter(|a| a.flow == FlowDirection::Unknown && !a.available)
            .filter_map(|a| a.var.clone())
            .collect();

        // Candidates surviving the type filter, matched under a chosen
        // treatment of unbound unknown-flow arguments.
        let matching = |treat_flex_as_out: bool| -> Vec<ProcId> {
            candidates
                .iter()
                .copied()
                .filter(|pid| {
                    self.modes_match(&name, *pid, &actuals, det, treat_flex_as_out)
                })
                .collect()
        };

        let chosen: Option<ProcId> = if flexible.is_empty() {
            let found = matching(false);
            match found.first() {
                Some(pid) => Some(*pid),
                None => {
                    self.report_no_mode(&name, &candidates, &actuals, det, &pos);
                    None
                }
            }
        } else {
            let as_out = matching(true);
            let as_in = matching(false);
            match (as_out.is_empty(), as_in.is_empty()) {
                (false, true) => Some(as_out[0]),
                (true, true) => {
                    self.report_no_mode(&name, &candidates, &actuals, det, &pos);
                    None
                }
                // The unknowns could commit either way: wait until they are
                // bound, then they are inputs.
                _ => {
                    delayed.push((
                        flexible.into_iter().collect(),
                        StmtNode::new(
                            Stmt::Call {
                                module: path,
                                name,
                                id,
                                resourceful,
                                args,
                            },
                            pos,
                        ),
                    ));
                    return state;
                }
            }
        };

        let Some(pid) = chosen else {
            // Errors already reported; keep the statement for downstream
            // printing but leave flows as written.
            out.push(StmtNode::new(
                Stmt::Call {
                    module: path,
                    name,
                    id,
                    resourceful,
                    args,
                },
                pos,
            ));
            return state;
        };

        let callee = &self.module.overloads(&name)[pid.0 as usize];
        let callee_det = callee.determinism;
        let params = callee.proto.params.clone();

        // Rewrite argument flows from the chosen candidate.
        let mut outputs = Vec::new();
        for (i, arg) in args.iter_mut().enumerate() {
            if let Some(param) = params.get(i) {
                set_exp_flow(arg, param.flow, param.flow_type);
                if param.flow.flows_out() {
                    if let Some(v) = arg.node.var_name() {
                        outputs.push(v.to_string());
                    }
                }
            } else {
                // Reified test: the extra argument takes the success flag.
                set_exp_flow(
                    arg,
                    FlowDirection::Out,
                    plume_core::ArgFlowType::Ordinary,
                );
                if let Some(v) = arg.node.var_name() {
                    outputs.push(v.to_string());
                }
            }
        }

        trace!(target: "modes", "call {} selected mode <{}>", name, pid);
        out.push(StmtNode::new(
            Stmt::Call {
                module: path,
                name: name.clone(),
                id: Some(pid),
                resourceful,
                args,
            },
            pos,
        ));

        // Implicit-test calls behave semi-deterministically even though the
        // callee is det: the omitted bool output is the success flag.
        let implicit_test = params.len() == actuals.len() + 1;
        let reified = params.len() + 1 == actuals.len();
        let effective_det = if implicit_test {
            Determinism::SemiDet
        } else if reified {
            Determinism::Det
        } else {
            callee_det
        };

        let next = match effective_det {
            Determinism::Det => state.seq_det(outputs),
            Determinism::SemiDet => state.seq_semidet(outputs),
            Determinism::Failure => {
                let s = state.seq_det(Vec::new());
                match s {
                    BindingState::Impossible => BindingState::Impossible,
                    _ => BindingState::Failing,
                }
            }
            Determinism::Terminal => state.seq_unreachable(),
        };
        self.drain(next, det, out, delayed)
    }

    /// `true` when `pid`'s parameter flows and types match the actual
    /// argument modes. `Unknown` actuals are treated as `In` when bound,
    /// and as directed by `treat_flex_as_out` when unbound.
    fn modes_match(
        &self,
        name: &str,
        pid: ProcId,
        actuals: &[Actual],
        det: Determinism,
        treat_flex_as_out: bool,
    ) -> bool {
        let callee = &self.module.overloads(name)[pid.0 as usize];
        let params = &callee.proto.params;
        let shared = if params.len() == actuals.len() {
            params.len()
        } else if det == Determinism::SemiDet
            && params.len() == actuals.len() + 1
            && params
                .last()
                .is_some_and(|p| p.flow.flows_out() && p.ty == TypeSpec::bool())
        {
            actuals.len()
        } else if params.len() + 1 == actuals.len()
            && callee.determinism == Determinism::SemiDet
        {
            params.len()
        } else {
            return false;
        };

        // A reified test runs deterministically regardless of context;
        // everything else needs the callee's determinism admissible here.
        let reified = params.len() + 1 == actuals.len();
        if !reified && !callee.determinism.usable_in(det) {
            return false;
        }

        for (i, actual) in actuals.iter().enumerate() {
            let param_flow = if i < shared {
                params[i].flow
            } else {
                FlowDirection::Out
            };
            let actual_flow = match actual.flow {
                FlowDirection::Unknown => {
                    if actual.available {
                        FlowDirection::In
                    } else if treat_flex_as_out {
                        FlowDirection::Out
                    } else {
                        FlowDirection::In
                    }
                }
                f => f,
            };
            let ok = match param_flow {
                FlowDirection::In | FlowDirection::TakeReference => {
                    actual_flow.flows_in()
                }
                FlowDirection::Out | FlowDirection::OutByReference => {
                    actual_flow.flows_out()
                }
                FlowDirection::Unknown => true,
            };
            if !ok {
                return false;
            }
            // Argument types must still be compatible with this overload.
            if i < shared {
                if let Some(var) = &actual.var {
                    let ty = self
                        .var_types
                        .get(var)
                        .cloned()
                        .unwrap_or(TypeSpec::Any);
                    if !ty.compatible(&params[i].ty) {
                        return false;
                    }
                }
            }
            // Resource parameters require the resource in scope.
            if i < shared
                && params[i].flow_type == plume_core::ArgFlowType::Resource
            {
                if let Some(var) = &actual.var {
                    if !self.resources.contains(var) && !actual.available {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Reports why no candidate accepted the call: determinism if some
    /// candidate matched on flows alone, resource availability if one
    /// failed only on that, undefined flow otherwise.
    fn report_no_mode(
        &mut self,
        name: &str,
        candidates: &[ProcId],
        actuals: &[Actual],
        det: Determinism,
        pos: &Option<SourcePos>,
    ) {
        for pid in candidates {
            let callee = &self.module.overloads(name)[pid.0 as usize];
            if !callee.determinism.usable_in(det)
                && self.modes_match(name, *pid, actuals, Determinism::SemiDet, false)
            {
                self.diags.push(Diagnostic::new(
                    pos.clone(),
                    ErrorKind::DeterminismViolation {
                        name: name.to_string(),
                        callee: callee.determinism,
                        context: det,
                    },
                ));
                return;
            }
        }
        for pid in candidates {
            let callee = &self.module.overloads(name)[pid.0 as usize];
            for (i, param) in callee.proto.params.iter().enumerate() {
                if param.flow_type == plume_core::ArgFlowType::Resource {
                    if let Some(actual) = actuals.get(i) {
                        if let Some(var) = &actual.var {
                            if !self.resources.contains(var) && !actual.available {
                                self.diags.push(Diagnostic::new(
                                    pos.clone(),
                                    ErrorKind::ResourceUnavailable {
                                        resource: var.clone(),
                                    },
                                ));
                                return;
                            }
                        }
                    }
                }
            }
        }
        self.diags.push(Diagnostic::new(
            pos.clone(),
            ErrorKind::UndefinedFlow {
                name: name.to_string(),
            },
        ));
    }

    /// Mode checking for a foreign instruction: fixed out positions by
    /// operation, inputs must be bound (or the instruction waits), and the
    /// signature is validated once committed.
    #[allow(clippy::too_many_arguments)]
    fn check_foreign(
        &mut self,
        lang: String,
        name: String,
        flags: Vec<String>,
        mut args: Vec<ExpNode>,
        pos: Option<SourcePos>,
        state: BindingState,
        det: Determinism,
        out: &mut Vec<StmtNode>,
        delayed: &mut Delayed,
    ) -> BindingState {
        let outs = foreign_out_positions(&lang, &name, &args);

        let mut awaits = VarSet::new();
        for (i, arg) in args.iter().enumerate() {
            if outs.contains(&i) {
                continue;
            }
            if let Some(var) = arg.node.var_name() {
                if !state.is_bound(var) {
                    awaits.insert(var.to_string());
                }
            }
        }
        if !awaits.is_empty() {
            delayed.push((
                awaits,
                StmtNode::new(
                    Stmt::Foreign {
                        lang,
                        name,
                        flags,
                        args,
                    },
                    pos,
                ),
            ));
            return state;
        }

        let mut outputs = Vec::new();
        for (i, arg) in args.iter_mut().enumerate() {
            let is_out = outs.contains(&i);
            if arg.node.var_name().is_some() {
                let flow = if is_out {
                    FlowDirection::Out
                } else {
                    FlowDirection::In
                };
                set_exp_flow(arg, flow, plume_core::ArgFlowType::Ordinary);
                if is_out {
                    if let Some(v) = arg.node.var_name() {
                        outputs.push(v.to_string());
                    }
                }
            }
        }

        let foreign_args: Vec<ForeignArg> = args
            .iter()
            .enumerate()
            .map(|(i, arg)| ForeignArg {
                ty: self.exp_type(arg),
                is_out: outs.contains(&i),
            })
            .collect();
        self.diags
            .extend(foreign::validate_foreign(&lang, &name, &foreign_args, &pos));

        out.push(StmtNode::new(
            Stmt::Foreign {
                lang,
                name,
                flags,
                args,
            },
            pos,
        ));
        let next = state.seq_det(outputs);
        self.drain(next, det, out, delayed)
    }

    fn actual_of(&self, arg: &ExpNode, state: &BindingState) -> Actual {
        match arg.node.var_name() {
            Some(var) => Actual {
                var: Some(var.to_string()),
                flow: arg.node.var_flow().unwrap_or(FlowDirection::Unknown),
                available: state.is_bound(var),
            },
            None => Actual {
                var: None,
                flow: FlowDirection::In,
                available: true,
            },
        }
    }

    fn exp_type(&self, exp: &ExpNode) -> TypeSpec {
        match &exp.node {
            Exp::Var { name, .. } => self
                .var_types
                .get(name)
                .cloned()
                .unwrap_or(TypeSpec::Any),
            Exp::IntLit(_) => TypeSpec::int(),
            Exp::FloatLit(_) => TypeSpec::float(),
            Exp::StrLit(_) => TypeSpec::string(),
            Exp::CharLit(_) => TypeSpec::char(),
            Exp::AnonProc { .. } | Exp::ProcRef { .. } => TypeSpec::Any,
            Exp::Typed { ty, .. } => ty.clone(),
        }
    }
}

/// Collects every variable an output-flow occurrence could bind.
fn collect_bindable(stmt: &StmtNode, acc: &mut VarSet) {
    fn exp(e: &ExpNode, acc: &mut VarSet) {
        match &e.node {
            Exp::Var { name, flow, .. } => {
                if *flow != FlowDirection::In {
                    acc.insert(name.clone());
                }
            }
            Exp::Typed { exp: inner, .. } => exp(inner, acc),
            _ => {}
        }
    }
    match &stmt.node {
        Stmt::Call { args, .. } | Stmt::Foreign { args, .. } => {
            for a in args {
                exp(a, acc);
            }
        }
        Stmt::TestBool(_) | Stmt::Nop | Stmt::Fail | Stmt::Break | Stmt::Next => {}
        Stmt::And(stmts) => {
            for s in stmts {
                collect_bindable(s, acc);
            }
        }
        Stmt::Or { alts, .. } => {
            for s in alts {
                collect_bindable(s, acc);
            }
        }
        Stmt::Not(inner) => collect_bindable(inner, acc),
        Stmt::Cond {
            test, then, els, ..
        } => {
            collect_bindable(test, acc);
            for s in then.iter().chain(els) {
                collect_bindable(s, acc);
            }
        }
        Stmt::Loop { body, .. } | Stmt::UseResources { body, .. } => {
            for s in body {
                collect_bindable(s, acc);
            }
        }
        Stmt::Case { .. } => {}
    }
}

/// Rebuilds a single statement from a checked sequence, wrapping multiple
/// statements back into a conjunction.
fn reconstitute(mut stmts: Vec<StmtNode>) -> StmtNode {
    match stmts.len() {
        0 => StmtNode::unplaced(Stmt::Nop),
        1 => stmts.pop().unwrap(),
        _ => StmtNode::unplaced(Stmt::And(stmts)),
    }
}

/// Which argument positions of a foreign instruction flow out.
fn foreign_out_positions(lang: &str, name: &str, args: &[ExpNode]) -> Vec<usize> {
    match lang {
        "llvm" => {
            if foreign::is_llvm_binop(name)
                || foreign::is_llvm_comparison(name)
                || name == "move"
                || foreign::is_llvm_conversion(name)
            {
                if args.is_empty() {
                    vec![]
                } else {
                    vec![args.len() - 1]
                }
            } else {
                vec![]
            }
        }
        "lpvm" => match name {
            "alloc" | "cast" | "load" => vec![1],
            "access" => vec![4],
            "mutate" => vec![1],
            _ => vec![],
        },
        // c calls are not validated: trust the written flows.
        _ => args
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.node
                    .var_flow()
                    .is_some_and(|f| f.flows_out())
            })
            .map(|(i, _)| i)
            .collect(),
    }
}

/// Sets the flow annotation on a (possibly typed) variable expression.
fn set_exp_flow(
    exp: &mut ExpNode,
    flow: FlowDirection,
    flow_type: plume_core::ArgFlowType,
) {
    match &mut exp.node {
        Exp::Var {
            flow: f,
            flow_type: ft,
            ..
        } => {
            *f = flow;
            *ft = flow_type;
        }
        Exp::Typed { exp: inner, .. } => set_exp_flow(inner, flow, flow_type),
        _ => {}
    }
}
