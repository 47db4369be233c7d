//! Phase 1 of checking: flow-insensitive type inference.
//!
//! Traverses a procedure's source body accumulating a [`Typing`] and a
//! diagnostic list. Flow directions are not consulted here, only types.
//! Overloaded calls that cannot be resolved yet are recorded as
//! alternatives and narrowed as other unifications land; whatever remains
//! ambiguous at the end of the body is reported.

use plume_core::{
    Determinism, Diagnostic, ErrorKind, Exp, ExpNode, Module, ModulePath, Param,
    ProcDef, ProcId, ProcModifiers, SourcePos, Stmt, StmtNode, TypeFlow, TypeSpec,
};
use tracing::trace;

use crate::typing::{Alternative, Typing};

/// Result of type checking one procedure.
pub struct TypeCheckOutcome {
    pub diags: Vec<Diagnostic>,
    /// `true` when a parameter type was refined; drives the SCC fix-point.
    pub params_changed: bool,
}

/// Infers types for one procedure body and refines its parameter types.
pub fn type_check_proc(module: &Module, def: &mut ProcDef) -> TypeCheckOutcome {
    let mut checker = TypeChecker {
        module,
        typing: Typing::new(),
        diags: Vec::new(),
        fresh: 0,
    };
    for param in &def.proto.params {
        checker
            .typing
            .set_var_type(&param.name, param.ty.clone());
    }

    if let plume_core::ProcImpl::Source(stmts) = &mut def.impln {
        let det = def.determinism;
        checker.infer_stmts(stmts, det);
    }

    let mut diags = std::mem::take(&mut checker.diags);
    diags.extend(checker.typing.finalize_alternatives());

    let mut params_changed = false;
    for param in &mut def.proto.params {
        let inferred = checker.typing.var_type(&param.name);
        if param.ty != inferred {
            trace!(target: "types", "{}: param {} refined to {}",
                   def.proto.name, param.name, inferred);
            param.ty = inferred;
            params_changed = true;
        }
    }

    def.var_types = checker
        .typing
        .known_vars()
        .into_iter()
        .collect();

    TypeCheckOutcome {
        diags,
        params_changed,
    }
}

struct TypeChecker<'a> {
    module: &'a Module,
    typing: Typing,
    diags: Vec<Diagnostic>,
    fresh: u32,
}

/// The immediate type of a non-variable argument, computed once before
/// candidate trials so trials stay cheap.
enum ArgShape {
    /// A variable: flexible, unified per candidate.
    Var(String),
    /// Anything with a type of its own.
    Fixed(TypeSpec, String),
}

impl<'a> TypeChecker<'a> {
    fn infer_stmts(&mut self, stmts: &mut Vec<StmtNode>, det: Determinism) {
        for stmt in stmts {
            self.infer_stmt(stmt, det);
        }
    }

    fn infer_stmt(&mut self, stmt: &mut StmtNode, det: Determinism) {
        let pos = stmt.pos.clone();
        match &mut stmt.node {
            Stmt::Call {
                module: path,
                name,
                id,
                args,
                ..
            } => {
                let name = name.clone();
                let path = path.clone();
                self.infer_call(&path, &name, id, args, &pos, det);
            }
            Stmt::Foreign {
                lang, name, args, ..
            } => {
                let lang = lang.clone();
                let name = name.clone();
                self.infer_foreign(&lang, &name, args, &pos);
            }
            Stmt::TestBool(exp) => self.infer_test(exp, &pos),
            Stmt::And(stmts) => self.infer_stmts(stmts, det),
            Stmt::Or { alts, .. } => {
                for alt in alts {
                    self.infer_stmt(alt, Determinism::SemiDet);
                }
            }
            Stmt::Not(inner) => self.infer_stmt(inner, Determinism::SemiDet),
            Stmt::Cond {
                test, then, els, ..
            } => {
                self.infer_stmt(test, Determinism::SemiDet);
                self.infer_stmts(then, det);
                self.infer_stmts(els, det);
            }
            Stmt::Loop { body, .. } => self.infer_stmts(body, det),
            Stmt::UseResources { body, .. } => self.infer_stmts(body, det),
            Stmt::Case { .. } => {
                unreachable!("Case statements are eliminated before the middle-end")
            }
            Stmt::Nop | Stmt::Fail | Stmt::Break | Stmt::Next => {}
        }
    }

    /// Overload resolution over an argument list, per the candidate
    /// enumeration / arity filter / compatibility filter cascade.
    fn infer_call(
        &mut self,
        // Scope resolution is upstream: the proc table already holds
        // everything the module path could qualify.
        _path: &ModulePath,
        name: &str,
        id: &mut Option<ProcId>,
        args: &mut Vec<ExpNode>,
        pos: &Option<SourcePos>,
        det: Determinism,
    ) {
        let candidates: Vec<ProcId> = match *id {
            Some(pid) => vec![pid],
            None => (0..self.module.overloads(name).len() as u32)
                .map(ProcId)
                .collect(),
        };
        if candidates.is_empty() {
            self.diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::UnknownProc {
                    name: name.to_string(),
                },
            ));
            return;
        }

        // Shape each argument once; candidate trials then only unify.
        let shapes: Vec<ArgShape> = args
            .iter_mut()
            .map(|arg| self.arg_shape(arg, pos))
            .collect();

        let mut arity_seen = Vec::new();
        let mut survivors: Vec<(ProcId, Typing, Vec<TypeSpec>)> = Vec::new();
        for pid in candidates {
            let proto = &self.module.overloads(name)[pid.0 as usize].proto;
            let params = &proto.params;
            arity_seen.push(params.len());
            // Arity filter, with the two semi-det special cases: a semi-det
            // context may call a det proc leaving its trailing bool output
            // implicit, and a semi-det proc may be reified by passing an
            // extra bool output.
            let pairs: Option<(usize, bool)> = if params.len() == args.len() {
                Some((params.len(), false))
            } else if det == Determinism::SemiDet
                && params.len() == args.len() + 1
                && params
                    .last()
                    .is_some_and(|p| p.flow.flows_out() && p.ty == TypeSpec::bool())
            {
                Some((args.len(), false))
            } else if params.len() + 1 == args.len() {
                let callee_det =
                    self.module.overloads(name)[pid.0 as usize].determinism;
                (callee_det == Determinism::SemiDet).then_some((params.len(), true))
            } else {
                None
            };
            let Some((shared, reified)) = pairs else {
                continue;
            };

            let mut trial = self.typing.clone();
            let mut ok = true;
            for i in 0..shared {
                let expected = params[i].ty.clone();
                if !trial_unify(&mut trial, &shapes[i], &expected) {
                    ok = false;
                    break;
                }
            }
            if ok && reified {
                ok = trial_unify(&mut trial, &shapes[shared], &TypeSpec::bool());
            }
            if ok {
                let var_tys = shapes
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| matches!(s, ArgShape::Var(_)))
                    .map(|(i, _)| {
                        let expected = if i < shared {
                            params[i].ty.clone()
                        } else {
                            TypeSpec::bool()
                        };
                        trial.resolve(&expected)
                    })
                    .collect();
                survivors.push((pid, trial, var_tys));
            }
        }

        match survivors.len() {
            0 => {
                let arity_matches =
                    arity_seen.iter().any(|&n| n == args.len() || n + 1 == args.len() || n == args.len() + 1);
                if arity_matches {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::NoMatchingCandidate {
                            name: name.to_string(),
                        },
                    ));
                } else {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::ArityMismatch {
                            name: name.to_string(),
                            expected: arity_seen.first().copied().unwrap_or(0),
                            found: args.len(),
                        },
                    ));
                }
            }
            1 => {
                let (pid, trial, _) = survivors.pop().unwrap();
                self.typing = trial;
                *id = Some(pid);
                trace!(target: "types", "call {} resolved to <{}>", name, pid);
            }
            _ => {
                // Identical tuples (e.g. same types, different modes) need
                // no alternative: the types are committed and mode checking
                // chooses the variant.
                let first = &survivors[0].2;
                if survivors.iter().all(|(_, _, t)| t == first) {
                    let (_, trial, _) = survivors.swap_remove(0);
                    self.typing = trial;
                } else {
                    let vars: Vec<String> = shapes
                        .iter()
                        .filter_map(|s| match s {
                            ArgShape::Var(v) => Some(v.clone()),
                            ArgShape::Fixed(..) => None,
                        })
                        .collect();
                    self.typing.alternatives.push(Alternative {
                        name: name.to_string(),
                        pos: pos.clone(),
                        vars,
                        tuples: survivors.into_iter().map(|(_, _, t)| t).collect(),
                    });
                    let narrowed = self.typing.narrow_alternatives();
                    self.diags.extend(narrowed);
                }
            }
        }
    }

    /// Computes an argument's shape, typing closure bodies and nested
    /// expressions along the way.
    fn arg_shape(&mut self, arg: &mut ExpNode, pos: &Option<SourcePos>) -> ArgShape {
        let pos = arg.pos.clone().or_else(|| pos.clone());
        match &mut arg.node {
            Exp::Var { name, .. } => ArgShape::Var(name.clone()),
            Exp::IntLit(v) => ArgShape::Fixed(TypeSpec::int(), v.to_string()),
            Exp::FloatLit(v) => ArgShape::Fixed(TypeSpec::float(), v.to_string()),
            Exp::StrLit(s) => ArgShape::Fixed(TypeSpec::string(), format!("{:?}", s)),
            Exp::CharLit(c) => ArgShape::Fixed(TypeSpec::char(), format!("{:?}", c)),
            Exp::AnonProc { mods, params, body } => {
                let ty = self.infer_anon(*mods, params, body);
                ArgShape::Fixed(ty, "<anonymous proc>".to_string())
            }
            Exp::ProcRef { spec, closed } => {
                let ty = self.infer_proc_ref(spec.clone(), closed, &pos);
                ArgShape::Fixed(ty, format!("@{}", spec))
            }
            Exp::Typed { exp, ty, cast } => {
                if !*cast {
                    let expected = ty.clone();
                    self.unify_exp(exp, &expected, &pos);
                }
                ArgShape::Fixed(ty.clone(), "<typed expression>".to_string())
            }
        }
    }

    /// Types an anonymous procedure body in a nested scope seeded with the
    /// enclosing variables (captures) and the anon proc's own parameters.
    fn infer_anon(
        &mut self,
        mods: ProcModifiers,
        params: &[Param],
        body: &mut Vec<StmtNode>,
    ) -> TypeSpec {
        let mut inner = TypeChecker {
            module: self.module,
            typing: self.typing.clone(),
            diags: Vec::new(),
            fresh: self.fresh,
        };
        // The enclosing procedure's pending alternatives stay its own.
        inner.typing.alternatives.clear();
        for p in params {
            inner.typing.set_var_type(&p.name, p.ty.clone());
        }
        inner.infer_stmts(body, mods.determinism);
        let mut inner_diags = std::mem::take(&mut inner.diags);
        inner_diags.extend(inner.typing.finalize_alternatives());
        self.diags.extend(inner_diags);
        self.fresh = inner.fresh;
        TypeSpec::HigherOrder {
            mods,
            flows: params
                .iter()
                .map(|p| TypeFlow {
                    ty: p.ty.clone(),
                    dir: p.flow,
                })
                .collect(),
        }
    }

    /// The higher-order type of a (possibly partially applied) procedure
    /// reference. Closed-over arguments consume leading parameters.
    fn infer_proc_ref(
        &mut self,
        spec: plume_core::ProcSpec,
        closed: &mut Vec<ExpNode>,
        pos: &Option<SourcePos>,
    ) -> TypeSpec {
        let Some(target) = self.module.get_proc(&spec) else {
            self.diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::UnknownProc {
                    name: spec.name.clone(),
                },
            ));
            return TypeSpec::Invalid;
        };
        let params = target.proto.params.clone();
        let mods = ProcModifiers {
            determinism: target.determinism,
            impurity: target.impurity,
            inlining: target.inlining,
        };
        if closed.len() > params.len() {
            self.diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::ArityMismatch {
                    name: spec.name.clone(),
                    expected: params.len(),
                    found: closed.len(),
                },
            ));
            return TypeSpec::Invalid;
        }
        for (arg, param) in closed.iter_mut().zip(&params) {
            let expected = param.ty.clone();
            self.unify_exp(arg, &expected, pos);
        }
        TypeSpec::HigherOrder {
            mods,
            flows: params[closed.len()..]
                .iter()
                .map(|p| TypeFlow {
                    ty: p.ty.clone(),
                    dir: p.flow,
                })
                .collect(),
        }
    }

    /// A test succeeds or fails on a boolean; anything else is its own
    /// error kind, not a generic conflict.
    fn infer_test(&mut self, exp: &mut ExpNode, pos: &Option<SourcePos>) {
        let shape = self.arg_shape(exp, pos);
        match shape {
            ArgShape::Var(name) => {
                let current = self.typing.var_type(&name);
                if self.typing.unify_var(&name, &TypeSpec::bool(), pos).is_some() {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::NonBooleanTest { ty: current },
                    ));
                } else {
                    let narrowed = self.typing.narrow_alternatives();
                    self.diags.extend(narrowed);
                }
            }
            ArgShape::Fixed(ty, _) => {
                if !ty.compatible(&TypeSpec::bool()) {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::NonBooleanTest { ty },
                    ));
                }
            }
        }
    }

    /// Unifies one expression against an expected type on the main typing,
    /// reporting any conflict.
    fn unify_exp(
        &mut self,
        exp: &mut ExpNode,
        expected: &TypeSpec,
        pos: &Option<SourcePos>,
    ) {
        let shape = self.arg_shape(exp, pos);
        match shape {
            ArgShape::Var(name) => {
                if let Some(d) = self.typing.unify_var(&name, expected, pos) {
                    self.diags.push(d);
                }
                let narrowed = self.typing.narrow_alternatives();
                self.diags.extend(narrowed);
            }
            ArgShape::Fixed(ty, rendered) => {
                if let Err((want, got)) = self.typing.unify(expected, &ty) {
                    self.diags.push(Diagnostic::new(
                        pos.clone(),
                        ErrorKind::TypeConflict {
                            var: rendered,
                            expected: want,
                            found: got,
                        },
                    ));
                }
            }
        }
    }

    /// A fresh type variable for tying foreign operands together.
    fn fresh_tyvar(&mut self) -> TypeSpec {
        let n = self.fresh;
        self.fresh += 1;
        TypeSpec::TypeVar(format!("ft#{}", n))
    }

    /// Typing rules for foreign instructions: operands of an llvm
    /// arithmetic op share one type, comparisons produce bool, lpvm
    /// offsets/sizes are ints. Signature validation happens during mode
    /// checking, once types are final.
    fn infer_foreign(
        &mut self,
        lang: &str,
        name: &str,
        args: &mut [ExpNode],
        pos: &Option<SourcePos>,
    ) {
        match lang {
            "llvm" => {
                if crate::foreign::is_llvm_binop(name) || name == "move" {
                    let tv = self.fresh_tyvar();
                    for arg in args.iter_mut() {
                        self.unify_exp(arg, &tv, pos);
                    }
                } else if crate::foreign::is_llvm_comparison(name) {
                    let tv = self.fresh_tyvar();
                    let n = args.len();
                    for arg in args.iter_mut().take(n.saturating_sub(1)) {
                        self.unify_exp(arg, &tv, pos);
                    }
                    if let Some(out) = args.last_mut() {
                        self.unify_exp(out, &TypeSpec::bool(), pos);
                    }
                }
                // Conversions intentionally relate differently-typed
                // operands; nothing to unify.
            }
            "lpvm" => {
                let int_positions: &[usize] = match name {
                    "alloc" => &[0],
                    "access" => &[1, 2, 3],
                    "mutate" => &[2, 3, 4, 5],
                    _ => &[],
                };
                for &i in int_positions {
                    if let Some(arg) = args.get_mut(i) {
                        self.unify_exp(arg, &TypeSpec::int(), pos);
                    }
                }
            }
            _ => {}
        }
    }
}

fn trial_unify(trial: &mut Typing, shape: &ArgShape, expected: &TypeSpec) -> bool {
    match shape {
        ArgShape::Var(name) => trial.unify_var(name, expected, &None).is_none(),
        ArgShape::Fixed(ty, _) => trial.unify(expected, ty).is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::{
        Exp, FlowDirection, Module, ModulePath, Param, ProcImpl, ProcProto, Spanned,
    };

    fn plus_proc(ty: TypeSpec) -> ProcDef {
        ProcDef::new(
            ProcProto::new(
                "+",
                vec![
                    Param::new("a", ty.clone(), FlowDirection::In),
                    Param::new("b", ty.clone(), FlowDirection::In),
                    Param::new("r", ty, FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![]),
            Determinism::Det,
        )
    }

    fn call(name: &str, args: Vec<Exp>) -> StmtNode {
        Spanned::unplaced(Stmt::Call {
            module: ModulePath::local(),
            name: name.into(),
            id: None,
            resourceful: false,
            args: args.into_iter().map(Spanned::unplaced).collect(),
        })
    }

    #[test]
    fn type_propagates_from_unique_overload() {
        // foo(x): x + 1 with + defined on int only must give x: int.
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(plus_proc(TypeSpec::int()));
        let foo = ProcDef::new(
            ProcProto::new(
                "foo",
                vec![
                    Param::new("x", TypeSpec::Any, FlowDirection::In),
                    Param::new("r", TypeSpec::Any, FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![call(
                "+",
                vec![Exp::in_var("x"), Exp::IntLit(1), Exp::out_var("r")],
            )]),
            Determinism::Det,
        );
        let spec = m.add_proc(foo);

        let mut def = m.get_proc(&spec).unwrap().clone();
        let outcome = type_check_proc(&m, &mut def);
        assert!(outcome.diags.is_empty(), "{:?}", outcome.diags);
        assert!(outcome.params_changed);
        assert_eq!(def.proto.params[0].ty, TypeSpec::int());
        assert_eq!(def.proto.params[1].ty, TypeSpec::int());
        assert_eq!(def.var_types.get("x"), Some(&TypeSpec::int()));
    }

    #[test]
    fn overload_narrowing_by_literal() {
        // f(int,int->int) and f(float,float->float); call f(x, 1.0, ?r)
        // must pick the float overload and give x: float.
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc({
            let mut p = plus_proc(TypeSpec::int());
            p.proto.name = "f".into();
            p
        });
        m.add_proc({
            let mut p = plus_proc(TypeSpec::float());
            p.proto.name = "f".into();
            p
        });
        let caller = ProcDef::new(
            ProcProto::new(
                "g",
                vec![
                    Param::new("x", TypeSpec::Any, FlowDirection::In),
                    Param::new("r", TypeSpec::Any, FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![call(
                "f",
                vec![Exp::in_var("x"), Exp::FloatLit(1.0), Exp::out_var("r")],
            )]),
            Determinism::Det,
        );
        let spec = m.add_proc(caller);

        let mut def = m.get_proc(&spec).unwrap().clone();
        let outcome = type_check_proc(&m, &mut def);
        assert!(outcome.diags.is_empty(), "{:?}", outcome.diags);
        assert_eq!(def.proto.params[0].ty, TypeSpec::float());
        assert_eq!(def.var_types.get("r"), Some(&TypeSpec::float()));
    }

    #[test]
    fn unknown_proc_reported() {
        let m = Module::new(ModulePath::from_name("m"));
        let mut def = ProcDef::new(
            ProcProto::new("h", vec![]),
            ProcImpl::Source(vec![call("missing", vec![])]),
            Determinism::Det,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert_eq!(outcome.diags.len(), 1);
        assert!(matches!(
            outcome.diags[0].kind,
            ErrorKind::UnknownProc { .. }
        ));
    }

    #[test]
    fn arity_mismatch_reported() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(plus_proc(TypeSpec::int()));
        let mut def = ProcDef::new(
            ProcProto::new("h", vec![]),
            ProcImpl::Source(vec![call("+", vec![Exp::IntLit(1)])]),
            Determinism::Det,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert!(matches!(
            outcome.diags[0].kind,
            ErrorKind::ArityMismatch {
                expected: 3,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn conflicting_literal_types_rejected() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(plus_proc(TypeSpec::int()));
        let mut def = ProcDef::new(
            ProcProto::new("h", vec![Param::new("r", TypeSpec::Any, FlowDirection::Out)]),
            ProcImpl::Source(vec![call(
                "+",
                vec![Exp::IntLit(1), Exp::FloatLit(2.0), Exp::out_var("r")],
            )]),
            Determinism::Det,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert!(matches!(
            outcome.diags[0].kind,
            ErrorKind::NoMatchingCandidate { .. }
        ));
    }

    #[test]
    fn test_bool_unifies_with_bool() {
        let m = Module::new(ModulePath::from_name("m"));
        let mut def = ProcDef::new(
            ProcProto::new(
                "t",
                vec![Param::new("b", TypeSpec::Any, FlowDirection::In)],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::TestBool(
                Spanned::unplaced(Exp::in_var("b")),
            ))]),
            Determinism::SemiDet,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert!(outcome.diags.is_empty());
        assert_eq!(def.proto.params[0].ty, TypeSpec::bool());
    }

    #[test]
    fn foreign_binop_ties_operands() {
        let m = Module::new(ModulePath::from_name("m"));
        let mut def = ProcDef::new(
            ProcProto::new(
                "inc",
                vec![
                    Param::new("x", TypeSpec::int(), FlowDirection::In),
                    Param::new("r", TypeSpec::Any, FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Foreign {
                lang: "llvm".into(),
                name: "add".into(),
                flags: vec![],
                args: vec![
                    Spanned::unplaced(Exp::in_var("x")),
                    Spanned::unplaced(Exp::IntLit(1)),
                    Spanned::unplaced(Exp::out_var("r")),
                ],
            })]),
            Determinism::Det,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert!(outcome.diags.is_empty(), "{:?}", outcome.diags);
        assert_eq!(def.proto.params[1].ty, TypeSpec::int());
    }

    #[test]
    fn comparison_output_is_bool() {
        let m = Module::new(ModulePath::from_name("m"));
        let mut def = ProcDef::new(
            ProcProto::new(
                "iszero",
                vec![
                    Param::new("x", TypeSpec::int(), FlowDirection::In),
                    Param::new("b", TypeSpec::Any, FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Foreign {
                lang: "llvm".into(),
                name: "icmp_eq".into(),
                flags: vec![],
                args: vec![
                    Spanned::unplaced(Exp::in_var("x")),
                    Spanned::unplaced(Exp::IntLit(0)),
                    Spanned::unplaced(Exp::out_var("b")),
                ],
            })]),
            Determinism::Det,
        );
        let outcome = type_check_proc(&m, &mut def);
        assert!(outcome.diags.is_empty(), "{:?}", outcome.diags);
        assert_eq!(def.proto.params[1].ty, TypeSpec::bool());
    }
}
