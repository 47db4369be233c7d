//! Clause compilation: from unbranched statements to a primitive body.
//!
//! The unbranched form still speaks in source variables; primitive bodies
//! require every `Out` argument to bind a variable not previously bound on
//! the same linear path. This pass walks the flat statement list giving
//! each rebinding a fresh versioned name, translates statements into
//! primitives appended through the [`BodyBuilder`] (which optimises as it
//! goes), turns each terminal conditional into a two-way fork, and closes
//! every leaf by moving the final version of each output into its
//! parameter name. The builder's backward pass then cleans up.

use std::collections::HashMap;

use plume_core::{
    Exp, ExpNode, ForeignLang, Module, Prim, PrimArg, PrimArgs, ProcDef,
    ProcImpl, ProcSpec, Stmt, StmtNode, TypeSpec,
};
use tracing::debug;

use crate::builder::{backward_pass, BodyBuilder};
use crate::info::ProcInfoTable;

/// Compiles one unbranched procedure into its primitive body.
pub fn compile_proc(module: &Module, info: &ProcInfoTable, def: &mut ProcDef) {
    let ProcImpl::Source(stmts) = &def.impln else {
        return;
    };
    let stmts = stmts.clone();

    let outputs: Vec<(String, TypeSpec)> = def
        .proto
        .params
        .iter()
        .filter(|p| p.flow.flows_out())
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();

    let mut versions: HashMap<String, u32> = HashMap::new();
    for param in def.proto.params.iter().filter(|p| p.flow.flows_in()) {
        versions.insert(param.name.clone(), 1);
    }

    let mut comp = ClauseComp {
        module,
        var_types: &def.var_types,
        outputs,
        builder: BodyBuilder::new(info, def.temp_count),
    };

    let ended_with_fork = comp.walk(&stmts, &mut versions);
    if !ended_with_fork {
        comp.leaf_moves(&versions);
    }

    let (mut body, temp_count) = comp.builder.finish();
    let mut used_later = def
        .proto
        .params
        .iter()
        .filter(|p| p.flow.flows_out())
        .map(|p| p.name.clone())
        .collect();
    backward_pass(&mut body, &mut used_later, info);

    def.temp_count = temp_count;
    def.impln = ProcImpl::Prim(body);
    debug!(target: "builder", "compiled {} to primitive form", def.proto.name);
}

struct ClauseComp<'a> {
    module: &'a Module,
    var_types: &'a std::collections::BTreeMap<String, TypeSpec>,
    outputs: Vec<(String, TypeSpec)>,
    builder: BodyBuilder<'a>,
}

impl<'a> ClauseComp<'a> {
    /// Compiles a statement sequence. Returns `true` when the sequence
    /// ended in a fork (so the caller must not emit leaf moves).
    fn walk(&mut self, stmts: &[StmtNode], versions: &mut HashMap<String, u32>) -> bool {
        for (i, stmt) in stmts.iter().enumerate() {
            match &stmt.node {
                Stmt::Call {
                    module: path,
                    name,
                    id,
                    args,
                    ..
                } => {
                    let pid = id.expect("calls are resolved before lowering");
                    let callee_path = if path.is_empty() {
                        self.module.path.clone()
                    } else {
                        path.clone()
                    };
                    let spec =
                        ProcSpec::local(callee_path, name.clone(), pid);
                    let param_tys: Vec<Option<TypeSpec>> = match self
                        .module
                        .get_proc(&spec)
                    {
                        Some(callee) => callee
                            .proto
                            .params
                            .iter()
                            .map(|p| Some(p.ty.clone()))
                            .collect(),
                        None => vec![None; args.len()],
                    };
                    let prim_args: PrimArgs = args
                        .iter()
                        .enumerate()
                        .map(|(j, a)| {
                            self.exp_arg(
                                a,
                                versions,
                                param_tys.get(j).cloned().flatten().as_ref(),
                            )
                        })
                        .collect();
                    let globals = self.builder_info_globals(&spec);
                    self.builder.instr(
                        Prim::Call {
                            spec,
                            args: prim_args,
                            globals,
                        },
                        stmt.pos.clone(),
                    );
                }
                Stmt::Foreign {
                    lang,
                    name,
                    flags,
                    args,
                } => {
                    let lang: ForeignLang = lang
                        .parse()
                        .expect("foreign languages are validated before lowering");
                    // Untyped literals take the type of the first typed
                    // operand (a move of 1 into a bool variable is a bool
                    // constant).
                    let hint = args.iter().find_map(|a| self.exp_type(a));
                    let prim_args: PrimArgs = args
                        .iter()
                        .map(|a| self.exp_arg(a, versions, hint.as_ref()))
                        .collect();
                    self.builder.instr(
                        Prim::Foreign {
                            lang,
                            name: name.clone(),
                            flags: flags.clone(),
                            args: prim_args,
                        },
                        stmt.pos.clone(),
                    );
                }
                Stmt::Nop => {}
                Stmt::Cond {
                    test, then, els, ..
                } => {
                    assert_eq!(
                        i,
                        stmts.len() - 1,
                        "conditional must be the final statement after unbranching"
                    );
                    let Stmt::TestBool(exp) = &test.node else {
                        unreachable!("unbranched conditional must test a boolean")
                    };
                    let var = exp
                        .node
                        .var_name()
                        .expect("unbranched test is a variable");
                    let ty = self
                        .var_types
                        .get(var)
                        .cloned()
                        .unwrap_or_else(TypeSpec::bool);
                    let name = self.read_name(versions, var);
                    self.builder.build_fork(name, ty);

                    // Branch 0 runs when the test variable is false.
                    for branch in [els, then] {
                        let mut branch_versions = versions.clone();
                        self.builder.begin_branch();
                        let forked = self.walk(branch, &mut branch_versions);
                        if !forked {
                            self.leaf_moves(&branch_versions);
                        }
                        self.builder.end_branch();
                    }
                    self.builder.complete_fork();
                    return true;
                }
                other => {
                    unreachable!(
                        "statement not eliminated by unbranching: {:?}",
                        other
                    )
                }
            }
        }
        false
    }

    /// Global flows for a call, from the callee-info table the builder
    /// shares.
    fn builder_info_globals(&self, spec: &ProcSpec) -> plume_core::GlobalFlows {
        // The builder holds the table; route through a tiny accessor to
        // keep one source of truth.
        self.builder.callee_global_flows(spec)
    }

    /// Closes one leaf: the current version of every output moves into the
    /// output parameter name.
    fn leaf_moves(&mut self, versions: &HashMap<String, u32>) {
        for (name, ty) in self.outputs.clone() {
            if versions.get(&name).copied().unwrap_or(0) == 0 {
                // Never bound on this path: unreachable or already
                // reported.
                continue;
            }
            let current = self.read_name(versions, &name);
            if current != name {
                self.builder.instr(
                    Prim::move_prim(
                        PrimArg::in_var(current, ty.clone()),
                        PrimArg::out_var(name, ty),
                    ),
                    None,
                );
            }
        }
    }

    /// The declared type of an expression, when it has one.
    fn exp_type(&self, exp: &ExpNode) -> Option<TypeSpec> {
        match &exp.node {
            Exp::Var { name, .. } => self.var_types.get(name).cloned(),
            Exp::Typed { ty, .. } => Some(ty.clone()),
            _ => None,
        }
    }

    /// Translates one argument expression into a primitive argument,
    /// versioning variables as they are read and rebound.
    fn exp_arg(
        &mut self,
        exp: &ExpNode,
        versions: &mut HashMap<String, u32>,
        hint: Option<&TypeSpec>,
    ) -> PrimArg {
        match &exp.node {
            Exp::Var {
                name,
                flow,
                flow_type,
            } => {
                let ty = self
                    .var_types
                    .get(name)
                    .cloned()
                    .or_else(|| hint.cloned())
                    .unwrap_or(TypeSpec::Any);
                let versioned = if flow.flows_out() {
                    self.write_name(versions, name)
                } else {
                    self.read_name(versions, name)
                };
                PrimArg::Var {
                    name: versioned,
                    ty,
                    flow: *flow,
                    flow_type: *flow_type,
                    last_use: false,
                }
            }
            Exp::IntLit(v) => PrimArg::Int {
                value: *v,
                ty: hint.cloned().unwrap_or_else(TypeSpec::int),
            },
            Exp::FloatLit(v) => PrimArg::Float {
                value: *v,
                ty: hint.cloned().unwrap_or_else(TypeSpec::float),
            },
            Exp::StrLit(s) => PrimArg::Str {
                value: s.clone(),
                variant: plume_core::StringVariant::Managed,
            },
            Exp::CharLit(c) => PrimArg::Char(*c),
            Exp::Typed { exp, ty, .. } => self.exp_arg(exp, versions, Some(ty)),
            Exp::ProcRef { spec, closed } => PrimArg::ProcRef {
                spec: spec.clone(),
                closed: closed
                    .iter()
                    .map(|e| self.exp_arg(e, versions, None))
                    .collect(),
                ty: hint.cloned().unwrap_or(TypeSpec::Any),
            },
            Exp::AnonProc { .. } => {
                unreachable!("anonymous procedures are hoisted by unbranching")
            }
        }
    }
}

impl<'a> ClauseComp<'a> {
    fn is_output(&self, var: &str) -> bool {
        self.outputs.iter().any(|(n, _)| n == var)
    }

    /// The current name of a variable: its bare name until rebound, then
    /// versioned. Output parameter names are reserved for the leaf moves,
    /// so output variables are versioned from their first binding.
    fn read_name(&self, versions: &HashMap<String, u32>, var: &str) -> String {
        let count = versions.get(var).copied().unwrap_or(0);
        if self.is_output(var) {
            match count {
                0 => var.to_string(),
                n => format!("{}#v{}", var, n - 1),
            }
        } else {
            match count {
                0 | 1 => var.to_string(),
                n => format!("{}#v{}", var, n - 1),
            }
        }
    }

    /// Registers a (re)binding of `var` and returns the name the new
    /// value lives under.
    fn write_name(&self, versions: &mut HashMap<String, u32>, var: &str) -> String {
        let count = versions.entry(var.to_string()).or_insert(0);
        *count += 1;
        if self.is_output(var) {
            format!("{}#v{}", var, *count - 1)
        } else if *count == 1 {
            var.to_string()
        } else {
            format!("{}#v{}", var, *count - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::{
        Determinism, FlowDirection, ModulePath, Param, PrimFork, ProcId,
        ProcProto, Spanned,
    };

    fn foreign(name: &str, args: Vec<Exp>) -> StmtNode {
        Spanned::unplaced(Stmt::Foreign {
            lang: "llvm".into(),
            name: name.into(),
            flags: vec![],
            args: args.into_iter().map(Spanned::unplaced).collect(),
        })
    }

    fn compiled(def: ProcDef) -> ProcDef {
        let m = Module::new(ModulePath::from_name("m"));
        let info = ProcInfoTable::from_module(&m);
        let mut def = def;
        compile_proc(&m, &info, &mut def);
        def
    }

    #[test]
    fn version_names() {
        let m = Module::new(ModulePath::from_name("m"));
        let info = ProcInfoTable::from_module(&m);
        let comp = ClauseComp {
            module: &m,
            var_types: &Default::default(),
            outputs: vec![("r".to_string(), TypeSpec::int())],
            builder: BodyBuilder::new(&info, 0),
        };
        let mut v = HashMap::new();
        // Locals keep their bare name for the first binding.
        assert_eq!(comp.read_name(&v, "x"), "x");
        assert_eq!(comp.write_name(&mut v, "x"), "x");
        assert_eq!(comp.read_name(&v, "x"), "x");
        assert_eq!(comp.write_name(&mut v, "x"), "x#v1");
        assert_eq!(comp.read_name(&v, "x"), "x#v1");
        assert_eq!(comp.write_name(&mut v, "x"), "x#v2");
        // Outputs are versioned from the start; the bare name is bound
        // only by the leaf move.
        assert_eq!(comp.write_name(&mut v, "r"), "r#v0");
        assert_eq!(comp.read_name(&v, "r"), "r#v0");
        assert_eq!(comp.write_name(&mut v, "r"), "r#v1");
    }

    #[test]
    fn rebinding_gets_fresh_names() {
        // x = a + 1; x = x + 1; r = x  -- every Out binds a fresh name.
        let mut def = ProcDef::new(
            ProcProto::new(
                "bump2",
                vec![
                    Param::new("a", TypeSpec::int(), FlowDirection::In),
                    Param::new("r", TypeSpec::int(), FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![
                foreign(
                    "add",
                    vec![Exp::in_var("a"), Exp::IntLit(1), Exp::out_var("x")],
                ),
                foreign(
                    "add",
                    vec![Exp::in_var("x"), Exp::IntLit(1), Exp::out_var("x")],
                ),
                foreign("move", vec![Exp::in_var("x"), Exp::out_var("r")]),
            ]),
            Determinism::Det,
        );
        def.var_types.insert("a".into(), TypeSpec::int());
        def.var_types.insert("x".into(), TypeSpec::int());
        def.var_types.insert("r".into(), TypeSpec::int());
        let def = compiled(def);

        let ProcImpl::Prim(body) = &def.impln else { panic!() };
        // After the backward pass the second add writes r directly.
        assert_eq!(body.prims.len(), 2);
        let outs: Vec<Vec<String>> = body
            .prims
            .iter()
            .map(|p| p.node.output_names())
            .collect();
        assert_eq!(outs[0], vec!["x"]);
        assert_eq!(outs[1], vec!["r"]);
        // The canonicalised add reads x with a final-use mark.
        let Prim::Foreign { args, .. } = &body.prims[1].node else { panic!() };
        assert!(args.iter().any(|a| {
            matches!(a, PrimArg::Var { name, last_use, .. }
                     if name == "x" && *last_use)
        }));
    }

    #[test]
    fn cond_compiles_to_terminal_fork() {
        let mut def = ProcDef::new(
            ProcProto::new(
                "pick",
                vec![
                    Param::new("b", TypeSpec::bool(), FlowDirection::In),
                    Param::new("r", TypeSpec::int(), FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Cond {
                test: Box::new(Spanned::unplaced(Stmt::TestBool(
                    Spanned::unplaced(Exp::in_var("b")),
                ))),
                then: vec![foreign(
                    "move",
                    vec![Exp::IntLit(1), Exp::out_var("r")],
                )],
                els: vec![foreign(
                    "move",
                    vec![Exp::IntLit(0), Exp::out_var("r")],
                )],
                cond_vars: None,
                exit_vars: None,
            })]),
            Determinism::Det,
        );
        def.var_types.insert("b".into(), TypeSpec::bool());
        def.var_types.insert("r".into(), TypeSpec::int());
        let def = compiled(def);

        let ProcImpl::Prim(body) = &def.impln else { panic!() };
        assert!(body.prims.is_empty());
        let PrimFork::Fork { var, bodies, last_use, .. } = &body.fork else {
            panic!("expected fork")
        };
        assert_eq!(var, "b");
        assert!(*last_use);
        assert_eq!(bodies.len(), 2);
        // Branch 0 = else (false), branch 1 = then (true).
        let val_of = |b: &plume_core::ProcBody| {
            b.prims[0].node.as_move().unwrap().0.int_value().unwrap()
        };
        assert_eq!(val_of(&bodies[0]), 0);
        assert_eq!(val_of(&bodies[1]), 1);
    }

    #[test]
    fn call_arguments_take_callee_param_types() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(ProcDef::new(
            ProcProto::new(
                "take_char",
                vec![Param::new("c", TypeSpec::char(), FlowDirection::In)],
            ),
            ProcImpl::Source(vec![]),
            Determinism::Det,
        ));
        let info = ProcInfoTable::from_module(&m);
        let mut def = ProcDef::new(
            ProcProto::new("caller", vec![]),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Call {
                module: ModulePath::local(),
                name: "take_char".into(),
                id: Some(ProcId(0)),
                resourceful: false,
                args: vec![Spanned::unplaced(Exp::IntLit(65))],
            })]),
            Determinism::Det,
        );
        compile_proc(&m, &info, &mut def);
        let ProcImpl::Prim(body) = &def.impln else { panic!() };
        let Prim::Call { args, .. } = &body.prims[0].node else { panic!() };
        assert_eq!(args[0].ty(), Some(&TypeSpec::char()));
    }

    #[test]
    fn typed_literal_uses_annotation() {
        // The success-flag moves written by unbranching carry bool
        // annotations on integer literals.
        let mut def = ProcDef::new(
            ProcProto::new(
                "flag",
                vec![Param::new("s", TypeSpec::bool(), FlowDirection::Out)],
            ),
            ProcImpl::Source(vec![Spanned::unplaced(Stmt::Foreign {
                lang: "llvm".into(),
                name: "move".into(),
                flags: vec![],
                args: vec![
                    Spanned::unplaced(Exp::Typed {
                        exp: Box::new(Spanned::unplaced(Exp::IntLit(1))),
                        ty: TypeSpec::bool(),
                        cast: false,
                    }),
                    Spanned::unplaced(Exp::out_var("s")),
                ],
            })]),
            Determinism::Det,
        );
        def.var_types.insert("s".into(), TypeSpec::bool());
        let def = compiled(def);
        let ProcImpl::Prim(body) = &def.impln else { panic!() };
        let (src, _) = body.prims[0].node.as_move().unwrap();
        assert_eq!(src.ty(), Some(&TypeSpec::bool()));
        assert_eq!(src.int_value(), Some(1));
    }

    #[test]
    fn output_rebinding_in_branches_stays_linear() {
        // Both branches bind r; each leaf's final version moves into r,
        // then the backward rename folds it away.
        let mut def = ProcDef::new(
            ProcProto::new(
                "twice",
                vec![
                    Param::new("b", TypeSpec::bool(), FlowDirection::In),
                    Param::new("r", TypeSpec::int(), FlowDirection::Out),
                ],
            ),
            ProcImpl::Source(vec![
                foreign("move", vec![Exp::IntLit(5), Exp::out_var("r")]),
                Spanned::unplaced(Stmt::Cond {
                    test: Box::new(Spanned::unplaced(Stmt::TestBool(
                        Spanned::unplaced(Exp::in_var("b")),
                    ))),
                    then: vec![foreign(
                        "move",
                        vec![Exp::IntLit(7), Exp::out_var("r")],
                    )],
                    els: vec![],
                    cond_vars: None,
                    exit_vars: None,
                }),
            ]),
            Determinism::Det,
        );
        def.var_types.insert("b".into(), TypeSpec::bool());
        def.var_types.insert("r".into(), TypeSpec::int());
        let def = compiled(def);

        let ProcImpl::Prim(body) = &def.impln else { panic!() };
        let PrimFork::Fork { bodies, .. } = &body.fork else { panic!() };
        // r is bound exactly once on every linear path: the else leaf
        // moves the stem's value into r, the then leaf binds 7 directly.
        let leaf_binds_r = |b: &plume_core::ProcBody| {
            b.prims
                .iter()
                .filter(|p| p.node.output_names() == vec!["r".to_string()])
                .count()
        };
        assert_eq!(leaf_binds_r(&bodies[0]), 1);
        assert_eq!(leaf_binds_r(&bodies[1]), 1);
        let (then_src, _) = bodies[1]
            .prims
            .iter()
            .find_map(|p| p.node.as_move())
            .expect("then leaf binds r by move");
        assert_eq!(then_src.int_value(), Some(7));
        // The stem binds only the intermediate version, never r itself.
        assert!(body
            .prims
            .iter()
            .all(|p| !p.node.output_names().contains(&"r".to_string())));
    }
}
