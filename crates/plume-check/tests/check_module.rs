//! Whole-module checking: SCC ordering, fix-point iteration, and error
//! collection.

use plume_core::{
    Determinism, ErrorKind, Exp, FlowDirection, Module, ModulePath, Param,
    ProcDef, ProcImpl, ProcProto, SourcePos, Spanned, Stmt, StmtNode, TypeSpec,
};

fn call(name: &str, args: Vec<Exp>) -> StmtNode {
    Spanned::unplaced(Stmt::Call {
        module: ModulePath::local(),
        name: name.into(),
        id: None,
        resourceful: false,
        args: args.into_iter().map(Spanned::unplaced).collect(),
    })
}

fn call_at(name: &str, args: Vec<Exp>, line: u32) -> StmtNode {
    Spanned::new(
        Stmt::Call {
            module: ModulePath::local(),
            name: name.into(),
            id: None,
            resourceful: false,
            args: args.into_iter().map(Spanned::unplaced).collect(),
        },
        Some(SourcePos::new("mod.plume", line, 1)),
    )
}

fn foreign_add(a: Exp, b: Exp, out: Exp) -> StmtNode {
    Spanned::unplaced(Stmt::Foreign {
        lang: "llvm".into(),
        name: "add".into(),
        flags: vec![],
        args: vec![
            Spanned::unplaced(a),
            Spanned::unplaced(b),
            Spanned::unplaced(out),
        ],
    })
}

#[test]
fn types_propagate_through_call_chain() {
    // leaf fixes its parameter as int via foreign add; mid and top have no
    // declarations at all, yet end up fully typed through the SCC order.
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "leaf",
            vec![
                Param::new("x", TypeSpec::Any, FlowDirection::In),
                Param::new("r", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![foreign_add(
            Exp::in_var("x"),
            Exp::IntLit(1),
            Exp::out_var("r"),
        )]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "mid",
            vec![
                Param::new("a", TypeSpec::Any, FlowDirection::In),
                Param::new("b", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![call(
            "leaf",
            vec![Exp::in_var("a"), Exp::out_var("b")],
        )]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "top",
            vec![Param::new("out", TypeSpec::Any, FlowDirection::Out)],
        ),
        ProcImpl::Source(vec![call(
            "mid",
            vec![Exp::IntLit(41), Exp::out_var("out")],
        )]),
        Determinism::Det,
    ));

    let report = plume_check::check_module(&mut m);
    assert!(report.is_clean(), "{:?}", report.diags);

    for name in ["leaf", "mid", "top"] {
        for param in &m.overloads(name)[0].proto.params {
            assert_eq!(param.ty, TypeSpec::int(), "{}.{}", name, param.name);
        }
    }
}

#[test]
fn cyclic_scc_reaches_fixed_point() {
    // even/odd call each other; the type comes in from a foreign op in
    // even only, and must reach odd through the cycle.
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "even",
            vec![
                Param::new("n", TypeSpec::Any, FlowDirection::In),
                Param::new("r", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![
            foreign_add(Exp::in_var("n"), Exp::IntLit(-1), Exp::out_var("m")),
            call("odd", vec![Exp::in_var("m"), Exp::out_var("t")]),
            foreign_add(Exp::in_var("t"), Exp::IntLit(1), Exp::out_var("r")),
        ]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "odd",
            vec![
                Param::new("n", TypeSpec::Any, FlowDirection::In),
                Param::new("r", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![call(
            "even",
            vec![Exp::in_var("n"), Exp::out_var("r")],
        )]),
        Determinism::Det,
    ));

    let report = plume_check::check_module(&mut m);
    assert!(report.is_clean(), "{:?}", report.diags);
    assert_eq!(m.overloads("odd")[0].proto.params[0].ty, TypeSpec::int());
    assert_eq!(m.overloads("even")[0].proto.params[1].ty, TypeSpec::int());
}

#[test]
fn every_variable_resolved_after_check() {
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "f",
            vec![
                Param::new("x", TypeSpec::int(), FlowDirection::In),
                Param::new("r", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![
            foreign_add(Exp::in_var("x"), Exp::IntLit(2), Exp::out_var("t")),
            foreign_add(Exp::in_var("t"), Exp::in_var("x"), Exp::out_var("r")),
        ]),
        Determinism::Det,
    ));
    let report = plume_check::check_module(&mut m);
    assert!(report.is_clean(), "{:?}", report.diags);
    let def = &m.overloads("f")[0];
    for (var, ty) in &def.var_types {
        assert!(!ty.is_any(), "variable {} left untyped", var);
    }
}

#[test]
fn errors_collected_and_sorted_by_position() {
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(ProcDef::new(
        ProcProto::new("g", vec![]),
        ProcImpl::Source(vec![
            call_at("missing_b", vec![], 9),
            call_at("missing_a", vec![], 2),
        ]),
        Determinism::Det,
    ));
    let report = plume_check::check_module(&mut m);
    assert_eq!(report.diags.len(), 2);
    // Reported in source order, not emission order.
    assert!(
        matches!(&report.diags[0].kind, ErrorKind::UnknownProc { name } if name == "missing_a")
    );
    assert!(
        matches!(&report.diags[1].kind, ErrorKind::UnknownProc { name } if name == "missing_b")
    );
    assert_eq!(report.failed.len(), 1);
}

#[test]
fn failing_proc_does_not_block_others() {
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(ProcDef::new(
        ProcProto::new("bad", vec![]),
        ProcImpl::Source(vec![call("nonexistent", vec![])]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "good",
            vec![
                Param::new("x", TypeSpec::int(), FlowDirection::In),
                Param::new("r", TypeSpec::Any, FlowDirection::Out),
            ],
        ),
        ProcImpl::Source(vec![foreign_add(
            Exp::in_var("x"),
            Exp::IntLit(1),
            Exp::out_var("r"),
        )]),
        Determinism::Det,
    ));
    let report = plume_check::check_module(&mut m);
    assert_eq!(report.failed.len(), 1);
    // good is fully checked despite bad's failure.
    assert_eq!(m.overloads("good")[0].proto.params[1].ty, TypeSpec::int());
}

#[test]
fn public_proc_with_undeclared_type_rejected() {
    let mut m = Module::new(ModulePath::from_name("mod"));
    m.add_proc(
        ProcDef::new(
            ProcProto::new(
                "api",
                vec![Param::new("x", TypeSpec::Any, FlowDirection::In)],
            ),
            ProcImpl::Source(vec![]),
            Determinism::Det,
        )
        .public(),
    );
    let report = plume_check::check_module(&mut m);
    assert!(report
        .diags
        .iter()
        .any(|d| matches!(d.kind, ErrorKind::UndeclaredParamType { .. })));
}

#[test]
fn mode_errors_and_type_errors_both_reported() {
    let mut m = Module::new(ModulePath::from_name("mod"));
    // ok_proc mode-fails (input never bound); clash type-fails.
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "needs_input",
            vec![Param::new("x", TypeSpec::int(), FlowDirection::In)],
        ),
        ProcImpl::Source(vec![]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new("user", vec![]),
        ProcImpl::Source(vec![call("needs_input", vec![Exp::in_var("ghost")])]),
        Determinism::Det,
    ));
    m.add_proc(ProcDef::new(
        ProcProto::new(
            "clash",
            vec![Param::new("y", TypeSpec::int(), FlowDirection::In)],
        ),
        ProcImpl::Source(vec![foreign_add(
            Exp::in_var("y"),
            Exp::FloatLit(0.5),
            Exp::out_var("z"),
        )]),
        Determinism::Det,
    ));
    let report = plume_check::check_module(&mut m);
    assert!(report
        .diags
        .iter()
        .any(|d| matches!(d.kind, ErrorKind::UnknownVariable { .. })));
    assert!(report
        .diags
        .iter()
        .any(|d| matches!(d.kind, ErrorKind::TypeConflict { .. })));
    assert_eq!(report.failed.len(), 2);
}
