//! Declaration validation: the cheap structural checks that run before any
//! inference.
//!
//! Public procedures must declare every parameter type (an exported
//! signature cannot be inferred from callers in other modules), and
//! declared parameter flows must be `In` or `Out` -- the by-reference flows
//! are introduced by later passes, never written.

use plume_core::{
    Diagnostic, ErrorKind, FlowDirection, Module, ProcSpec,
};

/// Validates every declaration in the module, returning the offending
/// procedure along with each diagnostic.
pub fn validate_decls(module: &Module) -> Vec<(ProcSpec, Diagnostic)> {
    let mut diags = Vec::new();
    for spec in module.all_specs() {
        let def = module.get_proc(&spec).expect("spec enumerated from table");
        for param in &def.proto.params {
            if def.is_public() && param.ty.is_any() {
                diags.push((
                    spec.clone(),
                    Diagnostic::new(
                        def.pos.clone(),
                        ErrorKind::UndeclaredParamType {
                            proc_name: def.proto.name.clone(),
                            param: param.name.clone(),
                        },
                    ),
                ));
            }
            if !matches!(param.flow, FlowDirection::In | FlowDirection::Out) {
                diags.push((
                    spec.clone(),
                    Diagnostic::new(
                        def.pos.clone(),
                        ErrorKind::WrongFlow {
                            name: param.name.clone(),
                            expected: FlowDirection::In,
                            found: param.flow,
                        },
                    ),
                ));
            }
        }
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::{
        Determinism, ModulePath, Param, ProcDef, ProcImpl, ProcProto, TypeSpec,
    };

    #[test]
    fn public_proc_with_any_param_rejected() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(
            ProcDef::new(
                ProcProto::new(
                    "exported",
                    vec![Param::new("x", TypeSpec::Any, FlowDirection::In)],
                ),
                ProcImpl::Source(vec![]),
                Determinism::Det,
            )
            .public(),
        );
        let diags = validate_decls(&m);
        assert_eq!(diags.len(), 1);
        assert!(matches!(
            diags[0].1.kind,
            ErrorKind::UndeclaredParamType { .. }
        ));
    }

    #[test]
    fn private_proc_with_any_param_allowed() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(ProcDef::new(
            ProcProto::new(
                "helper",
                vec![Param::new("x", TypeSpec::Any, FlowDirection::In)],
            ),
            ProcImpl::Source(vec![]),
            Determinism::Det,
        ));
        assert!(validate_decls(&m).is_empty());
    }

    #[test]
    fn declared_reference_flow_rejected() {
        let mut m = Module::new(ModulePath::from_name("m"));
        m.add_proc(ProcDef::new(
            ProcProto::new(
                "weird",
                vec![Param::new(
                    "x",
                    TypeSpec::int(),
                    FlowDirection::OutByReference,
                )],
            ),
            ProcImpl::Source(vec![]),
            Determinism::Det,
        ));
        let diags = validate_decls(&m);
        assert_eq!(diags.len(), 1);
        assert!(matches!(diags[0].1.kind, ErrorKind::WrongFlow { .. }));
    }
}
