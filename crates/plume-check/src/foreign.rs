//! Validation of foreign instruction signatures.
//!
//! `llvm` operations are checked against an operation table: arity, operand
//! representation family, and bit-width agreement. `lpvm` memory primitives
//! have fixed arities and argument families. `c` calls are not validated.
//!
//! The type checker calls [`validate_foreign`] during mode checking, once
//! argument types are final.

use plume_core::{Diagnostic, ErrorKind, SourcePos, TypeFamily, TypeSpec};

/// One argument as the validator sees it: its type and whether it flows out.
#[derive(Debug, Clone)]
pub struct ForeignArg {
    pub ty: TypeSpec,
    pub is_out: bool,
}

/// What an llvm operation expects of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandClass {
    /// Signed or unsigned integer words.
    Int,
    /// Floating point.
    Float,
    /// Any single representation (move).
    Same,
}

impl OperandClass {
    fn admits(self, family: TypeFamily) -> bool {
        match self {
            OperandClass::Int => {
                matches!(family, TypeFamily::Bits | TypeFamily::Signed)
            }
            OperandClass::Float => family == TypeFamily::Float,
            OperandClass::Same => true,
        }
    }

    fn expected_family(self) -> TypeFamily {
        match self {
            OperandClass::Int => TypeFamily::Signed,
            OperandClass::Float => TypeFamily::Float,
            OperandClass::Same => TypeFamily::Address,
        }
    }
}

pub fn is_llvm_binop(name: &str) -> bool {
    llvm_binop_class(name).is_some()
}

pub fn is_llvm_comparison(name: &str) -> bool {
    llvm_comparison_class(name).is_some()
}

pub fn is_llvm_conversion(name: &str) -> bool {
    matches!(
        name,
        "zext" | "sext" | "trunc" | "uitofp" | "sitofp" | "fptoui" | "fptosi"
            | "bitcast"
    )
}

fn llvm_binop_class(name: &str) -> Option<OperandClass> {
    match name {
        "add" | "sub" | "mul" | "sdiv" | "udiv" | "srem" | "urem" | "and"
        | "or" | "xor" | "shl" | "lshr" | "ashr" => Some(OperandClass::Int),
        "fadd" | "fsub" | "fmul" | "fdiv" | "frem" => Some(OperandClass::Float),
        _ => None,
    }
}

fn llvm_comparison_class(name: &str) -> Option<OperandClass> {
    match name {
        "icmp_eq" | "icmp_ne" | "icmp_slt" | "icmp_sle" | "icmp_sgt"
        | "icmp_sge" | "icmp_ult" | "icmp_ule" | "icmp_ugt" | "icmp_uge" => {
            Some(OperandClass::Int)
        }
        "fcmp_eq" | "fcmp_ne" | "fcmp_lt" | "fcmp_le" | "fcmp_gt" | "fcmp_ge" => {
            Some(OperandClass::Float)
        }
        _ => None,
    }
}

/// Arity of an lpvm primitive, if the name is known.
fn lpvm_arity(name: &str) -> Option<usize> {
    match name {
        "alloc" => Some(2),
        "access" => Some(5),
        "mutate" => Some(7),
        "cast" => Some(2),
        "load" => Some(2),
        "store" => Some(2),
        _ => None,
    }
}

/// Validates one foreign instruction, returning every problem found.
pub fn validate_foreign(
    lang: &str,
    name: &str,
    args: &[ForeignArg],
    pos: &Option<SourcePos>,
) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let report = |diags: &mut Vec<Diagnostic>, kind: ErrorKind| {
        diags.push(Diagnostic::new(pos.clone(), kind));
    };

    match lang {
        "c" => {}
        "llvm" => {
            if let Some(class) = llvm_binop_class(name) {
                check_binop(name, class, args, pos, &mut diags);
            } else if let Some(class) = llvm_comparison_class(name) {
                check_comparison(name, class, args, pos, &mut diags);
            } else if name == "move" {
                if args.len() != 2 {
                    report(
                        &mut diags,
                        ErrorKind::ForeignArity {
                            name: name.to_string(),
                            expected: 2,
                            found: args.len(),
                        },
                    );
                } else {
                    let (l, r) = (args[0].ty.bit_width(), args[1].ty.bit_width());
                    if l != r {
                        report(
                            &mut diags,
                            ErrorKind::ForeignRepMismatch {
                                name: name.to_string(),
                                left: l,
                                right: r,
                            },
                        );
                    }
                }
            } else if is_llvm_conversion(name) {
                if args.len() != 2 {
                    report(
                        &mut diags,
                        ErrorKind::ForeignArity {
                            name: name.to_string(),
                            expected: 2,
                            found: args.len(),
                        },
                    );
                }
            } else {
                report(
                    &mut diags,
                    ErrorKind::UnknownForeignOp {
                        lang: lang.to_string(),
                        name: name.to_string(),
                    },
                );
            }
        }
        "lpvm" => match lpvm_arity(name) {
            Some(expected) => {
                if args.len() != expected {
                    report(
                        &mut diags,
                        ErrorKind::ForeignArity {
                            name: name.to_string(),
                            expected,
                            found: args.len(),
                        },
                    );
                } else {
                    check_lpvm_families(name, args, pos, &mut diags);
                }
            }
            None => report(
                &mut diags,
                ErrorKind::UnknownForeignOp {
                    lang: lang.to_string(),
                    name: name.to_string(),
                },
            ),
        },
        _ => report(
            &mut diags,
            ErrorKind::UnknownForeignLanguage {
                lang: lang.to_string(),
            },
        ),
    }
    diags
}

/// Binops take two inputs and one output, all of the operation's family,
/// with agreeing representations.
fn check_binop(
    name: &str,
    class: OperandClass,
    args: &[ForeignArg],
    pos: &Option<SourcePos>,
    diags: &mut Vec<Diagnostic>,
) {
    if args.len() != 3 {
        diags.push(Diagnostic::new(
            pos.clone(),
            ErrorKind::ForeignArity {
                name: name.to_string(),
                expected: 3,
                found: args.len(),
            },
        ));
        return;
    }
    check_out_positions(name, args, &[2], pos, diags);
    for (i, arg) in args.iter().enumerate() {
        let family = arg.ty.family();
        if !class.admits(family) {
            diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::ForeignArgFamily {
                    name: name.to_string(),
                    index: i,
                    expected: class.expected_family(),
                    found: family,
                },
            ));
        }
    }
    let w0 = args[0].ty.bit_width();
    for arg in &args[1..] {
        if arg.ty.bit_width() != w0 {
            diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::ForeignRepMismatch {
                    name: name.to_string(),
                    left: w0,
                    right: arg.ty.bit_width(),
                },
            ));
            break;
        }
    }
}

/// Comparisons take two inputs of the operation's family and one 1-bit
/// output.
fn check_comparison(
    name: &str,
    class: OperandClass,
    args: &[ForeignArg],
    pos: &Option<SourcePos>,
    diags: &mut Vec<Diagnostic>,
) {
    if args.len() != 3 {
        diags.push(Diagnostic::new(
            pos.clone(),
            ErrorKind::ForeignArity {
                name: name.to_string(),
                expected: 3,
                found: args.len(),
            },
        ));
        return;
    }
    check_out_positions(name, args, &[2], pos, diags);
    for (i, arg) in args.iter().take(2).enumerate() {
        let family = arg.ty.family();
        if !class.admits(family) {
            diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::ForeignArgFamily {
                    name: name.to_string(),
                    index: i,
                    expected: class.expected_family(),
                    found: family,
                },
            ));
        }
    }
    let out_family = args[2].ty.family();
    if out_family != TypeFamily::Bits {
        diags.push(Diagnostic::new(
            pos.clone(),
            ErrorKind::ForeignArgFamily {
                name: name.to_string(),
                index: 2,
                expected: TypeFamily::Bits,
                found: out_family,
            },
        ));
    }
    if args[0].ty.bit_width() != args[1].ty.bit_width() {
        diags.push(Diagnostic::new(
            pos.clone(),
            ErrorKind::ForeignRepMismatch {
                name: name.to_string(),
                left: args[0].ty.bit_width(),
                right: args[1].ty.bit_width(),
            },
        ));
    }
}

/// Exactly the listed positions must flow out; everything else must flow
/// in.
fn check_out_positions(
    name: &str,
    args: &[ForeignArg],
    outs: &[usize],
    pos: &Option<SourcePos>,
    diags: &mut Vec<Diagnostic>,
) {
    use plume_core::FlowDirection;
    for (i, arg) in args.iter().enumerate() {
        let should_be_out = outs.contains(&i);
        if arg.is_out != should_be_out {
            diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::WrongFlow {
                    name: format!("{} argument {}", name, i),
                    expected: if should_be_out {
                        FlowDirection::Out
                    } else {
                        FlowDirection::In
                    },
                    found: if arg.is_out {
                        FlowDirection::Out
                    } else {
                        FlowDirection::In
                    },
                },
            ));
        }
    }
}

/// Family requirements of the lpvm primitives:
/// `alloc(size, ?addr)`, `access(addr, offset, size, start, ?val)`,
/// `mutate(addr, ?addr, offset, destructive, size, start, val)`,
/// `cast(in, ?out)`, `load(global, ?val)`, `store(val, global)`.
fn check_lpvm_families(
    name: &str,
    args: &[ForeignArg],
    pos: &Option<SourcePos>,
    diags: &mut Vec<Diagnostic>,
) {
    let out_positions: &[usize] = match name {
        "alloc" | "cast" | "load" => &[1],
        "access" => &[4],
        "mutate" => &[1],
        "store" => &[],
        _ => &[],
    };
    check_out_positions(name, args, out_positions, pos, diags);

    let int_ok = |f: TypeFamily| matches!(f, TypeFamily::Bits | TypeFamily::Signed);
    let addr_ok = |f: TypeFamily| f == TypeFamily::Address;
    let requirements: &[(usize, &dyn Fn(TypeFamily) -> bool, TypeFamily)] = match name {
        "alloc" => &[(0, &int_ok, TypeFamily::Signed), (1, &addr_ok, TypeFamily::Address)],
        "access" => &[
            (0, &addr_ok, TypeFamily::Address),
            (1, &int_ok, TypeFamily::Signed),
            (2, &int_ok, TypeFamily::Signed),
            (3, &int_ok, TypeFamily::Signed),
        ],
        "mutate" => &[
            (0, &addr_ok, TypeFamily::Address),
            (1, &addr_ok, TypeFamily::Address),
            (2, &int_ok, TypeFamily::Signed),
            (3, &int_ok, TypeFamily::Signed),
            (4, &int_ok, TypeFamily::Signed),
            (5, &int_ok, TypeFamily::Signed),
        ],
        // cast/load/store place no family requirements.
        _ => &[],
    };
    for &(i, admits, expected) in requirements {
        let family = args[i].ty.family();
        if !admits(family) {
            diags.push(Diagnostic::new(
                pos.clone(),
                ErrorKind::ForeignArgFamily {
                    name: name.to_string(),
                    index: i,
                    expected,
                    found: family,
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(ty: TypeSpec, is_out: bool) -> ForeignArg {
        ForeignArg { ty, is_out }
    }

    #[test]
    fn valid_add() {
        let diags = validate_foreign(
            "llvm",
            "add",
            &[
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(diags.is_empty());
    }

    #[test]
    fn add_rejects_float_operand() {
        let diags = validate_foreign(
            "llvm",
            "add",
            &[
                arg(TypeSpec::int(), false),
                arg(TypeSpec::float(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(diags
            .iter()
            .any(|d| matches!(d.kind, ErrorKind::ForeignArgFamily { index: 1, .. })));
    }

    #[test]
    fn add_rejects_mixed_widths() {
        let diags = validate_foreign(
            "llvm",
            "add",
            &[
                arg(TypeSpec::int(), false),
                arg(TypeSpec::char(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(diags
            .iter()
            .any(|d| matches!(d.kind, ErrorKind::ForeignRepMismatch { .. })));
    }

    #[test]
    fn comparison_output_must_be_one_bit() {
        let diags = validate_foreign(
            "llvm",
            "icmp_slt",
            &[
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(diags
            .iter()
            .any(|d| matches!(d.kind, ErrorKind::ForeignArgFamily { index: 2, .. })));

        let ok = validate_foreign(
            "llvm",
            "icmp_slt",
            &[
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::bool(), true),
            ],
            &None,
        );
        assert!(ok.is_empty());
    }

    #[test]
    fn unknown_llvm_op() {
        let diags = validate_foreign("llvm", "frobnicate", &[], &None);
        assert!(matches!(
            diags[0].kind,
            ErrorKind::UnknownForeignOp { .. }
        ));
    }

    #[test]
    fn unknown_language() {
        let diags = validate_foreign("fortran", "add", &[], &None);
        assert!(matches!(
            diags[0].kind,
            ErrorKind::UnknownForeignLanguage { .. }
        ));
    }

    #[test]
    fn c_calls_not_validated() {
        let diags = validate_foreign("c", "anything_at_all", &[], &None);
        assert!(diags.is_empty());
    }

    #[test]
    fn lpvm_arities_enforced() {
        let tree = TypeSpec::builtin("tree");
        let diags = validate_foreign(
            "lpvm",
            "mutate",
            &[arg(tree.clone(), false), arg(tree, true)],
            &None,
        );
        assert!(matches!(
            diags[0].kind,
            ErrorKind::ForeignArity {
                expected: 7,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn lpvm_access_families() {
        let tree = TypeSpec::builtin("tree");
        let ok = validate_foreign(
            "lpvm",
            "access",
            &[
                arg(tree.clone(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(ok.is_empty());

        let bad = validate_foreign(
            "lpvm",
            "access",
            &[
                arg(TypeSpec::float(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), false),
                arg(TypeSpec::int(), true),
            ],
            &None,
        );
        assert!(bad
            .iter()
            .any(|d| matches!(d.kind, ErrorKind::ForeignArgFamily { index: 0, .. })));
    }

    #[test]
    fn move_requires_same_width() {
        let diags = validate_foreign(
            "llvm",
            "move",
            &[arg(TypeSpec::int(), false), arg(TypeSpec::bool(), true)],
            &None,
        );
        assert!(matches!(
            diags[0].kind,
            ErrorKind::ForeignRepMismatch { left: 64, right: 1, .. }
        ));
    }
}
