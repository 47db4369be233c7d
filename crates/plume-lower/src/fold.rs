//! Constant folding and algebraic simplification of llvm-level
//! instructions.
//!
//! [`simplify`] rewrites an instruction whose operands are known constants
//! into a `move` of the folded value, applies identity and annihilator laws
//! (`x + 0 = x`, `x & -1 = x`, ...), canonicalises commutative operand
//! order, and normalises unsigned comparisons against 0 and 1 to equality
//! tests. Floating-point folding is restricted to fully-constant operands;
//! float identities are never applied (`x * 0.0` is not `0.0` for NaN, and
//! `x + 0.0` is not `x` for `-0.0`).
//!
//! [`equivalents`] lists the algebraically equivalent instruction forms a
//! freshly emitted instruction implies, so the common-subexpression table
//! can answer for them too.

use std::cmp::Ordering;

use plume_core::{ForeignLang, Prim, PrimArg};

/// Integer operations where operand order does not matter.
fn is_commutative(name: &str) -> bool {
    matches!(
        name,
        "add" | "mul" | "and" | "or" | "xor" | "icmp_eq" | "icmp_ne" | "fadd"
            | "fmul" | "fcmp_eq" | "fcmp_ne"
    )
}

/// Simplifies one instruction. Anything that is not an llvm instruction
/// with foldable operands comes back unchanged.
pub fn simplify(prim: Prim) -> Prim {
    let Prim::Foreign {
        lang: ForeignLang::Llvm,
        name,
        flags,
        mut args,
    } = prim
    else {
        return prim;
    };

    if args.len() == 3 {
        let out = args[2].clone();
        let (a, b) = (args[0].clone(), args[1].clone());

        // Fully-constant integer operands.
        if let (Some(x), Some(y)) = (a.int_value(), b.int_value()) {
            if let Some(v) = fold_int(&name, x, y) {
                let ty = out.ty().cloned().unwrap_or_else(plume_core::TypeSpec::int);
                return Prim::move_prim(PrimArg::Int { value: v, ty }, out);
            }
        }

        // Fully-constant float operands.
        if let (PrimArg::Float { value: x, .. }, PrimArg::Float { value: y, .. }) =
            (&a, &b)
        {
            if let Some(folded) = fold_float(&name, *x, *y, &out) {
                return folded;
            }
        }

        // Integer identity and annihilator laws.
        if let Some(folded) = fold_identity(&name, &a, &b, &out) {
            return folded;
        }

        // Unsigned comparisons against 0 and 1 reduce to equality tests.
        if let Some(y) = b.int_value() {
            let replacement = match (name.as_str(), y) {
                ("icmp_ult", 1) | ("icmp_ule", 0) => Some("icmp_eq"),
                ("icmp_uge", 1) | ("icmp_ugt", 0) => Some("icmp_ne"),
                _ => None,
            };
            if let Some(newname) = replacement {
                let zero = PrimArg::Int {
                    value: 0,
                    ty: a.ty().cloned().unwrap_or_else(plume_core::TypeSpec::int),
                };
                let mut newargs = args.clone();
                newargs[1] = zero;
                return simplify(Prim::Foreign {
                    lang: ForeignLang::Llvm,
                    name: newname.to_string(),
                    flags,
                    args: newargs,
                });
            }
        }

        // Commutative operations order their operands canonically so the
        // CSE table sees one spelling.
        if is_commutative(&name) && arg_cmp(&args[0], &args[1]) == Ordering::Greater {
            args.swap(0, 1);
        }
    }

    Prim::Foreign {
        lang: ForeignLang::Llvm,
        name,
        flags,
        args,
    }
}

/// Folds an integer operation over constant operands. Division by zero and
/// out-of-range shifts stay unfolded (they are poison, not values).
fn fold_int(name: &str, x: i64, y: i64) -> Option<i64> {
    let bool_to_i64 = |b: bool| b as i64;
    Some(match name {
        "add" => x.wrapping_add(y),
        "sub" => x.wrapping_sub(y),
        "mul" => x.wrapping_mul(y),
        "sdiv" => {
            if y == 0 || (x == i64::MIN && y == -1) {
                return None;
            }
            x.wrapping_div(y)
        }
        "udiv" => {
            if y == 0 {
                return None;
            }
            ((x as u64) / (y as u64)) as i64
        }
        "srem" => {
            if y == 0 || (x == i64::MIN && y == -1) {
                return None;
            }
            x.wrapping_rem(y)
        }
        "urem" => {
            if y == 0 {
                return None;
            }
            ((x as u64) % (y as u64)) as i64
        }
        "and" => x & y,
        "or" => x | y,
        "xor" => x ^ y,
        "shl" => {
            if !(0..64).contains(&y) {
                return None;
            }
            x.wrapping_shl(y as u32)
        }
        "lshr" => {
            if !(0..64).contains(&y) {
                return None;
            }
            ((x as u64) >> (y as u32)) as i64
        }
        "ashr" => {
            if !(0..64).contains(&y) {
                return None;
            }
            x >> (y as u32)
        }
        "icmp_eq" => bool_to_i64(x == y),
        "icmp_ne" => bool_to_i64(x != y),
        "icmp_slt" => bool_to_i64(x < y),
        "icmp_sle" => bool_to_i64(x <= y),
        "icmp_sgt" => bool_to_i64(x > y),
        "icmp_sge" => bool_to_i64(x >= y),
        "icmp_ult" => bool_to_i64((x as u64) < (y as u64)),
        "icmp_ule" => bool_to_i64((x as u64) <= (y as u64)),
        "icmp_ugt" => bool_to_i64((x as u64) > (y as u64)),
        "icmp_uge" => bool_to_i64((x as u64) >= (y as u64)),
        _ => return None,
    })
}

/// Folds a float operation over constant operands into a move.
fn fold_float(name: &str, x: f64, y: f64, out: &PrimArg) -> Option<Prim> {
    let ty = out
        .ty()
        .cloned()
        .unwrap_or_else(plume_core::TypeSpec::float);
    let float_result = |v: f64| {
        Some(Prim::move_prim(
            PrimArg::Float { value: v, ty: ty.clone() },
            out.clone(),
        ))
    };
    let bool_result = |b: bool| {
        Some(Prim::move_prim(PrimArg::bool_const(b), out.clone()))
    };
    match name {
        "fadd" => float_result(x + y),
        "fsub" => float_result(x - y),
        "fmul" => float_result(x * y),
        "fdiv" => float_result(x / y),
        "fcmp_eq" => bool_result(x == y),
        "fcmp_ne" => bool_result(x != y),
        "fcmp_lt" => bool_result(x < y),
        "fcmp_le" => bool_result(x <= y),
        "fcmp_gt" => bool_result(x > y),
        "fcmp_ge" => bool_result(x >= y),
        _ => None,
    }
}

/// Integer identity and annihilator laws with one constant operand.
fn fold_identity(
    name: &str,
    a: &PrimArg,
    b: &PrimArg,
    out: &PrimArg,
) -> Option<Prim> {
    let move_of = |src: &PrimArg| Some(Prim::move_prim(src.clone(), out.clone()));
    let const_of = |v: i64| {
        let ty = out.ty().cloned().unwrap_or_else(plume_core::TypeSpec::int);
        Some(Prim::move_prim(PrimArg::Int { value: v, ty }, out.clone()))
    };
    let (av, bv) = (a.int_value(), b.int_value());
    match name {
        "add" => match (av, bv) {
            (Some(0), _) => move_of(b),
            (_, Some(0)) => move_of(a),
            _ => None,
        },
        "sub" => match bv {
            Some(0) => move_of(a),
            _ => None,
        },
        "mul" => match (av, bv) {
            (Some(1), _) => move_of(b),
            (_, Some(1)) => move_of(a),
            (Some(0), _) | (_, Some(0)) => const_of(0),
            _ => None,
        },
        "sdiv" | "udiv" => match bv {
            Some(1) => move_of(a),
            _ => None,
        },
        "and" => match (av, bv) {
            (Some(-1), _) => move_of(b),
            (_, Some(-1)) => move_of(a),
            (Some(0), _) | (_, Some(0)) => const_of(0),
            _ => None,
        },
        "or" => match (av, bv) {
            (Some(0), _) => move_of(b),
            (_, Some(0)) => move_of(a),
            (Some(-1), _) | (_, Some(-1)) => const_of(-1),
            _ => None,
        },
        "xor" => match (av, bv) {
            (Some(0), _) => move_of(b),
            (_, Some(0)) => move_of(a),
            _ => None,
        },
        "shl" | "lshr" | "ashr" => match (av, bv) {
            (_, Some(0)) => move_of(a),
            (Some(0), _) => const_of(0),
            _ => None,
        },
        _ => None,
    }
}

/// Structural ordering for commutative canonicalisation: constants order
/// before variables, then by value/name.
fn arg_cmp(a: &PrimArg, b: &PrimArg) -> Ordering {
    fn rank(arg: &PrimArg) -> u8 {
        match arg {
            PrimArg::Int { .. } => 0,
            PrimArg::Float { .. } => 1,
            PrimArg::Char(_) => 2,
            PrimArg::Str { .. } => 3,
            PrimArg::Var { .. } => 4,
            _ => 5,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (PrimArg::Int { value: x, .. }, PrimArg::Int { value: y, .. }) => x.cmp(y),
        (PrimArg::Float { value: x, .. }, PrimArg::Float { value: y, .. }) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (PrimArg::Var { name: x, .. }, PrimArg::Var { name: y, .. }) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

/// The logically equivalent spellings implied by an emitted instruction,
/// as `(instruction-with-inputs, outputs)` pairs for the CSE table.
///
/// `add a b -> c` also answers for `sub c b -> a`, `sub c a -> b`, and the
/// commuted `add b a -> c`; `xor` is its own inverse; `access` answers for
/// the `mutate` that would write the same value back (and vice versa);
/// `cast` inverts.
pub fn equivalents(prim: &Prim) -> Vec<(Prim, Vec<PrimArg>)> {
    let mut extra = Vec::new();
    match prim {
        Prim::Foreign {
            lang: ForeignLang::Llvm,
            name,
            flags,
            args,
        } if args.len() == 3 => {
            let (a, b, c) = (args[0].clone(), args[1].clone(), args[2].clone());
            let mk = |name: &str, x: &PrimArg, y: &PrimArg, out: &PrimArg| {
                (
                    Prim::Foreign {
                        lang: ForeignLang::Llvm,
                        name: name.to_string(),
                        flags: flags.clone(),
                        args: smallvec::smallvec![
                            as_input(x),
                            as_input(y),
                            as_output(out)
                        ],
                    },
                    vec![as_input(out)],
                )
            };
            match name.as_str() {
                "add" => {
                    extra.push(mk("add", &b, &a, &c));
                    extra.push(mk("sub", &c, &b, &a));
                    extra.push(mk("sub", &c, &a, &b));
                }
                "sub" => {
                    extra.push(mk("add", &c, &b, &a));
                    extra.push(mk("add", &b, &c, &a));
                    extra.push(mk("sub", &a, &c, &b));
                }
                "mul" => extra.push(mk("mul", &b, &a, &c)),
                "and" => extra.push(mk("and", &b, &a, &c)),
                "or" => extra.push(mk("or", &b, &a, &c)),
                "xor" => {
                    extra.push(mk("xor", &b, &a, &c));
                    extra.push(mk("xor", &c, &b, &a));
                    extra.push(mk("xor", &c, &a, &b));
                }
                "icmp_eq" | "icmp_ne" => extra.push(mk(name, &b, &a, &c)),
                "icmp_slt" => extra.push(mk("icmp_sgt", &b, &a, &c)),
                "icmp_sgt" => extra.push(mk("icmp_slt", &b, &a, &c)),
                "icmp_sle" => extra.push(mk("icmp_sge", &b, &a, &c)),
                "icmp_sge" => extra.push(mk("icmp_sle", &b, &a, &c)),
                "icmp_ult" => extra.push(mk("icmp_ugt", &b, &a, &c)),
                "icmp_ugt" => extra.push(mk("icmp_ult", &b, &a, &c)),
                "icmp_ule" => extra.push(mk("icmp_uge", &b, &a, &c)),
                "icmp_uge" => extra.push(mk("icmp_ule", &b, &a, &c)),
                "fadd" | "fmul" | "fcmp_eq" | "fcmp_ne" => {
                    extra.push(mk(name, &b, &a, &c))
                }
                _ => {}
            }
        }
        Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name,
            flags,
            args,
        } => match name.as_str() {
            // access(addr, off, size, start) -> v: writing v back to the
            // same field is the identity on the structure.
            "access" if args.len() == 5 => {
                let addr = &args[0];
                for destructive in [0i64, 1] {
                    extra.push((
                        Prim::Foreign {
                            lang: ForeignLang::Lpvm,
                            name: "mutate".to_string(),
                            flags: flags.clone(),
                            args: smallvec::smallvec![
                                as_input(addr),
                                PrimArg::Unneeded,
                                as_input(&args[1]),
                                PrimArg::int(destructive),
                                as_input(&args[2]),
                                as_input(&args[3]),
                                as_input(&args[4]),
                            ],
                        },
                        vec![as_input(addr)],
                    ));
                }
            }
            // mutate(addr, ?addr2, off, d, size, start, v): reading the
            // written field of addr2 gives v.
            "mutate" if args.len() == 7 => {
                extra.push((
                    Prim::Foreign {
                        lang: ForeignLang::Lpvm,
                        name: "access".to_string(),
                        flags: flags.clone(),
                        args: smallvec::smallvec![
                            as_input(&args[1]),
                            as_input(&args[2]),
                            as_input(&args[4]),
                            as_input(&args[5]),
                            PrimArg::Unneeded,
                        ],
                    },
                    vec![as_input(&args[6])],
                ));
            }
            "cast" if args.len() == 2 => {
                extra.push((
                    Prim::Foreign {
                        lang: ForeignLang::Lpvm,
                        name: "cast".to_string(),
                        flags: flags.clone(),
                        args: smallvec::smallvec![as_input(&args[1]), PrimArg::Unneeded],
                    },
                    vec![as_input(&args[0])],
                ));
            }
            _ => {}
        },
        _ => {}
    }
    extra
}

/// A copy of the argument usable as an input operand of an equivalent
/// form.
fn as_input(arg: &PrimArg) -> PrimArg {
    match arg {
        PrimArg::Var { name, ty, .. } => PrimArg::in_var(name.clone(), ty.clone()),
        other => other.clone(),
    }
}

/// A copy of the argument in the result slot of an equivalent form.
fn as_output(arg: &PrimArg) -> PrimArg {
    match arg {
        PrimArg::Var { name, ty, .. } => PrimArg::out_var(name.clone(), ty.clone()),
        other => other.clone(),
    }
}
