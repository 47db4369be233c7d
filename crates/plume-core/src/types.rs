//! The plume type system as seen by the middle-end.
//!
//! Types arrive from the front end as [`TypeSpec`] trees. The middle-end
//! never defines new types; it resolves `Any` and type variables during
//! inference and classifies concrete types into representation families for
//! foreign-call validation.
//!
//! Two specs are *compatible* if they match structurally, treating `Any` and
//! type variables as compatible with anything; they are *equal* only if they
//! match exactly (derived `PartialEq`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::FlowDirection;
use crate::module::ModulePath;

/// A type expression. The middle-end's central type representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSpec {
    /// A named type with its defining module and type parameters.
    Named {
        module: ModulePath,
        name: String,
        params: Vec<TypeSpec>,
    },
    /// A type variable, bound during unification.
    TypeVar(String),
    /// Unknown type; unifies with anything.
    Any,
    /// Error marker. Absorbs every unification so one bad type does not
    /// cascade into spurious diagnostics.
    Invalid,
    /// A higher-order (procedure) type: modifier set plus ordered type-flows.
    HigherOrder {
        mods: ProcModifiers,
        flows: Vec<TypeFlow>,
    },
}

/// One parameter position of a higher-order type: a type and its direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeFlow {
    pub ty: TypeSpec,
    pub dir: FlowDirection,
}

impl TypeSpec {
    /// A parameterless type in the builtin module.
    pub fn builtin(name: &str) -> TypeSpec {
        TypeSpec::Named {
            module: ModulePath::builtin(),
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn int() -> TypeSpec {
        TypeSpec::builtin("int")
    }

    pub fn float() -> TypeSpec {
        TypeSpec::builtin("float")
    }

    pub fn bool() -> TypeSpec {
        TypeSpec::builtin("bool")
    }

    pub fn char() -> TypeSpec {
        TypeSpec::builtin("char")
    }

    pub fn string() -> TypeSpec {
        TypeSpec::builtin("string")
    }

    /// The zero-width type used for compile-time-only values.
    pub fn phantom() -> TypeSpec {
        TypeSpec::builtin("phantom")
    }

    pub fn is_any(&self) -> bool {
        matches!(self, TypeSpec::Any)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, TypeSpec::Invalid)
    }

    /// `true` if this spec contains no `Any` and no type variables, i.e. it
    /// is acceptable as the final type of a public parameter.
    pub fn is_resolved(&self) -> bool {
        match self {
            TypeSpec::Any | TypeSpec::TypeVar(_) => false,
            TypeSpec::Invalid => true,
            TypeSpec::Named { params, .. } => params.iter().all(TypeSpec::is_resolved),
            TypeSpec::HigherOrder { flows, .. } => {
                flows.iter().all(|f| f.ty.is_resolved())
            }
        }
    }

    /// Structural compatibility: `Any`, type variables, and `Invalid` match
    /// anything; named types must agree on module, name, and arity with
    /// compatible parameters; higher-order types must agree on arity and
    /// directions with compatible flow types.
    pub fn compatible(&self, other: &TypeSpec) -> bool {
        match (self, other) {
            (TypeSpec::Any, _) | (_, TypeSpec::Any) => true,
            (TypeSpec::Invalid, _) | (_, TypeSpec::Invalid) => true,
            (TypeSpec::TypeVar(_), _) | (_, TypeSpec::TypeVar(_)) => true,
            (
                TypeSpec::Named {
                    module: m1,
                    name: n1,
                    params: p1,
                },
                TypeSpec::Named {
                    module: m2,
                    name: n2,
                    params: p2,
                },
            ) => {
                m1 == m2
                    && n1 == n2
                    && p1.len() == p2.len()
                    && p1.iter().zip(p2).all(|(a, b)| a.compatible(b))
            }
            (
                TypeSpec::HigherOrder {
                    mods: md1,
                    flows: f1,
                },
                TypeSpec::HigherOrder {
                    mods: md2,
                    flows: f2,
                },
            ) => {
                md1 == md2
                    && f1.len() == f2.len()
                    && f1
                        .iter()
                        .zip(f2)
                        .all(|(a, b)| a.dir == b.dir && a.ty.compatible(&b.ty))
            }
            _ => false,
        }
    }

    /// Representation family, for foreign-call validation. Named types the
    /// table does not know are heap values, hence `Address`.
    pub fn family(&self) -> TypeFamily {
        match self {
            TypeSpec::Named { module, name, .. } if module.is_builtin() => {
                match name.as_str() {
                    "int" => TypeFamily::Signed,
                    "float" => TypeFamily::Float,
                    "bool" | "char" | "phantom" => TypeFamily::Bits,
                    "string" => TypeFamily::Address,
                    _ => TypeFamily::Address,
                }
            }
            _ => TypeFamily::Address,
        }
    }

    /// Bit width of the representation.
    pub fn bit_width(&self) -> u32 {
        match self {
            TypeSpec::Named { module, name, .. } if module.is_builtin() => {
                match name.as_str() {
                    "bool" => 1,
                    "char" => 8,
                    "phantom" => 0,
                    _ => 64,
                }
            }
            _ => 64,
        }
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Named {
                module,
                name,
                params,
            } => {
                if module.is_builtin() {
                    write!(f, "{}", name)?;
                } else {
                    write!(f, "{}.{}", module, name)?;
                }
                if !params.is_empty() {
                    write!(f, "(")?;
                    for (i, p) in params.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", p)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            TypeSpec::TypeVar(name) => write!(f, "?{}", name),
            TypeSpec::Any => write!(f, "_"),
            TypeSpec::Invalid => write!(f, "<invalid>"),
            TypeSpec::HigherOrder { mods, flows } => {
                write!(f, "{}(", mods)?;
                for (i, flow) in flows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}{}", flow.dir, flow.ty)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Representation family of a concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeFamily {
    /// Unsigned machine words and sub-words (bool, char).
    Bits,
    /// Signed integers.
    Signed,
    /// Floating point.
    Float,
    /// Pointer-sized heap or code addresses.
    Address,
}

impl fmt::Display for TypeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeFamily::Bits => "bits",
            TypeFamily::Signed => "signed",
            TypeFamily::Float => "float",
            TypeFamily::Address => "address",
        };
        write!(f, "{}", s)
    }
}

/// Static classification of whether a procedure or expression may fail.
///
/// An ordered lattice: `Terminal` (never returns) < `Failure` (always
/// fails) < `Det` (always succeeds) < `SemiDet` (may fail). The derived
/// `Ord` gives `join` (max) and `meet` (min) directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Determinism {
    Terminal,
    Failure,
    Det,
    SemiDet,
}

impl Determinism {
    /// Least upper bound.
    pub fn join(self, other: Determinism) -> Determinism {
        self.max(other)
    }

    /// Greatest lower bound.
    pub fn meet(self, other: Determinism) -> Determinism {
        self.min(other)
    }

    /// Determinism of running `self` then `other` in sequence.
    pub fn seq(self, other: Determinism) -> Determinism {
        match self {
            Determinism::Terminal => Determinism::Terminal,
            Determinism::Failure => Determinism::Failure,
            Determinism::Det => other,
            Determinism::SemiDet => match other {
                Determinism::Terminal => Determinism::Terminal,
                Determinism::Failure => Determinism::Failure,
                Determinism::Det | Determinism::SemiDet => Determinism::SemiDet,
            },
        }
    }

    /// `true` if code with this determinism may be called where `context`
    /// determinism is required.
    pub fn usable_in(self, context: Determinism) -> bool {
        self <= context
    }
}

impl fmt::Display for Determinism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Determinism::Terminal => "terminal",
            Determinism::Failure => "failing",
            Determinism::Det => "det",
            Determinism::SemiDet => "semidet",
        };
        write!(f, "{}", s)
    }
}

/// Purity of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Impurity {
    Pure,
    Impure,
}

/// Inlining hint carried from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Inlining {
    MayInline,
    Inline,
    NoInline,
}

/// Modifier set on a procedure or higher-order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcModifiers {
    pub determinism: Determinism,
    pub impurity: Impurity,
    pub inlining: Inlining,
}

impl Default for ProcModifiers {
    fn default() -> Self {
        ProcModifiers {
            determinism: Determinism::Det,
            impurity: Impurity::Pure,
            inlining: Inlining::MayInline,
        }
    }
}

impl fmt::Display for ProcModifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.determinism)
    }
}
