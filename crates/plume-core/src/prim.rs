//! Primitive instructions: the post-unbranching representation.
//!
//! After unbranching and body building, a procedure body contains only
//! [`Prim`] instructions -- direct calls, higher-order calls, and foreign
//! instructions -- sequenced in a [`crate::body::ProcBody`] whose only
//! branching is a terminal fork.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::flow::{ArgFlowType, FlowDirection, ResourceSpec};
use crate::procs::ProcSpec;
use crate::types::TypeSpec;

/// Argument vector of a primitive. Most primitives have a handful of
/// arguments, so they live inline.
pub type PrimArgs = SmallVec<[PrimArg; 4]>;

/// Language tag of a foreign instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForeignLang {
    /// Ordinary C calls; not validated.
    C,
    /// LLVM instructions.
    Llvm,
    /// Low-level memory primitives (alloc/access/mutate/cast, load/store).
    Lpvm,
}

impl FromStr for ForeignLang {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(ForeignLang::C),
            "llvm" => Ok(ForeignLang::Llvm),
            "lpvm" => Ok(ForeignLang::Lpvm),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ForeignLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForeignLang::C => "c",
            ForeignLang::Llvm => "llvm",
            ForeignLang::Lpvm => "lpvm",
        };
        write!(f, "{}", s)
    }
}

/// In-memory representation of a string constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StringVariant {
    /// A counted string object.
    Managed,
    /// A NUL-terminated C string.
    CString,
}

/// A global storage location.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum GlobalInfo {
    Resource(ResourceSpec),
}

impl fmt::Display for GlobalInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalInfo::Resource(res) => write!(f, "<<{}>>", res),
        }
    }
}

/// The sets of globals an instruction may read and write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalFlows {
    pub ins: BTreeSet<GlobalInfo>,
    pub outs: BTreeSet<GlobalInfo>,
    /// `true` when the instruction may touch any global (higher-order and
    /// unknown callees).
    pub universal: bool,
}

impl GlobalFlows {
    /// No global flows at all.
    pub fn none() -> Self {
        GlobalFlows::default()
    }

    /// May read or write any global.
    pub fn universal() -> Self {
        GlobalFlows {
            ins: BTreeSet::new(),
            outs: BTreeSet::new(),
            universal: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.universal && self.ins.is_empty() && self.outs.is_empty()
    }

    /// `true` if the instruction may write `global`.
    pub fn writes(&self, global: &GlobalInfo) -> bool {
        self.universal || self.outs.contains(global)
    }

    pub fn union(&self, other: &GlobalFlows) -> GlobalFlows {
        GlobalFlows {
            ins: self.ins.union(&other.ins).cloned().collect(),
            outs: self.outs.union(&other.outs).cloned().collect(),
            universal: self.universal || other.universal,
        }
    }
}

/// An argument of a primitive instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimArg {
    Var {
        name: String,
        ty: TypeSpec,
        flow: FlowDirection,
        flow_type: ArgFlowType,
        /// Set by the backward pass when no later instruction on this path
        /// reads the variable.
        last_use: bool,
    },
    Int {
        value: i64,
        ty: TypeSpec,
    },
    Float {
        value: f64,
        ty: TypeSpec,
    },
    Str {
        value: String,
        variant: StringVariant,
    },
    Char(char),
    /// A procedure reference with closed-over arguments.
    ProcRef {
        spec: ProcSpec,
        closed: Vec<PrimArg>,
        ty: TypeSpec,
    },
    Global {
        info: GlobalInfo,
        ty: TypeSpec,
    },
    /// An output nothing consumes; the backward pass produces these.
    Unneeded,
    /// An undefined value of a known type.
    Undef(TypeSpec),
}

impl PrimArg {
    pub fn in_var(name: impl Into<String>, ty: TypeSpec) -> PrimArg {
        PrimArg::Var {
            name: name.into(),
            ty,
            flow: FlowDirection::In,
            flow_type: ArgFlowType::Ordinary,
            last_use: false,
        }
    }

    pub fn out_var(name: impl Into<String>, ty: TypeSpec) -> PrimArg {
        PrimArg::Var {
            name: name.into(),
            ty,
            flow: FlowDirection::Out,
            flow_type: ArgFlowType::Ordinary,
            last_use: false,
        }
    }

    pub fn int(value: i64) -> PrimArg {
        PrimArg::Int {
            value,
            ty: TypeSpec::int(),
        }
    }

    /// Booleans are 1-bit integers at this level.
    pub fn bool_const(value: bool) -> PrimArg {
        PrimArg::Int {
            value: value as i64,
            ty: TypeSpec::bool(),
        }
    }

    /// The variable name, if this argument is a variable.
    pub fn var_name(&self) -> Option<&str> {
        match self {
            PrimArg::Var { name, .. } => Some(name),
            _ => None,
        }
    }

    /// `true` if the argument reads a variable (or is any non-variable
    /// value, which is trivially available).
    pub fn is_input(&self) -> bool {
        match self {
            PrimArg::Var { flow, .. } => flow.flows_in(),
            _ => true,
        }
    }

    /// `true` if the argument binds a variable.
    pub fn is_output(&self) -> bool {
        match self {
            PrimArg::Var { flow, .. } => flow.flows_out(),
            _ => false,
        }
    }

    /// The argument's type, where it has one.
    pub fn ty(&self) -> Option<&TypeSpec> {
        match self {
            PrimArg::Var { ty, .. }
            | PrimArg::Int { ty, .. }
            | PrimArg::Float { ty, .. }
            | PrimArg::ProcRef { ty, .. }
            | PrimArg::Global { ty, .. }
            | PrimArg::Undef(ty) => Some(ty),
            PrimArg::Str { .. } | PrimArg::Char(_) | PrimArg::Unneeded => None,
        }
    }

    /// The constant integer value, if this is an integer literal.
    pub fn int_value(&self) -> Option<i64> {
        match self {
            PrimArg::Int { value, .. } => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for PrimArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimArg::Var {
                name,
                ty,
                flow,
                last_use,
                ..
            } => {
                let mark = if *last_use { "^" } else { "" };
                write!(f, "{}{}{}:{}", flow, name, mark, ty)
            }
            PrimArg::Int { value, ty } => write!(f, "{}:{}", value, ty),
            PrimArg::Float { value, ty } => write!(f, "{}:{}", value, ty),
            PrimArg::Str { value, variant } => match variant {
                StringVariant::Managed => write!(f, "{:?}", value),
                StringVariant::CString => write!(f, "c{:?}", value),
            },
            PrimArg::Char(c) => write!(f, "{:?}", c),
            PrimArg::ProcRef { spec, closed, .. } => {
                write!(f, "@{}", spec)?;
                if !closed.is_empty() {
                    write!(f, "<")?;
                    for (i, a) in closed.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", a)?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            PrimArg::Global { info, .. } => write!(f, "{}", info),
            PrimArg::Unneeded => write!(f, "_"),
            PrimArg::Undef(ty) => write!(f, "undef:{}", ty),
        }
    }
}

/// A primitive instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prim {
    /// Direct call to a known procedure.
    Call {
        spec: ProcSpec,
        args: PrimArgs,
        globals: GlobalFlows,
    },
    /// Call through a procedure value.
    Higher { func: PrimArg, args: PrimArgs },
    /// Foreign/low-level instruction.
    Foreign {
        lang: ForeignLang,
        name: String,
        flags: Vec<String>,
        args: PrimArgs,
    },
}

impl Prim {
    /// An `llvm move` from `src` to `dst`.
    pub fn move_prim(src: PrimArg, dst: PrimArg) -> Prim {
        Prim::Foreign {
            lang: ForeignLang::Llvm,
            name: "move".to_string(),
            flags: Vec::new(),
            args: SmallVec::from_vec(vec![src, dst]),
        }
    }

    pub fn args(&self) -> &[PrimArg] {
        match self {
            Prim::Call { args, .. }
            | Prim::Higher { args, .. }
            | Prim::Foreign { args, .. } => args,
        }
    }

    pub fn args_mut(&mut self) -> &mut PrimArgs {
        match self {
            Prim::Call { args, .. }
            | Prim::Higher { args, .. }
            | Prim::Foreign { args, .. } => args,
        }
    }

    /// Names of the variables this instruction binds.
    pub fn output_names(&self) -> Vec<String> {
        self.args()
            .iter()
            .filter(|a| a.is_output())
            .filter_map(|a| a.var_name().map(str::to_string))
            .collect()
    }

    /// Names of the variables this instruction reads, including variables
    /// inside closure arguments.
    pub fn input_names(&self) -> Vec<String> {
        fn add_arg(arg: &PrimArg, acc: &mut Vec<String>) {
            match arg {
                PrimArg::Var { name, flow, .. } if flow.flows_in() => {
                    acc.push(name.clone());
                }
                PrimArg::ProcRef { closed, .. } => {
                    for a in closed {
                        add_arg(a, acc);
                    }
                }
                _ => {}
            }
        }
        let mut acc = Vec::new();
        if let Prim::Higher { func, .. } = self {
            add_arg(func, &mut acc);
        }
        for a in self.args() {
            add_arg(a, &mut acc);
        }
        acc
    }

    /// Is this the `llvm move` instruction? Returns `(src, dst)` if so.
    pub fn as_move(&self) -> Option<(&PrimArg, &PrimArg)> {
        match self {
            Prim::Foreign {
                lang: ForeignLang::Llvm,
                name,
                args,
                ..
            } if name == "move" && args.len() == 2 => Some((&args[0], &args[1])),
            _ => None,
        }
    }

    /// The global flows of this instruction. Direct calls carry theirs;
    /// `lpvm load`/`store` touch the global they name; higher-order calls
    /// may touch anything.
    pub fn global_flows(&self) -> GlobalFlows {
        match self {
            Prim::Call { globals, .. } => globals.clone(),
            Prim::Higher { .. } => GlobalFlows::universal(),
            Prim::Foreign {
                lang: ForeignLang::Lpvm,
                name,
                args,
                ..
            } => {
                let mut flows = GlobalFlows::none();
                for arg in args {
                    if let PrimArg::Global { info, .. } = arg {
                        match name.as_str() {
                            "load" => {
                                flows.ins.insert(info.clone());
                            }
                            "store" => {
                                flows.outs.insert(info.clone());
                            }
                            _ => {}
                        }
                    }
                }
                flows
            }
            Prim::Foreign { .. } => GlobalFlows::none(),
        }
    }

    /// `true` if this instruction has no effect beyond binding its outputs.
    /// Foreign instructions are pure unless flagged `impure`; purity of
    /// direct calls must be asked of the callee, which this crate cannot
    /// see, so callers supply that answer separately.
    pub fn foreign_is_pure(&self) -> bool {
        match self {
            Prim::Foreign { flags, .. } => !flags.iter().any(|f| f == "impure"),
            _ => true,
        }
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_args = |f: &mut fmt::Formatter<'_>, args: &[PrimArg]| -> fmt::Result {
            write!(f, "(")?;
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", a)?;
            }
            write!(f, ")")
        };
        match self {
            Prim::Call { spec, args, .. } => {
                write!(f, "{}", spec)?;
                write_args(f, args)
            }
            Prim::Higher { func, args } => {
                write!(f, "{}", func)?;
                write_args(f, args)
            }
            Prim::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                write!(f, "foreign {} {}", lang, name)?;
                for flag in flags {
                    write!(f, " {}", flag)?;
                }
                write_args(f, args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModulePath;
    use crate::procs::ProcId;

    fn res(name: &str) -> GlobalInfo {
        GlobalInfo::Resource(ResourceSpec {
            module: ModulePath::builtin(),
            name: name.into(),
        })
    }

    #[test]
    fn foreign_lang_from_str() {
        assert_eq!("llvm".parse::<ForeignLang>(), Ok(ForeignLang::Llvm));
        assert_eq!("lpvm".parse::<ForeignLang>(), Ok(ForeignLang::Lpvm));
        assert_eq!("c".parse::<ForeignLang>(), Ok(ForeignLang::C));
        assert!("rust".parse::<ForeignLang>().is_err());
    }

    #[test]
    fn move_prim_recognised() {
        let mv = Prim::move_prim(
            PrimArg::int(1),
            PrimArg::out_var("x", TypeSpec::int()),
        );
        let (src, dst) = mv.as_move().unwrap();
        assert_eq!(src.int_value(), Some(1));
        assert_eq!(dst.var_name(), Some("x"));
    }

    #[test]
    fn input_and_output_names() {
        let add = Prim::Foreign {
            lang: ForeignLang::Llvm,
            name: "add".into(),
            flags: vec![],
            args: PrimArgs::from_vec(vec![
                PrimArg::in_var("a", TypeSpec::int()),
                PrimArg::in_var("b", TypeSpec::int()),
                PrimArg::out_var("c", TypeSpec::int()),
            ]),
        };
        assert_eq!(add.input_names(), vec!["a", "b"]);
        assert_eq!(add.output_names(), vec!["c"]);
    }

    #[test]
    fn load_and_store_global_flows() {
        let load = Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name: "load".into(),
            flags: vec![],
            args: PrimArgs::from_vec(vec![
                PrimArg::Global {
                    info: res("io"),
                    ty: TypeSpec::phantom(),
                },
                PrimArg::out_var("v", TypeSpec::phantom()),
            ]),
        };
        assert!(load.global_flows().ins.contains(&res("io")));
        assert!(load.global_flows().outs.is_empty());

        let store = Prim::Foreign {
            lang: ForeignLang::Lpvm,
            name: "store".into(),
            flags: vec![],
            args: PrimArgs::from_vec(vec![
                PrimArg::in_var("v", TypeSpec::phantom()),
                PrimArg::Global {
                    info: res("io"),
                    ty: TypeSpec::phantom(),
                },
            ]),
        };
        assert!(store.global_flows().writes(&res("io")));
    }

    #[test]
    fn higher_calls_touch_any_global() {
        let h = Prim::Higher {
            func: PrimArg::in_var("f", TypeSpec::Any),
            args: PrimArgs::new(),
        };
        assert!(h.global_flows().universal);
        assert!(h.global_flows().writes(&res("io")));
    }

    #[test]
    fn impure_flag_defeats_purity() {
        let mut p = Prim::Foreign {
            lang: ForeignLang::C,
            name: "print".into(),
            flags: vec!["impure".into()],
            args: PrimArgs::new(),
        };
        assert!(!p.foreign_is_pure());
        if let Prim::Foreign { flags, .. } = &mut p {
            flags.clear();
        }
        assert!(p.foreign_is_pure());
    }

    #[test]
    fn prim_display() {
        let call = Prim::Call {
            spec: ProcSpec::local(ModulePath::from_name("m"), "f".into(), ProcId(0)),
            args: PrimArgs::from_vec(vec![
                PrimArg::in_var("x", TypeSpec::int()),
                PrimArg::out_var("y", TypeSpec::int()),
            ]),
            globals: GlobalFlows::none(),
        };
        assert_eq!(format!("{}", call), "m.f<0>(x:int, ?y:int)");

        let mv = Prim::move_prim(
            PrimArg::int(0),
            PrimArg::out_var("z", TypeSpec::int()),
        );
        assert_eq!(format!("{}", mv), "foreign llvm move(0:int, ?z:int)");
    }

    #[test]
    fn serde_roundtrip_prim() {
        let p = Prim::Foreign {
            lang: ForeignLang::Llvm,
            name: "icmp_eq".into(),
            flags: vec![],
            args: PrimArgs::from_vec(vec![
                PrimArg::in_var("a", TypeSpec::int()),
                PrimArg::int(0),
                PrimArg::out_var("b", TypeSpec::bool()),
            ]),
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: Prim = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
