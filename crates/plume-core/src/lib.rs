//! Core data model of the plume middle-end.
//!
//! This crate defines the IR every pass operates on: the type system
//! ([`types`]), data-flow annotations ([`flow`]), source-level statements
//! ([`ast`]), primitive instructions and bodies ([`prim`], [`body`]),
//! procedure and module tables ([`procs`], [`module`]), source positions
//! ([`position`]), and the diagnostic taxonomy ([`diag`]).
//!
//! The whole model derives `serde` so modules round-trip through JSON; that
//! serialized form is the interchange format between the driver and the
//! passes.

pub mod ast;
pub mod body;
pub mod diag;
pub mod flow;
pub mod module;
pub mod position;
pub mod prim;
pub mod procs;
pub mod types;

// Re-export commonly used types
pub use ast::{Exp, ExpNode, Stmt, StmtNode, VarSet};
pub use body::{PrimFork, ProcBody};
pub use diag::{sort_diagnostics, Diagnostic, ErrorKind};
pub use flow::{ArgFlowType, FlowDirection, Param, ProcProto, ResourceSpec, Visibility};
pub use module::{Module, ModulePath, BUILTIN_MODULE};
pub use position::{SourcePos, Spanned};
pub use prim::{
    ForeignLang, GlobalFlows, GlobalInfo, Prim, PrimArg, PrimArgs, StringVariant,
};
pub use procs::{
    temp_name, Generality, ProcDef, ProcId, ProcImpl, ProcSpec, ProcVariant,
};
pub use types::{
    Determinism, Impurity, Inlining, ProcModifiers, TypeFamily, TypeFlow, TypeSpec,
};
