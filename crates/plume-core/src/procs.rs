//! Procedure definitions and identities.
//!
//! A [`ProcDef`] is created by the front end with a source body and is
//! mutated in place by each pass: type/mode checking rewrites its statements,
//! unbranching replaces structured control, and body building swaps the
//! implementation for a primitive [`crate::body::ProcBody`]. A [`ProcSpec`]
//! names a procedure uniquely across the whole compilation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::StmtNode;
use crate::body::ProcBody;
use crate::flow::{ProcProto, Visibility};
use crate::module::ModulePath;
use crate::position::SourcePos;
use crate::types::{Determinism, Impurity, Inlining, TypeSpec};

/// Index of an overload within its name bucket.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProcId(pub u32);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generalisation marker: a spec either names the general version of a
/// procedure or one of its specialisations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Generality {
    General,
    Specialized(u32),
}

/// Unique identity of one procedure: module path, name, overload ID, and
/// generalisation marker.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProcSpec {
    pub module: ModulePath,
    pub name: String,
    pub id: ProcId,
    pub generality: Generality,
}

impl ProcSpec {
    pub fn local(module: ModulePath, name: String, id: ProcId) -> Self {
        ProcSpec {
            module,
            name,
            id,
            generality: Generality::General,
        }
    }
}

impl fmt::Display for ProcSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}<{}>", self.name, self.id)
        } else {
            write!(f, "{}.{}<{}>", self.module, self.name, self.id)
        }
    }
}

/// How a procedure came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcVariant {
    /// Written in the source.
    Normal,
    /// Lifted by unbranching (loop bodies, continuations).
    Generated,
    /// A hoisted closure; leading parameters are the captures.
    Closure,
    /// A hoisted anonymous procedure expression.
    Anonymous,
}

/// A procedure body: source statements before unbranching, a primitive body
/// after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcImpl {
    Source(Vec<StmtNode>),
    Prim(ProcBody),
}

impl ProcImpl {
    pub fn as_source(&self) -> Option<&[StmtNode]> {
        match self {
            ProcImpl::Source(stmts) => Some(stmts),
            ProcImpl::Prim(_) => None,
        }
    }

    pub fn as_prim(&self) -> Option<&ProcBody> {
        match self {
            ProcImpl::Source(_) => None,
            ProcImpl::Prim(body) => Some(body),
        }
    }
}

/// Full definition of one procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcDef {
    pub proto: ProcProto,
    pub variant: ProcVariant,
    pub impln: ProcImpl,
    pub determinism: Determinism,
    pub impurity: Impurity,
    pub inlining: Inlining,
    /// Next fresh temporary number; threaded through every pass.
    pub temp_count: u32,
    pub vis: Visibility,
    pub pos: Option<SourcePos>,
    /// Types inferred for the body's variables; filled in by type checking
    /// and consulted when lowering builds typed primitive arguments.
    pub var_types: BTreeMap<String, TypeSpec>,
}

impl ProcDef {
    /// A private, pure, source-level procedure with defaults everywhere
    /// else.
    pub fn new(proto: ProcProto, impln: ProcImpl, determinism: Determinism) -> Self {
        ProcDef {
            proto,
            variant: ProcVariant::Normal,
            impln,
            determinism,
            impurity: Impurity::Pure,
            inlining: Inlining::MayInline,
            temp_count: 0,
            vis: Visibility::Private,
            pos: None,
            var_types: BTreeMap::new(),
        }
    }

    pub fn public(mut self) -> Self {
        self.vis = Visibility::Public;
        self
    }

    pub fn is_public(&self) -> bool {
        self.vis == Visibility::Public
    }

    pub fn is_pure(&self) -> bool {
        self.impurity == Impurity::Pure
    }

    /// Mints a fresh temporary variable name.
    pub fn next_temp(&mut self) -> String {
        let n = self.temp_count;
        self.temp_count += 1;
        temp_name(n)
    }
}

/// The name of temporary number `n`. Temporaries share a namespace with no
/// source variable because `#` cannot appear in source identifiers.
pub fn temp_name(n: u32) -> String {
    format!("tmp#{}", n)
}
