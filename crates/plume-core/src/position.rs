//! Source positions and position-carrying wrappers.
//!
//! Everything the middle-end reports or logs is anchored to a [`SourcePos`]
//! when one is known. AST statements and placed primitives are stored as
//! [`Spanned`] nodes so the position travels with the node through every
//! pass.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in a source file: file path, 1-based line and column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl SourcePos {
    pub fn new(file: impl Into<String>, line: u32, col: u32) -> Self {
        SourcePos {
            file: file.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// A node paired with the source position it came from, when one is known.
///
/// Generated nodes (lifted procedures, compiler-introduced moves) carry
/// `None`; diagnostics fall back to emission order for those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub pos: Option<SourcePos>,
}

impl<T> Spanned<T> {
    pub fn new(node: T, pos: Option<SourcePos>) -> Self {
        Spanned { node, pos }
    }

    /// Wraps a node with no position, for compiler-generated code.
    pub fn unplaced(node: T) -> Self {
        Spanned { node, pos: None }
    }

    /// Applies `f` to the node, keeping the position.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            node: f(self.node),
            pos: self.pos,
        }
    }

    /// Borrows the node with the same position.
    pub fn as_ref(&self) -> Spanned<&T> {
        Spanned {
            node: &self.node,
            pos: self.pos.clone(),
        }
    }
}
