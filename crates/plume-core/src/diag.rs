//! User-facing diagnostics.
//!
//! Passes collect diagnostics instead of failing fast: each pass appends to
//! a per-procedure list and keeps going with a best-effort fallback
//! (`Invalid`/`Any` types, `Unknown` flows). A procedure with any diagnostic
//! does not continue to later passes. Internal invariant violations are
//! panics, not diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowDirection;
use crate::position::SourcePos;
use crate::types::{Determinism, TypeFamily, TypeSpec};

/// Every failure kind the middle-end can report.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("type conflict for `{var}`: expected {expected}, found {found}")]
    TypeConflict {
        var: String,
        expected: TypeSpec,
        found: TypeSpec,
    },

    #[error("unknown variable `{name}`")]
    UnknownVariable { name: String },

    #[error("input argument `{name}` used before it is bound")]
    UninitialisedInput { name: String },

    #[error("argument `{name}` has flow {found} where {expected} is required")]
    WrongFlow {
        name: String,
        expected: FlowDirection,
        found: FlowDirection,
    },

    #[error("`{name}` called with {found} arguments, expected {expected}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("ambiguous call to `{name}`: {candidates} candidates remain")]
    AmbiguousCall { name: String, candidates: usize },

    #[error("no candidate for call to `{name}` matches the argument types")]
    NoMatchingCandidate { name: String },

    #[error("no mode of `{name}` accepts the argument flows at this call")]
    UndefinedFlow { name: String },

    #[error("call to unknown procedure `{name}`")]
    UnknownProc { name: String },

    #[error("{callee} call to `{name}` in a {context} context")]
    DeterminismViolation {
        name: String,
        callee: Determinism,
        context: Determinism,
    },

    #[error("conditional test has type {ty}, expected bool")]
    NonBooleanTest { ty: TypeSpec },

    #[error("unknown foreign language `{lang}`")]
    UnknownForeignLanguage { lang: String },

    #[error("unknown {lang} operation `{name}`")]
    UnknownForeignOp { lang: String, name: String },

    #[error("foreign `{name}` takes {expected} arguments, found {found}")]
    ForeignArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "argument {index} of foreign `{name}` is {found}, expected {expected}"
    )]
    ForeignArgFamily {
        name: String,
        index: usize,
        expected: TypeFamily,
        found: TypeFamily,
    },

    #[error(
        "arguments of foreign `{name}` have incompatible representations \
         ({left} vs {right} bits)"
    )]
    ForeignRepMismatch { name: String, left: u32, right: u32 },

    #[error("output resource {resource} is not bound on every path")]
    ResourceOutputNotBound { resource: String },

    #[error("resource {resource} is not available here")]
    ResourceUnavailable { resource: String },

    #[error(
        "public procedure `{proc_name}` has parameter `{param}` with no \
         declared or inferable type"
    )]
    UndeclaredParamType { proc_name: String, param: String },

    #[error("`{stmt}` outside of a loop")]
    LoopControlOutsideLoop { stmt: String },
}

/// A reported problem: a kind plus the source position it points at, when
/// one is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub pos: Option<SourcePos>,
    pub kind: ErrorKind,
}

impl Diagnostic {
    pub fn new(pos: Option<SourcePos>, kind: ErrorKind) -> Self {
        Diagnostic { pos, kind }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "{}: {}", pos, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Sorts diagnostics by source position where available, preserving
/// emission order for position-less entries (they sort last).
pub fn sort_diagnostics(diags: &mut [Diagnostic]) {
    diags.sort_by(|a, b| match (&a.pos, &b.pos) {
        (Some(pa), Some(pb)) => pa.cmp(pb),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_with_position() {
        let d = Diagnostic::new(
            Some(SourcePos::new("m.plume", 3, 7)),
            ErrorKind::UnknownVariable { name: "x".into() },
        );
        assert_eq!(format!("{}", d), "m.plume:3:7: unknown variable `x`");
    }

    #[test]
    fn diagnostic_display_without_position() {
        let d = Diagnostic::new(None, ErrorKind::UnknownProc { name: "f".into() });
        assert_eq!(format!("{}", d), "call to unknown procedure `f`");
    }

    #[test]
    fn type_conflict_message() {
        let kind = ErrorKind::TypeConflict {
            var: "x".into(),
            expected: TypeSpec::int(),
            found: TypeSpec::float(),
        };
        assert_eq!(
            format!("{}", kind),
            "type conflict for `x`: expected int, found float"
        );
    }

    #[test]
    fn sort_is_stable_and_position_first() {
        let mut diags = vec![
            Diagnostic::new(None, ErrorKind::UnknownProc { name: "a".into() }),
            Diagnostic::new(
                Some(SourcePos::new("m", 9, 1)),
                ErrorKind::UnknownProc { name: "b".into() },
            ),
            Diagnostic::new(
                Some(SourcePos::new("m", 2, 1)),
                ErrorKind::UnknownProc { name: "c".into() },
            ),
            Diagnostic::new(None, ErrorKind::UnknownProc { name: "d".into() }),
        ];
        sort_diagnostics(&mut diags);
        let names: Vec<String> = diags
            .iter()
            .map(|d| match &d.kind {
                ErrorKind::UnknownProc { name } => name.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn serde_roundtrip_diagnostic() {
        let d = Diagnostic::new(
            Some(SourcePos::new("m", 1, 1)),
            ErrorKind::ArityMismatch {
                name: "f".into(),
                expected: 2,
                found: 3,
            },
        );
        let json = serde_json::to_string(&d).unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
