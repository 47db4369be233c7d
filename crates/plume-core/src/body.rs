//! Primitive procedure bodies: straight-line code plus a terminal fork.
//!
//! A [`ProcBody`] is an ordered sequence of placed primitives followed by a
//! [`PrimFork`]: either nothing, or a multi-way branch on the integer value
//! of a variable. Forks are terminal and never rejoin; each branch is a
//! complete `ProcBody` of its own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::position::Spanned;
use crate::prim::Prim;
use crate::types::TypeSpec;

/// The terminal branch of a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimFork {
    /// Execution falls off the end of the body.
    NoFork,
    /// Branch on the integer value of `var`: `bodies[i]` runs when
    /// `var == i`.
    Fork {
        var: String,
        ty: TypeSpec,
        /// Set when no instruction after the fork reads `var`.
        last_use: bool,
        bodies: Vec<ProcBody>,
    },
}

/// A primitive procedure body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcBody {
    pub prims: Vec<Spanned<Prim>>,
    pub fork: PrimFork,
}

impl ProcBody {
    pub fn empty() -> Self {
        ProcBody {
            prims: Vec::new(),
            fork: PrimFork::NoFork,
        }
    }

    pub fn from_prims(prims: Vec<Spanned<Prim>>) -> Self {
        ProcBody {
            prims,
            fork: PrimFork::NoFork,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prims.is_empty() && matches!(self.fork, PrimFork::NoFork)
    }

    /// Number of leaf paths through the body.
    pub fn leaf_count(&self) -> usize {
        match &self.fork {
            PrimFork::NoFork => 1,
            PrimFork::Fork { bodies, .. } => {
                bodies.iter().map(ProcBody::leaf_count).sum()
            }
        }
    }

    /// Visits every primitive in the body, fork branches included.
    pub fn for_each_prim(&self, f: &mut impl FnMut(&Spanned<Prim>)) {
        for prim in &self.prims {
            f(prim);
        }
        if let PrimFork::Fork { bodies, .. } = &self.fork {
            for body in bodies {
                body.for_each_prim(f);
            }
        }
    }

    /// Mutable variant of [`ProcBody::for_each_prim`].
    pub fn for_each_prim_mut(&mut self, f: &mut impl FnMut(&mut Spanned<Prim>)) {
        for prim in &mut self.prims {
            f(prim);
        }
        if let PrimFork::Fork { bodies, .. } = &mut self.fork {
            for body in bodies {
                body.for_each_prim_mut(f);
            }
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        for prim in &self.prims {
            writeln!(f, "{}{}", pad, prim.node)?;
        }
        match &self.fork {
            PrimFork::NoFork => Ok(()),
            PrimFork::Fork {
                var,
                ty,
                last_use,
                bodies,
            } => {
                let mark = if *last_use { "^" } else { "" };
                writeln!(f, "{}case {}{}:{} of", pad, var, mark, ty)?;
                for (i, body) in bodies.iter().enumerate() {
                    writeln!(f, "{}{}:", pad, i)?;
                    body.fmt_indented(f, indent + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ProcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prim::PrimArg;

    fn mv(n: i64, dst: &str) -> Spanned<Prim> {
        Spanned::unplaced(Prim::move_prim(
            PrimArg::int(n),
            PrimArg::out_var(dst, TypeSpec::int()),
        ))
    }

    #[test]
    fn empty_body() {
        let body = ProcBody::empty();
        assert!(body.is_empty());
        assert_eq!(body.leaf_count(), 1);
    }

    #[test]
    fn leaf_count_multiplies_through_forks() {
        let leafy = ProcBody {
            prims: vec![],
            fork: PrimFork::Fork {
                var: "v".into(),
                ty: TypeSpec::bool(),
                last_use: false,
                bodies: vec![ProcBody::empty(), ProcBody::empty()],
            },
        };
        assert_eq!(leafy.leaf_count(), 2);

        let nested = ProcBody {
            prims: vec![],
            fork: PrimFork::Fork {
                var: "w".into(),
                ty: TypeSpec::bool(),
                last_use: false,
                bodies: vec![leafy.clone(), ProcBody::empty()],
            },
        };
        assert_eq!(nested.leaf_count(), 3);
    }

    #[test]
    fn for_each_prim_covers_branches() {
        let body = ProcBody {
            prims: vec![mv(1, "a")],
            fork: PrimFork::Fork {
                var: "v".into(),
                ty: TypeSpec::bool(),
                last_use: false,
                bodies: vec![
                    ProcBody::from_prims(vec![mv(2, "b")]),
                    ProcBody::from_prims(vec![mv(3, "c")]),
                ],
            },
        };
        let mut count = 0;
        body.for_each_prim(&mut |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn display_indents_forks() {
        let body = ProcBody {
            prims: vec![mv(1, "a")],
            fork: PrimFork::Fork {
                var: "v".into(),
                ty: TypeSpec::bool(),
                last_use: true,
                bodies: vec![
                    ProcBody::from_prims(vec![mv(2, "b")]),
                    ProcBody::empty(),
                ],
            },
        };
        let text = format!("{}", body);
        assert!(text.contains("foreign llvm move(1:int, ?a:int)"));
        assert!(text.contains("case v^:bool of"));
        assert!(text.contains("  foreign llvm move(2:int, ?b:int)"));
    }

    #[test]
    fn serde_roundtrip_body() {
        let body = ProcBody {
            prims: vec![mv(7, "x")],
            fork: PrimFork::Fork {
                var: "x".into(),
                ty: TypeSpec::int(),
                last_use: false,
                bodies: vec![ProcBody::empty(), ProcBody::from_prims(vec![mv(8, "y")])],
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: ProcBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
    }
}
