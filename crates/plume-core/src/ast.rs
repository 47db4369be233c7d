//! Source-level statements and expressions.
//!
//! This is the form the front end hands to the middle-end: structured
//! control (conditionals, loops, disjunctions, negations) over calls and
//! foreign instructions. Unbranching flattens it into [`crate::body`]
//! primitives.
//!
//! `Case` is lowered by upstream flattening and must not reach the passes;
//! they treat it as an internal error rather than a user diagnostic.

use serde::{Deserialize, Serialize};

use crate::flow::{ArgFlowType, FlowDirection, Param, ResourceSpec};
use crate::module::ModulePath;
use crate::position::Spanned;
use crate::procs::{ProcId, ProcSpec};
use crate::types::{ProcModifiers, TypeSpec};

pub type StmtNode = Spanned<Stmt>;
pub type ExpNode = Spanned<Exp>;

/// A variable-name set cached on control statements by the mode checker.
pub type VarSet = std::collections::BTreeSet<String>;

/// A statement in a procedure body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// A procedure call. `id` is `None` until overload resolution commits.
    Call {
        module: ModulePath,
        name: String,
        id: Option<ProcId>,
        resourceful: bool,
        args: Vec<ExpNode>,
    },
    /// A foreign/low-level instruction. The language tag is validated by the
    /// type checker.
    Foreign {
        lang: String,
        name: String,
        flags: Vec<String>,
        args: Vec<ExpNode>,
    },
    /// Succeed iff the boolean expression is true.
    TestBool(ExpNode),
    /// Conjunction: all must succeed in order.
    And(Vec<StmtNode>),
    /// Disjunction: try alternatives in order, commit to the first success.
    Or {
        alts: Vec<StmtNode>,
        /// Variables bound by every alternative; cached by the mode checker.
        exit_vars: Option<VarSet>,
    },
    /// Negation: swaps success and failure.
    Not(Box<StmtNode>),
    /// Conditional.
    Cond {
        test: Box<StmtNode>,
        then: Vec<StmtNode>,
        els: Vec<StmtNode>,
        /// Variables the test binds; cached by the mode checker.
        cond_vars: Option<VarSet>,
        /// Variables bound on every exit; cached by the mode checker.
        exit_vars: Option<VarSet>,
    },
    /// Loop until `Break`.
    Loop {
        body: Vec<StmtNode>,
        /// Variables bound at every `Break`; cached by the mode checker.
        exit_vars: Option<VarSet>,
    },
    /// Scoped resource usage.
    UseResources {
        resources: Vec<ResourceSpec>,
        body: Vec<StmtNode>,
    },
    /// Multi-way branch; eliminated by upstream flattening.
    Case {
        exp: ExpNode,
        cases: Vec<(ExpNode, Vec<StmtNode>)>,
        deflt: Option<Vec<StmtNode>>,
    },
    /// Does nothing.
    Nop,
    /// Always fails.
    Fail,
    /// Exit the nearest enclosing loop.
    Break,
    /// Restart the nearest enclosing loop.
    Next,
}

impl Stmt {
    /// `true` for the flat statements permitted after unbranching,
    /// excluding the terminal `Cond`.
    pub fn is_flat(&self) -> bool {
        matches!(
            self,
            Stmt::Call { .. } | Stmt::Foreign { .. } | Stmt::Nop
        )
    }
}

/// An expression in argument position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exp {
    /// A variable reference with its data-flow annotation.
    Var {
        name: String,
        flow: FlowDirection,
        flow_type: ArgFlowType,
    },
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    CharLit(char),
    /// An anonymous procedure expression; hoisted to a top-level closure
    /// proc by unbranching.
    AnonProc {
        mods: ProcModifiers,
        params: Vec<Param>,
        body: Vec<StmtNode>,
    },
    /// A reference to a procedure, possibly with closed-over arguments.
    ProcRef {
        spec: ProcSpec,
        closed: Vec<ExpNode>,
    },
    /// An expression with an explicit type constraint or cast.
    Typed {
        exp: Box<ExpNode>,
        ty: TypeSpec,
        cast: bool,
    },
}

impl Exp {
    /// Convenience constructor for an input variable.
    pub fn in_var(name: impl Into<String>) -> Exp {
        Exp::Var {
            name: name.into(),
            flow: FlowDirection::In,
            flow_type: ArgFlowType::Ordinary,
        }
    }

    /// Convenience constructor for an output variable.
    pub fn out_var(name: impl Into<String>) -> Exp {
        Exp::Var {
            name: name.into(),
            flow: FlowDirection::Out,
            flow_type: ArgFlowType::Ordinary,
        }
    }

    /// Convenience constructor for a variable of undetermined direction.
    pub fn unknown_var(name: impl Into<String>) -> Exp {
        Exp::Var {
            name: name.into(),
            flow: FlowDirection::Unknown,
            flow_type: ArgFlowType::Ordinary,
        }
    }

    /// The variable name if this is a (possibly typed) variable reference.
    pub fn var_name(&self) -> Option<&str> {
        match self {
            Exp::Var { name, .. } => Some(name),
            Exp::Typed { exp, .. } => exp.node.var_name(),
            _ => None,
        }
    }

    /// The flow direction if this is a (possibly typed) variable reference.
    pub fn var_flow(&self) -> Option<FlowDirection> {
        match self {
            Exp::Var { flow, .. } => Some(*flow),
            Exp::Typed { exp, .. } => exp.node.var_flow(),
            _ => None,
        }
    }
}
