//! Data-flow directions, parameters, and prototypes.
//!
//! Every argument of a call and every parameter of a procedure carries a
//! [`FlowDirection`]. The mode checker rewrites `Unknown` flows into
//! concrete ones; the last-call pass upgrades `Out` to `OutByReference` and
//! introduces `TakeReference` on destructive-write value arguments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::module::ModulePath;
use crate::types::TypeSpec;

/// Data-flow role of an argument or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowDirection {
    /// Value flows into the callee.
    In,
    /// Value flows out of the callee.
    Out,
    /// The callee writes the output directly through a caller-supplied
    /// reference instead of returning it.
    OutByReference,
    /// The caller takes a reference to the destination field so a later
    /// call can write it in place.
    TakeReference,
    /// Not yet determined; resolved by mode checking.
    Unknown,
}

impl FlowDirection {
    /// `true` for flows that consume a bound value.
    pub fn flows_in(self) -> bool {
        matches!(self, FlowDirection::In | FlowDirection::TakeReference)
    }

    /// `true` for flows that bind a variable at the call site.
    pub fn flows_out(self) -> bool {
        matches!(self, FlowDirection::Out | FlowDirection::OutByReference)
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowDirection::In => "",
            FlowDirection::Out => "?",
            FlowDirection::OutByReference => "?&",
            FlowDirection::TakeReference => "!&",
            FlowDirection::Unknown => "~",
        };
        write!(f, "{}", s)
    }
}

/// What kind of value a parameter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgFlowType {
    /// A normal parameter written in the source.
    Ordinary,
    /// A resource expanded into a parameter by the front end.
    Resource,
    /// A closure capture; always the leading parameters of a closure proc.
    Free,
}

/// Visibility of a procedure across module boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

/// A resource identity: defining module plus name.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ResourceSpec {
    pub module: ModulePath,
    pub name: String,
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// One formal parameter of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeSpec,
    pub flow: FlowDirection,
    pub flow_type: ArgFlowType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TypeSpec, flow: FlowDirection) -> Self {
        Param {
            name: name.into(),
            ty,
            flow,
            flow_type: ArgFlowType::Ordinary,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.flow, self.name, self.ty)
    }
}

/// A procedure prototype: name, parameters, and the resources the front end
/// expanded into them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcProto {
    pub name: String,
    pub params: Vec<Param>,
    /// Bookkeeping only; each listed resource also appears among `params`
    /// with `ArgFlowType::Resource`.
    pub resources: Vec<ResourceSpec>,
}

impl ProcProto {
    pub fn new(name: impl Into<String>, params: Vec<Param>) -> Self {
        ProcProto {
            name: name.into(),
            params,
            resources: Vec::new(),
        }
    }

    /// Parameters that flow out of the procedure.
    pub fn outputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.flow.flows_out())
    }

    /// Parameters that flow into the procedure.
    pub fn inputs(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.flow.flows_in())
    }
}

impl fmt::Display for ProcProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_predicates() {
        assert!(FlowDirection::In.flows_in());
        assert!(FlowDirection::TakeReference.flows_in());
        assert!(FlowDirection::Out.flows_out());
        assert!(FlowDirection::OutByReference.flows_out());
        assert!(!FlowDirection::Unknown.flows_in());
        assert!(!FlowDirection::Unknown.flows_out());
    }

    #[test]
    fn param_display_carries_flow_sigil() {
        let p = Param::new("x", TypeSpec::int(), FlowDirection::Out);
        assert_eq!(format!("{}", p), "?x:int");
    }

    #[test]
    fn proto_outputs_and_inputs() {
        let proto = ProcProto::new(
            "swap",
            vec![
                Param::new("a", TypeSpec::int(), FlowDirection::In),
                Param::new("b", TypeSpec::int(), FlowDirection::In),
                Param::new("x", TypeSpec::int(), FlowDirection::Out),
                Param::new("y", TypeSpec::int(), FlowDirection::OutByReference),
            ],
        );
        let outs: Vec<_> = proto.outputs().map(|p| p.name.as_str()).collect();
        assert_eq!(outs, vec!["x", "y"]);
        let ins: Vec<_> = proto.inputs().map(|p| p.name.as_str()).collect();
        assert_eq!(ins, vec!["a", "b"]);
    }

    #[test]
    fn proto_display() {
        let proto = ProcProto::new(
            "inc",
            vec![
                Param::new("n", TypeSpec::int(), FlowDirection::In),
                Param::new("m", TypeSpec::int(), FlowDirection::Out),
            ],
        );
        assert_eq!(format!("{}", proto), "inc(n:int, ?m:int)");
    }

    #[test]
    fn serde_roundtrip_param() {
        let p = Param {
            name: "io".into(),
            ty: TypeSpec::phantom(),
            flow: FlowDirection::In,
            flow_type: ArgFlowType::Resource,
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: Param = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
