//! Modules and the per-module procedure table.
//!
//! A [`Module`] is the unit the middle-end operates on: an ordered table of
//! procedure definitions keyed by name, each name holding its overloads in
//! declaration order. The table also holds procedures imported into scope;
//! scope resolution happens upstream, so candidate enumeration here is a
//! plain lookup.
//!
//! [`Module::local_call_sccs`] computes the strongly-connected components of
//! the local call graph in callee-first order. Both the type/mode pass and
//! the last-call pass process procedures in that order.

use std::fmt;

use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::ast::Stmt;
use crate::position::Spanned;
use crate::prim::Prim;
use crate::procs::{ProcDef, ProcId, ProcImpl, ProcSpec};

/// A dotted module path, e.g. `io.file`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ModulePath(pub Vec<String>);

/// Name of the builtin module holding primitive types and operations.
pub const BUILTIN_MODULE: &str = "plume";

impl ModulePath {
    pub fn new(segments: Vec<String>) -> Self {
        ModulePath(segments)
    }

    /// Path of the builtin module.
    pub fn builtin() -> Self {
        ModulePath(vec![BUILTIN_MODULE.to_string()])
    }

    /// The empty path, used by unqualified calls.
    pub fn local() -> Self {
        ModulePath(Vec::new())
    }

    pub fn from_name(name: &str) -> Self {
        ModulePath(vec![name.to_string()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_builtin(&self) -> bool {
        self.0.len() == 1 && self.0[0] == BUILTIN_MODULE
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A module under compilation: its path and procedure table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub path: ModulePath,
    /// Procedures in scope, keyed by name; each bucket holds the overloads
    /// in declaration order, indexed by [`ProcId`].
    pub procs: IndexMap<String, Vec<ProcDef>>,
}

impl Module {
    pub fn new(path: ModulePath) -> Self {
        Module {
            path,
            procs: IndexMap::new(),
        }
    }

    /// Adds a procedure and returns its spec.
    pub fn add_proc(&mut self, def: ProcDef) -> ProcSpec {
        let name = def.proto.name.clone();
        let bucket = self.procs.entry(name.clone()).or_default();
        let id = ProcId(bucket.len() as u32);
        bucket.push(def);
        ProcSpec::local(self.path.clone(), name, id)
    }

    /// All overloads of `name`, empty if unknown.
    pub fn overloads(&self, name: &str) -> &[ProcDef] {
        self.procs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Specs for all overloads of `name`.
    pub fn specs_for(&self, name: &str) -> Vec<ProcSpec> {
        (0..self.overloads(name).len())
            .map(|i| ProcSpec::local(self.path.clone(), name.to_string(), ProcId(i as u32)))
            .collect()
    }

    /// Specs for every procedure in the table, in declaration order.
    pub fn all_specs(&self) -> Vec<ProcSpec> {
        let mut specs = Vec::new();
        for (name, bucket) in &self.procs {
            for i in 0..bucket.len() {
                specs.push(ProcSpec::local(
                    self.path.clone(),
                    name.clone(),
                    ProcId(i as u32),
                ));
            }
        }
        specs
    }

    pub fn get_proc(&self, spec: &ProcSpec) -> Option<&ProcDef> {
        self.procs.get(&spec.name)?.get(spec.id.0 as usize)
    }

    pub fn get_proc_mut(&mut self, spec: &ProcSpec) -> Option<&mut ProcDef> {
        self.procs.get_mut(&spec.name)?.get_mut(spec.id.0 as usize)
    }

    /// `true` if a call naming `module` refers to this module (unqualified
    /// calls use the empty path).
    pub fn is_local_path(&self, module: &ModulePath) -> bool {
        module.is_empty() || *module == self.path
    }

    /// Strongly-connected components of the local call graph, callee-first.
    ///
    /// Calls whose overload is not yet resolved (no proc ID) contribute an
    /// edge to every overload of the name. Tarjan's algorithm yields SCCs in
    /// postorder, so each component appears after the components it calls
    /// into -- exactly the bottom-up order the passes need.
    pub fn local_call_sccs(&self) -> Vec<Vec<ProcSpec>> {
        let specs = self.all_specs();
        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = specs.iter().map(|_| graph.add_node(())).collect();

        let ordinal = |name: &str, id: usize| -> Option<usize> {
            let mut base = 0usize;
            for (n, bucket) in &self.procs {
                if n == name {
                    return (id < bucket.len()).then_some(base + id);
                }
                base += bucket.len();
            }
            None
        };

        for (caller_ord, spec) in specs.iter().enumerate() {
            let def = self.get_proc(spec).expect("spec enumerated from table");
            let mut add_edge = |name: &str, id: Option<ProcId>| {
                let callee_count = self.overloads(name).len();
                match id {
                    Some(id) => {
                        if let Some(ord) = ordinal(name, id.0 as usize) {
                            graph.update_edge(nodes[caller_ord], nodes[ord], ());
                        }
                    }
                    None => {
                        for i in 0..callee_count {
                            if let Some(ord) = ordinal(name, i) {
                                graph.update_edge(nodes[caller_ord], nodes[ord], ());
                            }
                        }
                    }
                }
            };
            match &def.impln {
                ProcImpl::Source(stmts) => {
                    for stmt in stmts {
                        collect_stmt_calls(self, stmt, &mut add_edge);
                    }
                }
                ProcImpl::Prim(body) => {
                    body.for_each_prim(&mut |prim: &Spanned<Prim>| {
                        if let Prim::Call { spec: callee, .. } = &prim.node {
                            if self.is_local_path(&callee.module) {
                                add_edge(&callee.name, Some(callee.id));
                            }
                        }
                    });
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .map(|component| {
                component
                    .into_iter()
                    .map(|n| specs[n.index()].clone())
                    .collect()
            })
            .collect()
    }
}

/// Walks a statement tree reporting every local call as `(name, id)`.
fn collect_stmt_calls(
    module: &Module,
    stmt: &Spanned<Stmt>,
    report: &mut impl FnMut(&str, Option<ProcId>),
) {
    match &stmt.node {
        Stmt::Call {
            module: path,
            name,
            id,
            ..
        } => {
            if module.is_local_path(path) {
                report(name, *id);
            }
        }
        Stmt::Foreign { .. }
        | Stmt::TestBool(_)
        | Stmt::Nop
        | Stmt::Fail
        | Stmt::Break
        | Stmt::Next => {}
        Stmt::And(stmts) => {
            for s in stmts {
                collect_stmt_calls(module, s, report);
            }
        }
        Stmt::Or { alts, .. } => {
            for s in alts {
                collect_stmt_calls(module, s, report);
            }
        }
        Stmt::Not(inner) => collect_stmt_calls(module, inner, report),
        Stmt::Cond {
            test, then, els, ..
        } => {
            collect_stmt_calls(module, test, report);
            for s in then.iter().chain(els) {
                collect_stmt_calls(module, s, report);
            }
        }
        Stmt::Loop { body, .. } => {
            for s in body {
                collect_stmt_calls(module, s, report);
            }
        }
        Stmt::UseResources { body, .. } => {
            for s in body {
                collect_stmt_calls(module, s, report);
            }
        }
        Stmt::Case { cases, deflt, .. } => {
            for (_, stmts) in cases {
                for s in stmts {
                    collect_stmt_calls(module, s, report);
                }
            }
            if let Some(stmts) = deflt {
                for s in stmts {
                    collect_stmt_calls(module, s, report);
                }
            }
        }
    }
}
