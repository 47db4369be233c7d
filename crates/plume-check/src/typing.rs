//! The typing state: variable types, type-variable bindings, and unresolved
//! overload alternatives.
//!
//! Lookups follow transitive type-variable bindings to a fixed point and
//! compress the path so later lookups are O(1). Unification is structural:
//! `Invalid` absorbs everything (one bad type must not cascade), `Any`
//! yields to the other side, type variables bind, and named types must agree
//! on module, name, and arity with element-wise unifiable parameters.

use indexmap::IndexMap;

use plume_core::{Diagnostic, ErrorKind, SourcePos, TypeSpec};

/// An unresolved overloaded call: the variables whose types remain
/// ambiguous and the tuples of types still consistent with some candidate.
#[derive(Debug, Clone)]
pub struct Alternative {
    /// Call name, for diagnostics.
    pub name: String,
    pub pos: Option<SourcePos>,
    /// The variable-bearing argument names, in argument order.
    pub vars: Vec<String>,
    /// One tuple per surviving candidate: the types it would assign to
    /// `vars`.
    pub tuples: Vec<Vec<TypeSpec>>,
}

/// Accumulated typing knowledge for one procedure. The maps are
/// insertion-ordered so diagnostics and recorded variable types come out
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct Typing {
    var_types: IndexMap<String, TypeSpec>,
    tyvar_bindings: IndexMap<String, TypeSpec>,
    pub alternatives: Vec<Alternative>,
}

impl Typing {
    pub fn new() -> Self {
        Typing::default()
    }

    /// The current type of `var`, fully resolved. Unseen variables are
    /// `Any`.
    pub fn var_type(&mut self, var: &str) -> TypeSpec {
        match self.var_types.get(var) {
            Some(ty) => {
                let resolved = self.resolve(&ty.clone());
                self.var_types.insert(var.to_string(), resolved.clone());
                resolved
            }
            None => TypeSpec::Any,
        }
    }

    pub fn set_var_type(&mut self, var: &str, ty: TypeSpec) {
        self.var_types.insert(var.to_string(), ty);
    }

    /// All variables with a recorded type, resolved.
    pub fn known_vars(&mut self) -> Vec<(String, TypeSpec)> {
        let names: Vec<String> = self.var_types.keys().cloned().collect();
        names
            .into_iter()
            .map(|n| {
                let ty = self.var_type(&n);
                (n, ty)
            })
            .collect()
    }

    /// Follows type-variable bindings through `ty`, compressing chains as
    /// it goes.
    pub fn resolve(&mut self, ty: &TypeSpec) -> TypeSpec {
        match ty {
            TypeSpec::TypeVar(name) => {
                match self.tyvar_bindings.get(name) {
                    Some(bound) => {
                        let resolved = self.resolve(&bound.clone());
                        // Path compression: bind straight to the final type.
                        self.tyvar_bindings
                            .insert(name.clone(), resolved.clone());
                        resolved
                    }
                    None => ty.clone(),
                }
            }
            TypeSpec::Named {
                module,
                name,
                params,
            } => TypeSpec::Named {
                module: module.clone(),
                name: name.clone(),
                params: params.iter().map(|p| self.resolve(p)).collect(),
            },
            TypeSpec::HigherOrder { mods, flows } => TypeSpec::HigherOrder {
                mods: *mods,
                flows: flows
                    .iter()
                    .map(|f| plume_core::TypeFlow {
                        ty: self.resolve(&f.ty),
                        dir: f.dir,
                    })
                    .collect(),
            },
            TypeSpec::Any | TypeSpec::Invalid => ty.clone(),
        }
    }

    /// Unifies two types, returning the combined type, or `Err` with the
    /// two resolved types when they clash.
    pub fn unify(
        &mut self,
        t1: &TypeSpec,
        t2: &TypeSpec,
    ) -> Result<TypeSpec, (TypeSpec, TypeSpec)> {
        let a = self.resolve(t1);
        let b = self.resolve(t2);
        match (&a, &b) {
            _ if a == b => Ok(a),
            (TypeSpec::Invalid, _) | (_, TypeSpec::Invalid) => Ok(TypeSpec::Invalid),
            (TypeSpec::Any, _) => Ok(b),
            (_, TypeSpec::Any) => Ok(a),
            (TypeSpec::TypeVar(v), _) => {
                self.tyvar_bindings.insert(v.clone(), b.clone());
                Ok(b)
            }
            (_, TypeSpec::TypeVar(v)) => {
                self.tyvar_bindings.insert(v.clone(), a.clone());
                Ok(a)
            }
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
            ) if m1 == m2 && n1 == n2 && p1.len() == p2.len() => {
                let mut params = Vec::with_capacity(p1.len());
                for (x, y) in p1.iter().zip(p2) {
                    params.push(self.unify(x, y).map_err(|_| (a.clone(), b.clone()))?);
                }
                Ok(TypeSpec::Named {
                    module: m1.clone(),
                    name: n1.clone(),
                    params,
                })
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
            ) if md1 == md2 && f1.len() == f2.len() => {
                let mut flows = Vec::with_capacity(f1.len());
                for (x, y) in f1.iter().zip(f2) {
                    if x.dir != y.dir {
                        return Err((a.clone(), b.clone()));
                    }
                    flows.push(plume_core::TypeFlow {
                        ty: self
                            .unify(&x.ty, &y.ty)
                            .map_err(|_| (a.clone(), b.clone()))?,
                        dir: x.dir,
                    });
                }
                Ok(TypeSpec::HigherOrder {
                    mods: *md1,
                    flows,
                })
            }
            _ => Err((a, b)),
        }
    }

    /// Unifies `var`'s type with `ty`, recording the result. On a clash the
    /// variable's type becomes `Invalid` and a diagnostic is returned.
    pub fn unify_var(
        &mut self,
        var: &str,
        ty: &TypeSpec,
        pos: &Option<SourcePos>,
    ) -> Option<Diagnostic> {
        let current = self.var_type(var);
        match self.unify(&current, ty) {
            Ok(combined) => {
                self.set_var_type(var, combined);
                None
            }
            Err((expected, found)) => {
                self.set_var_type(var, TypeSpec::Invalid);
                Some(Diagnostic::new(
                    pos.clone(),
                    ErrorKind::TypeConflict {
                        var: var.to_string(),
                        expected,
                        found,
                    },
                ))
            }
        }
    }

    /// Filters alternatives against the current variable types; commits
    /// singletons and reports empties. Runs to a fixed point because each
    /// commitment can narrow other alternatives.
    pub fn narrow_alternatives(&mut self) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        loop {
            let mut changed = false;
            let mut remaining = Vec::new();
            let alts = std::mem::take(&mut self.alternatives);
            for mut alt in alts {
                let var_types: Vec<TypeSpec> =
                    alt.vars.iter().map(|v| self.var_type(v)).collect();
                alt.tuples.retain(|tuple| {
                    tuple
                        .iter()
                        .zip(&var_types)
                        .all(|(t, vt)| t.compatible(vt))
                });
                match alt.tuples.len() {
                    0 => {
                        diags.push(Diagnostic::new(
                            alt.pos.clone(),
                            ErrorKind::NoMatchingCandidate {
                                name: alt.name.clone(),
                            },
                        ));
                        changed = true;
                    }
                    1 => {
                        let tuple = alt.tuples.pop().unwrap();
                        for (var, ty) in alt.vars.iter().zip(&tuple) {
                            if let Some(d) = self.unify_var(var, ty, &alt.pos) {
                                diags.push(d);
                            }
                        }
                        changed = true;
                    }
                    _ => remaining.push(alt),
                }
            }
            self.alternatives = remaining;
            if !changed {
                break;
            }
        }
        diags
    }

    /// Reports any alternative still ambiguous after the whole body has
    /// been inferred.
    pub fn finalize_alternatives(&mut self) -> Vec<Diagnostic> {
        let mut diags = self.narrow_alternatives();
        for alt in self.alternatives.drain(..) {
            diags.push(Diagnostic::new(
                alt.pos.clone(),
                ErrorKind::AmbiguousCall {
                    name: alt.name.clone(),
                    candidates: alt.tuples.len(),
                },
            ));
        }
        diags
    }
}
