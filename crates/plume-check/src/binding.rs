//! The binding-state lattice.
//!
//! A [`BindingState`] describes one program point: whether control can
//! reach it, whether the preceding code can succeed, and which variables
//! are bound if it does. Four elements, ordered
//! `Impossible < Failing < Succeeding < Possible`:
//!
//! - `Impossible`: unreachable.
//! - `Failing`: reachable, cannot succeed.
//! - `Succeeding(S)`: definitely succeeds, binding the variables in `S`.
//! - `Possible(S)`: may succeed binding `S`, may fail.
//!
//! `join` combines alternative paths (set intersection on bound variables);
//! `meet` combines conjoined requirements (set union).

use plume_core::VarSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Impossible,
    Failing,
    Succeeding(VarSet),
    Possible(VarSet),
}

impl BindingState {
    /// The entry state of a body whose inputs are `vars`.
    pub fn entry(vars: VarSet) -> Self {
        BindingState::Succeeding(vars)
    }

    /// Variables bound at this point. Empty when the point cannot be
    /// reached with a binding.
    pub fn vars(&self) -> VarSet {
        match self {
            BindingState::Succeeding(s) | BindingState::Possible(s) => s.clone(),
            BindingState::Impossible | BindingState::Failing => VarSet::new(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        !matches!(self, BindingState::Impossible)
    }

    /// `true` when the preceding code can still succeed.
    pub fn can_succeed(&self) -> bool {
        matches!(
            self,
            BindingState::Succeeding(_) | BindingState::Possible(_)
        )
    }

    pub fn is_bound(&self, var: &str) -> bool {
        match self {
            BindingState::Succeeding(s) | BindingState::Possible(s) => {
                s.contains(var)
            }
            _ => false,
        }
    }

    /// Binds `vars` on the success paths.
    pub fn bind_all<I: IntoIterator<Item = String>>(&mut self, vars: I) {
        if let BindingState::Succeeding(s) | BindingState::Possible(s) = self {
            s.extend(vars);
        }
    }

    /// State after a statement that always succeeds, binding `outs`.
    pub fn seq_det<I: IntoIterator<Item = String>>(mut self, outs: I) -> Self {
        self.bind_all(outs);
        self
    }

    /// State after a statement that may fail, binding `outs` on success.
    pub fn seq_semidet<I: IntoIterator<Item = String>>(self, outs: I) -> Self {
        match self {
            BindingState::Impossible => BindingState::Impossible,
            BindingState::Failing => BindingState::Failing,
            BindingState::Succeeding(mut s) | BindingState::Possible(mut s) => {
                s.extend(outs);
                BindingState::Possible(s)
            }
        }
    }

    /// State after `Fail`, `Break`, or `Next`: the following statement is
    /// unreachable.
    pub fn seq_unreachable(self) -> Self {
        BindingState::Impossible
    }

    fn rank(&self) -> u8 {
        match self {
            BindingState::Impossible => 0,
            BindingState::Failing => 1,
            BindingState::Succeeding(_) => 2,
            BindingState::Possible(_) => 3,
        }
    }

    /// Join of alternative paths. Bound sets intersect; a path that can
    /// fail joined with one that succeeds yields `Possible`.
    pub fn join(&self, other: &BindingState) -> BindingState {
        use BindingState::*;
        match (self, other) {
            (Impossible, x) | (x, Impossible) => x.clone(),
            (Failing, Failing) => Failing,
            (Failing, Succeeding(s)) | (Succeeding(s), Failing) => {
                Possible(s.clone())
            }
            (Failing, Possible(s)) | (Possible(s), Failing) => Possible(s.clone()),
            (Succeeding(s1), Succeeding(s2)) => {
                Succeeding(s1.intersection(s2).cloned().collect())
            }
            (Succeeding(s1), Possible(s2))
            | (Possible(s1), Succeeding(s2))
            | (Possible(s1), Possible(s2)) => {
                Possible(s1.intersection(s2).cloned().collect())
            }
        }
    }

    /// Meet of conjoined requirements. Bound sets union; any conjunct that
    /// cannot succeed drags the result down.
    pub fn meet(&self, other: &BindingState) -> BindingState {
        use BindingState::*;
        match (self, other) {
            (Impossible, _) | (_, Impossible) => Impossible,
            (Failing, _) | (_, Failing) => Failing,
            (Succeeding(s1), Succeeding(s2)) => {
                Succeeding(s1.union(s2).cloned().collect())
            }
            (Succeeding(s1), Possible(s2))
            | (Possible(s1), Succeeding(s2))
            | (Possible(s1), Possible(s2)) => {
                Possible(s1.union(s2).cloned().collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(names: &[&str]) -> VarSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn join_intersects_bound_sets() {
        let a = BindingState::Succeeding(set(&["x", "y"]));
        let b = BindingState::Succeeding(set(&["y", "z"]));
        assert_eq!(a.join(&b), BindingState::Succeeding(set(&["y"])));
    }

    #[test]
    fn meet_unions_bound_sets() {
        let a = BindingState::Succeeding(set(&["x"]));
        let b = BindingState::Succeeding(set(&["y"]));
        assert_eq!(a.meet(&b), BindingState::Succeeding(set(&["x", "y"])));
    }

    #[test]
    fn join_of_failing_and_succeeding_is_possible() {
        let a = BindingState::Failing;
        let b = BindingState::Succeeding(set(&["x"]));
        assert_eq!(a.join(&b), BindingState::Possible(set(&["x"])));
    }

    #[test]
    fn impossible_is_join_identity() {
        let b = BindingState::Possible(set(&["x"]));
        assert_eq!(BindingState::Impossible.join(&b), b);
        assert_eq!(b.join(&BindingState::Impossible), b);
    }

    #[test]
    fn semidet_sequencing_downgrades_to_possible() {
        let s = BindingState::entry(set(&["a"]));
        let after = s.seq_semidet(vec!["b".to_string()]);
        assert_eq!(after, BindingState::Possible(set(&["a", "b"])));
    }

    #[test]
    fn det_sequencing_keeps_success() {
        let s = BindingState::entry(set(&["a"]));
        let after = s.seq_det(vec!["b".to_string()]);
        assert_eq!(after, BindingState::Succeeding(set(&["a", "b"])));
    }

    #[test]
    fn unreachable_after_fail() {
        let s = BindingState::entry(set(&["a"]));
        assert_eq!(s.seq_unreachable(), BindingState::Impossible);
    }

    // Property tests: lattice laws.

    fn arb_state() -> impl Strategy<Value = BindingState> {
        let names = prop::collection::btree_set("[abc]", 0..3)
            .prop_map(|s| s.into_iter().collect::<VarSet>());
        prop_oneof![
            Just(BindingState::Impossible),
            Just(BindingState::Failing),
            names.clone().prop_map(BindingState::Succeeding),
            names.prop_map(BindingState::Possible),
        ]
    }

    proptest! {
        #[test]
        fn join_commutative(a in arb_state(), b in arb_state()) {
            prop_assert_eq!(a.join(&b), b.join(&a));
        }

        #[test]
        fn meet_commutative(a in arb_state(), b in arb_state()) {
            prop_assert_eq!(a.meet(&b), b.meet(&a));
        }

        #[test]
        fn join_associative(
            a in arb_state(),
            b in arb_state(),
            c in arb_state(),
        ) {
            prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        }

        #[test]
        fn meet_associative(
            a in arb_state(),
            b in arb_state(),
            c in arb_state(),
        ) {
            prop_assert_eq!(a.meet(&b).meet(&c), a.meet(&b.meet(&c)));
        }

        #[test]
        fn join_idempotent(a in arb_state()) {
            prop_assert_eq!(a.join(&a), a.clone());
        }

        #[test]
        fn meet_idempotent(a in arb_state()) {
            prop_assert_eq!(a.meet(&a), a.clone());
        }
    }
}
