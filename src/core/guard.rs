//! Guard rules for admitting and releasing states.
//!
//! A state carries two ordered guard maps: `admit` is consulted when the
//! state is a transition's target, `release` when it is the origin. Each
//! entry pairs a selector with a rule; the first selector that matches the
//! other end of the transition decides.

use crate::core::selector::Selector;
use crate::runtime::{NodeId, Runtime};
use std::fmt;
use std::sync::Arc;

/// Which side of a transition a guard controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GuardKind {
    /// Evaluated on the target, against the origin.
    Admit,
    /// Evaluated on the origin, against the target.
    Release,
}

impl GuardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admit => "admit",
            Self::Release => "release",
        }
    }
}

/// What a guard predicate is asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardContext {
    pub kind: GuardKind,
    /// The state holding the guard.
    pub guarded: NodeId,
    /// The other end of the transition.
    pub candidate: NodeId,
}

/// Predicate deciding whether a transition may proceed.
///
/// Predicates get read-only access to the runtime so they can inspect data
/// or the candidate's path, but cannot change anything.
///
/// # Example
///
/// ```rust
/// use protostate::core::Guard;
///
/// let no_virtual = Guard::new(|rt, ctx| {
///     rt.is_virtual(ctx.candidate).map(|v| !v).unwrap_or(false)
/// });
/// # let _ = no_virtual;
/// ```
#[derive(Clone)]
pub struct Guard {
    predicate: Arc<dyn Fn(&Runtime, &GuardContext) -> bool + Send + Sync>,
}

impl Guard {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Runtime, &GuardContext) -> bool + Send + Sync + 'static,
    {
        Guard {
            predicate: Arc::new(predicate),
        }
    }

    pub fn check(&self, runtime: &Runtime, context: &GuardContext) -> bool {
        (self.predicate)(runtime, context)
    }

    pub fn same_as(&self, other: &Guard) -> bool {
        Arc::as_ptr(&self.predicate) as *const () == Arc::as_ptr(&other.predicate) as *const ()
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Guard(..)")
    }
}

/// The value stored under a guard selector.
#[derive(Clone, Debug)]
pub enum GuardRule {
    Allow(bool),
    Check(Guard),
}

impl GuardRule {
    pub fn same_as(&self, other: &GuardRule) -> bool {
        match (self, other) {
            (GuardRule::Allow(a), GuardRule::Allow(b)) => a == b,
            (GuardRule::Check(a), GuardRule::Check(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl From<bool> for GuardRule {
    fn from(value: bool) -> Self {
        GuardRule::Allow(value)
    }
}

impl From<Guard> for GuardRule {
    fn from(guard: Guard) -> Self {
        GuardRule::Check(guard)
    }
}

/// Ordered admit and release maps of one state.
#[derive(Clone, Debug, Default)]
pub struct GuardMap {
    admit: Vec<(String, GuardRule)>,
    release: Vec<(String, GuardRule)>,
}

impl GuardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self, kind: GuardKind) -> &[(String, GuardRule)] {
        match kind {
            GuardKind::Admit => &self.admit,
            GuardKind::Release => &self.release,
        }
    }

    fn rules_mut(&mut self, kind: GuardKind) -> &mut Vec<(String, GuardRule)> {
        match kind {
            GuardKind::Admit => &mut self.admit,
            GuardKind::Release => &mut self.release,
        }
    }

    pub fn get(&self, kind: GuardKind, selector: &str) -> Option<&GuardRule> {
        self.rules(kind)
            .iter()
            .find(|(key, _)| key == selector)
            .map(|(_, rule)| rule)
    }

    /// Replace the rule for `selector` in place, or append it. Returns the
    /// replaced rule.
    pub fn set(&mut self, kind: GuardKind, selector: &str, rule: GuardRule) -> Option<GuardRule> {
        let rules = self.rules_mut(kind);
        if let Some((_, existing)) = rules.iter_mut().find(|(key, _)| key == selector) {
            return Some(std::mem::replace(existing, rule));
        }
        rules.push((selector.to_string(), rule));
        None
    }

    pub fn remove(&mut self, kind: GuardKind, selector: &str) -> Option<GuardRule> {
        let rules = self.rules_mut(kind);
        let index = rules.iter().position(|(key, _)| key == selector)?;
        Some(rules.remove(index).1)
    }

    pub fn is_empty(&self) -> bool {
        self.admit.is_empty() && self.release.is_empty()
    }
}

/// Evaluate a rule list in order.
///
/// `matches` decides whether a selector selects the candidate in the
/// guarded state's context. No matching selector means the guard passes.
pub fn evaluate_rules<M>(
    rules: &[(String, GuardRule)],
    runtime: &Runtime,
    context: &GuardContext,
    matches: M,
) -> bool
where
    M: Fn(&Selector) -> bool,
{
    for (selector, rule) in rules {
        let selector = Selector::parse(selector);
        if selector.is_universal() || matches(&selector) {
            return match rule {
                GuardRule::Allow(value) => *value,
                GuardRule::Check(guard) => guard.check(runtime, context),
            };
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> GuardContext {
        GuardContext {
            kind: GuardKind::Release,
            guarded: NodeId::new(0, 0),
            candidate: NodeId::new(1, 0),
        }
    }

    #[test]
    fn empty_rules_pass() {
        let runtime = Runtime::new();
        assert!(evaluate_rules(&[], &runtime, &context(), |_| true));
    }

    #[test]
    fn first_match_decides() {
        let runtime = Runtime::new();
        let rules = vec![
            ("A".to_string(), GuardRule::Allow(false)),
            ("B".to_string(), GuardRule::Allow(true)),
        ];
        let hits_b = evaluate_rules(&rules, &runtime, &context(), |s| s.as_str() == "B");
        let hits_a = evaluate_rules(&rules, &runtime, &context(), |s| s.as_str() != "C");
        assert!(hits_b);
        assert!(!hits_a);
    }

    #[test]
    fn universal_selector_always_matches() {
        let runtime = Runtime::new();
        let rules = vec![("*".to_string(), GuardRule::Allow(false))];
        assert!(!evaluate_rules(&rules, &runtime, &context(), |_| false));
    }

    #[test]
    fn predicate_rules_are_invoked() {
        let runtime = Runtime::new();
        let guard = Guard::new(|_, ctx| ctx.kind == GuardKind::Release);
        let rules = vec![("**".to_string(), GuardRule::Check(guard))];
        assert!(evaluate_rules(&rules, &runtime, &context(), |_| false));
    }

    #[test]
    fn guard_is_deterministic() {
        let runtime = Runtime::new();
        let guard = Guard::new(|_, ctx| ctx.candidate != ctx.guarded);
        let ctx = context();
        assert_eq!(guard.check(&runtime, &ctx), guard.check(&runtime, &ctx));
    }

    #[test]
    fn set_replaces_in_place_and_preserves_order() {
        let mut map = GuardMap::new();
        map.set(GuardKind::Admit, "A", true.into());
        map.set(GuardKind::Admit, "B", true.into());
        let replaced = map.set(GuardKind::Admit, "A", false.into());

        assert!(matches!(replaced, Some(GuardRule::Allow(true))));
        let keys: Vec<&str> = map
            .rules(GuardKind::Admit)
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert!(map.rules(GuardKind::Release).is_empty());
    }

    #[test]
    fn remove_drops_rule() {
        let mut map = GuardMap::new();
        map.set(GuardKind::Release, "*", false.into());
        assert!(map.remove(GuardKind::Release, "*").is_some());
        assert!(map.is_empty());
    }
}
