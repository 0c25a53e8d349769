//! Per-state content: methods, data, guards, listeners and transition
//! definitions.
//!
//! Writers realize a virtual node before touching it and report what they
//! changed through a `mutate` notification. Readers resolve locally, then
//! along the owner lineage, then from the superstate.

use crate::builder::TransitionDefinition;
use crate::core::delta::{Edit, Mutation, Patch};
use crate::core::event::{EventType, Listener, ListenerId};
use crate::core::guard::{evaluate_rules, GuardContext, GuardKind, GuardRule};
use crate::core::method::Method;
use crate::runtime::node::Content;
use crate::runtime::{NodeId, Result, Runtime};
use serde_json::{Map, Value};

impl Runtime {
    /// First hit of `pick` in resolution order, with the node that held it.
    fn resolve_in<T>(&self, node: NodeId, pick: impl Fn(&Content) -> Option<T>) -> Result<Option<(NodeId, T)>> {
        let mut level = Some(self.live(node)?);
        while let Some(current) = level {
            let holders = std::iter::once(current).chain(self.lineage_nodes(current)?);
            for holder in holders {
                if let Some(found) = self.content(holder)?.and_then(&pick) {
                    return Ok(Some((holder, found)));
                }
            }
            level = self.superstate(current)?;
        }
        Ok(None)
    }

    // -- methods --

    /// Add a method to a state and make it callable on the owner.
    pub fn add_method(&mut self, node: NodeId, name: &str, method: Method) -> Result<Option<Method>> {
        let node = self.realize(node)?;
        let previous = self
            .content_mut(node)?
            .methods
            .insert(name.to_string(), method.clone());
        let controller = self.controller_of(node)?;
        self.install_stub(controller, name)?;

        let forward = Mutation::new().with_method(name, Patch::Set(method));
        let reverse = Mutation::new().with_method(name, restore(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(previous)
    }

    pub fn remove_method(&mut self, node: NodeId, name: &str) -> Result<Option<Method>> {
        let node = self.live(node)?;
        if self.is_virtual(node)? {
            return Ok(None);
        }
        let Some(previous) = self.content_mut(node)?.methods.remove(name) else {
            return Ok(None);
        };
        let forward = Mutation::new().with_method(name, Patch::Remove);
        let reverse = Mutation::new().with_method(name, Patch::Set(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(Some(previous))
    }

    /// The method `name` as seen from `node`.
    pub fn method(&self, node: NodeId, name: &str) -> Result<Option<Method>> {
        Ok(self.resolve_method(node, name)?.map(|(_, method)| method))
    }

    pub(crate) fn resolve_method(&self, node: NodeId, name: &str) -> Result<Option<(NodeId, Method)>> {
        self.resolve_in(node, |content| content.methods.get(name).cloned())
    }

    // -- data --

    /// Set a local data entry. Returns the previous local value.
    pub fn set_data(&mut self, node: NodeId, key: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        let value = value.into();
        let node = self.realize(node)?;
        let previous = self.content_mut(node)?.data.insert(key.to_string(), value.clone());

        let forward = Mutation::new().with_data(key, Edit::Set(value));
        let reverse = Mutation::new().with_data(key, previous.clone().map_or(Edit::Remove, Edit::Set));
        self.notify(node, forward, reverse)?;
        Ok(previous)
    }

    pub fn remove_data(&mut self, node: NodeId, key: &str) -> Result<Option<Value>> {
        let node = self.live(node)?;
        if self.is_virtual(node)? {
            return Ok(None);
        }
        let Some(previous) = self.content_mut(node)?.data.remove(key) else {
            return Ok(None);
        };
        let forward = Mutation::new().with_data(key, Edit::Remove);
        let reverse = Mutation::new().with_data(key, Edit::Set(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(Some(previous))
    }

    /// The value of `key` as seen from `node`.
    pub fn get_data(&self, node: NodeId, key: &str) -> Result<Option<Value>> {
        Ok(self
            .resolve_in(node, |content| content.data.get(key).cloned())?
            .map(|(_, value)| value))
    }

    /// Every data entry visible from `node`. Local entries shadow inherited
    /// ones, which shadow the superstates'.
    pub fn data(&self, node: NodeId) -> Result<Map<String, Value>> {
        let mut levels = Vec::new();
        let mut level = Some(self.live(node)?);
        while let Some(current) = level {
            levels.push(current);
            level = self.superstate(current)?;
        }

        let mut merged = Map::new();
        for current in levels.into_iter().rev() {
            let mut holders = self.lineage_nodes(current)?;
            holders.reverse();
            holders.push(current);
            for holder in holders {
                if let Some(content) = self.content(holder)? {
                    for (key, value) in &content.data {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Ok(merged)
    }

    // -- guards --

    /// Set the guard rule for `selector`, in place if the selector is
    /// already present.
    pub fn add_guard(
        &mut self,
        node: NodeId,
        kind: GuardKind,
        selector: &str,
        rule: impl Into<GuardRule>,
    ) -> Result<Option<GuardRule>> {
        let rule = rule.into();
        let node = self.realize(node)?;
        let previous = self.content_mut(node)?.guards.set(kind, selector, rule.clone());

        let forward = Mutation::new().with_guard(kind, selector, Patch::Set(rule));
        let reverse = Mutation::new().with_guard(kind, selector, restore(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(previous)
    }

    pub fn remove_guard(&mut self, node: NodeId, kind: GuardKind, selector: &str) -> Result<Option<GuardRule>> {
        let node = self.live(node)?;
        if self.is_virtual(node)? {
            return Ok(None);
        }
        let Some(previous) = self.content_mut(node)?.guards.remove(kind, selector) else {
            return Ok(None);
        };
        let forward = Mutation::new().with_guard(kind, selector, Patch::Remove);
        let reverse = Mutation::new().with_guard(kind, selector, Patch::Set(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(Some(previous))
    }

    /// Decide a guard of `node` against `candidate`.
    ///
    /// The rules come from the first of the node and its analogues with a
    /// non-empty map for `kind`. No matching selector passes.
    pub fn evaluate_guard(&self, node: NodeId, kind: GuardKind, candidate: NodeId) -> Result<bool> {
        let node = self.live(node)?;
        let candidate = self.live(candidate)?;
        let holders = std::iter::once(node).chain(self.lineage_nodes(node)?);
        let mut rules = None;
        for holder in holders {
            if let Some(content) = self.content(holder)? {
                let found = content.guards.rules(kind);
                if !found.is_empty() {
                    rules = Some(found);
                    break;
                }
            }
        }
        let Some(rules) = rules else {
            return Ok(true);
        };

        let context = self.path(node)?;
        let candidate_path = self.path(candidate)?;
        let guard = GuardContext {
            kind,
            guarded: node,
            candidate,
        };
        Ok(evaluate_rules(rules, self, &guard, |selector| {
            selector.matches(&context, &candidate_path)
        }))
    }

    // -- events --

    /// Register a listener by event name.
    pub fn add_event(&mut self, node: NodeId, kind: &str, listener: Listener) -> Result<ListenerId> {
        let kind: EventType = kind.parse()?;
        self.listen(node, kind, listener)
    }

    /// Register a listener for a known event type.
    pub fn listen(&mut self, node: NodeId, kind: EventType, listener: Listener) -> Result<ListenerId> {
        let node = self.realize(node)?;
        let before = self.local_listeners(node, kind)?;
        let id = self.content_mut(node)?.events.entry(kind).or_default().add(listener);
        let after = self.local_listeners(node, kind)?;
        self.notify_listeners(node, kind, before, after)?;
        Ok(id)
    }

    pub fn remove_event(&mut self, node: NodeId, kind: EventType, id: ListenerId) -> Result<Option<Listener>> {
        let node = self.live(node)?;
        if self.is_virtual(node)? {
            return Ok(None);
        }
        let before = self.local_listeners(node, kind)?;
        let content = self.content_mut(node)?;
        let Some(removed) = content.events.get_mut(&kind).and_then(|e| e.remove(id)) else {
            return Ok(None);
        };
        if content.events.get(&kind).is_some_and(|e| e.is_empty()) {
            content.events.remove(&kind);
        }
        let after = self.local_listeners(node, kind)?;
        self.notify_listeners(node, kind, before, after)?;
        Ok(Some(removed))
    }

    fn local_listeners(&self, node: NodeId, kind: EventType) -> Result<Vec<Listener>> {
        Ok(self
            .content(node)?
            .and_then(|c| c.events.get(&kind))
            .map(|e| e.listeners().cloned().collect())
            .unwrap_or_default())
    }

    fn notify_listeners(&mut self, node: NodeId, kind: EventType, before: Vec<Listener>, after: Vec<Listener>) -> Result<()> {
        let patch = |listeners: Vec<Listener>| {
            if listeners.is_empty() {
                Patch::Remove
            } else {
                Patch::Set(listeners)
            }
        };
        let mut forward = Mutation::new();
        forward.events.insert(kind, patch(after));
        let mut reverse = Mutation::new();
        reverse.events.insert(kind, patch(before));
        self.notify(node, forward, reverse)
    }

    // -- transitions --

    /// Add a named transition definition. Returns the one replaced.
    pub fn add_transition(
        &mut self,
        node: NodeId,
        name: &str,
        definition: TransitionDefinition,
    ) -> Result<Option<TransitionDefinition>> {
        let node = self.realize(node)?;
        let previous = self
            .content_mut(node)?
            .transitions
            .insert(name.to_string(), definition.clone());

        let mut forward = Mutation::new();
        forward.transitions.insert(name.to_string(), Patch::Set(definition));
        let mut reverse = Mutation::new();
        reverse.transitions.insert(name.to_string(), restore(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(previous)
    }

    pub fn remove_transition(&mut self, node: NodeId, name: &str) -> Result<Option<TransitionDefinition>> {
        let node = self.live(node)?;
        if self.is_virtual(node)? {
            return Ok(None);
        }
        let Some(previous) = self.content_mut(node)?.transitions.remove(name) else {
            return Ok(None);
        };
        let mut forward = Mutation::new();
        forward.transitions.insert(name.to_string(), Patch::Remove);
        let mut reverse = Mutation::new();
        reverse.transitions.insert(name.to_string(), Patch::Set(previous.clone()));
        self.notify(node, forward, reverse)?;
        Ok(Some(previous))
    }

    /// A transition definition held directly by `node`.
    pub fn transition_definition(&self, node: NodeId, name: &str) -> Result<Option<&TransitionDefinition>> {
        Ok(self.content(node)?.and_then(|c| c.transitions.get(name)))
    }
}

fn restore<T>(previous: Option<T>) -> Patch<T> {
    match previous {
        Some(value) => Patch::Set(value),
        None => Patch::Remove,
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::StateDefinition;
    use crate::core::event::{EventPayload, EventType, Listener};
    use crate::core::guard::{Guard, GuardKind};
    use crate::core::method;
    use crate::runtime::{AttachOptions, ControllerId, OwnerId, Runtime, RuntimeError};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn inherited() -> (Runtime, OwnerId, ControllerId) {
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        let def = StateDefinition::new()
            .data("shared", 1)
            .data("base_only", true)
            .method("greet", |_, _| json!("base"))
            .state(
                "A",
                StateDefinition::new()
                    .initial()
                    .data("shared", 2)
                    .method("greet", |_, _| json!("A")),
            )
            .state("B", StateDefinition::new());
        rt.attach(base, "state", def, AttachOptions::default()).unwrap();
        let child = rt.derive_owner(base, "child").unwrap();
        let ctl = rt.accessor(child, "state").unwrap();
        (rt, child, ctl)
    }

    #[test]
    fn data_resolves_local_then_lineage_then_superstate() {
        let (mut rt, _, ctl) = inherited();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        let b = rt.query(root, "B").unwrap().unwrap();

        assert_eq!(rt.get_data(a, "shared").unwrap(), Some(json!(2)));
        assert_eq!(rt.get_data(b, "shared").unwrap(), Some(json!(1)));
        assert_eq!(rt.get_data(b, "missing").unwrap(), None);

        rt.set_data(a, "shared", 3).unwrap();
        assert_eq!(rt.get_data(a, "shared").unwrap(), Some(json!(3)));
    }

    #[test]
    fn writes_realize_without_touching_the_ancestor() {
        let (mut rt, _, ctl) = inherited();
        let base_ctl = ControllerId::new(0);
        let base_root = rt.controller_root(base_ctl).unwrap();
        let base_a = rt.query(base_root, "A").unwrap().unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        assert!(rt.is_virtual(a).unwrap());

        rt.set_data(a, "shared", 10).unwrap();
        assert!(!rt.is_virtual(a).unwrap());
        assert_eq!(rt.get_data(base_a, "shared").unwrap(), Some(json!(2)));
        assert_eq!(rt.get_data(a, "shared").unwrap(), Some(json!(10)));
    }

    #[test]
    fn merged_data_prefers_the_nearest_definition() {
        let (mut rt, _, ctl) = inherited();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        rt.set_data(root, "local", "x").unwrap();

        let data = rt.data(a).unwrap();
        assert_eq!(data.get("shared"), Some(&json!(2)));
        assert_eq!(data.get("base_only"), Some(&json!(true)));
        assert_eq!(data.get("local"), Some(&json!("x")));
    }

    #[test]
    fn removing_local_data_reveals_inherited_value() {
        let (mut rt, _, ctl) = inherited();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        rt.set_data(a, "shared", 5).unwrap();
        assert_eq!(rt.remove_data(a, "shared").unwrap(), Some(json!(5)));
        assert_eq!(rt.get_data(a, "shared").unwrap(), Some(json!(2)));
        assert_eq!(rt.remove_data(a, "shared").unwrap(), None);
    }

    #[test]
    fn methods_resolve_through_lineage() {
        let (mut rt, child, ctl) = inherited();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        let (holder, _) = rt.resolve_method(a, "greet").unwrap().unwrap();
        assert_ne!(rt.controller_of(holder).unwrap(), ctl);

        rt.add_method(a, "greet", method(|_, _| json!("child"))).unwrap();
        assert_eq!(rt.invoke(child, "greet", json!(null)).unwrap(), Some(json!("child")));
    }

    #[test]
    fn guards_fall_back_to_the_analogue() {
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        let def = StateDefinition::new()
            .state("A", StateDefinition::new().initial().release("..B", false))
            .state("B", StateDefinition::new())
            .state("C", StateDefinition::new());
        rt.attach(base, "state", def, AttachOptions::default()).unwrap();
        let child = rt.derive_owner(base, "child").unwrap();
        let ctl = rt.accessor(child, "state").unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        let b = rt.query(root, "B").unwrap().unwrap();
        let c = rt.query(root, "C").unwrap().unwrap();

        assert!(!rt.evaluate_guard(a, GuardKind::Release, b).unwrap());
        assert!(rt.evaluate_guard(a, GuardKind::Release, c).unwrap());
        assert!(rt.evaluate_guard(b, GuardKind::Admit, a).unwrap());

        rt.add_guard(a, GuardKind::Release, "..C", false).unwrap();
        assert!(rt.evaluate_guard(a, GuardKind::Release, b).unwrap());
        assert!(!rt.evaluate_guard(a, GuardKind::Release, c).unwrap());
    }

    #[test]
    fn predicate_guards_see_the_candidate() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let def = StateDefinition::new()
            .state("A", StateDefinition::new().initial())
            .state("B", StateDefinition::new().data("open", false));
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let b = rt.query(root, "B").unwrap().unwrap();
        let a = rt.query(root, "A").unwrap().unwrap();
        let open = Guard::new(|rt, ctx| {
            rt.get_data(ctx.guarded, "open")
                .ok()
                .flatten()
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        });
        rt.add_guard(b, GuardKind::Admit, "*", open).unwrap();

        assert!(!rt.evaluate_guard(b, GuardKind::Admit, a).unwrap());
        rt.set_data(b, "open", true).unwrap();
        assert!(rt.evaluate_guard(b, GuardKind::Admit, a).unwrap());
    }

    #[test]
    fn unknown_event_names_are_rejected() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", StateDefinition::new(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let err = rt.add_event(root, "entered", Listener::redirect("")).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownEventType(_)));
    }

    #[test]
    fn each_mutator_reports_a_mutation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", StateDefinition::new(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let id = rt
            .listen(
                root,
                EventType::Mutate,
                Listener::callback(move |_, event| {
                    if let EventPayload::Mutation(notice) = &event.payload {
                        sink.lock().unwrap().push(notice.forward.data.keys().cloned().collect::<Vec<_>>());
                    }
                }),
            )
            .unwrap();

        // registering the listener is itself a mutation
        assert_eq!(seen.lock().unwrap().len(), 1);
        seen.lock().unwrap().clear();

        rt.set_data(root, "a", 1).unwrap();
        rt.remove_data(root, "a").unwrap();
        rt.add_guard(root, GuardKind::Admit, "*", true).unwrap();
        let a = vec!["a".to_string()];
        assert_eq!(*seen.lock().unwrap(), vec![a.clone(), a, Vec::new()]);

        assert!(rt.remove_event(root, EventType::Mutate, id).unwrap().is_some());
        rt.set_data(root, "b", 1).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
