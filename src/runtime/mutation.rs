//! Expression and structural mutation of states.

use crate::builder::StateDefinition;
use crate::core::attributes::Attributes;
use crate::core::delta::{apply_to_map, diff_definitions, Mutation, MutationNotice, Patch, SubstateEdit};
use crate::core::event::{Emitter, EventPayload, EventType};
use crate::runtime::{NodeId, Result, RuntimeError, Runtime};
use std::collections::BTreeMap;
use std::sync::Arc;

impl Runtime {
    /// Snapshot of a state's local content and real substates. A virtual
    /// state expresses as an empty definition carrying its attributes.
    pub fn express(&self, node: NodeId) -> Result<StateDefinition> {
        let node = self.live(node)?;
        let attributes = self.attributes(node)?.difference(Attributes::VIRTUAL);
        let mut definition = StateDefinition::new().attributes(attributes);
        let Some(content) = self.content(node)? else {
            return Ok(definition);
        };

        definition.data = content.data.clone();
        definition.methods = content.methods.clone();
        definition.events = content
            .events
            .iter()
            .filter(|(_, emitter)| !emitter.is_empty())
            .map(|(kind, emitter)| (*kind, emitter.listeners().cloned().collect()))
            .collect();
        definition.guards = content.guards.clone();
        definition.transitions = content.transitions.clone();
        for &child in &content.substates {
            let name = self.name(child)?.to_string();
            definition.states.push((name, self.express(child)?));
        }
        Ok(definition)
    }

    /// True if the state or one of its superstates is `mutable`.
    pub fn is_mutable(&self, node: NodeId) -> Result<bool> {
        let mut cursor = Some(self.live(node)?);
        while let Some(id) = cursor {
            if self.attributes(id)?.contains(Attributes::MUTABLE) {
                return Ok(true);
            }
            cursor = self.superstate(id)?;
        }
        Ok(false)
    }

    /// Apply a structural edit to a mutable state and emit a single
    /// `mutate` notification describing the net change.
    ///
    /// Returns the forward mutation actually applied (empty if nothing
    /// changed). Substate edits the transition in flight passes through are
    /// skipped and so absent from the result.
    pub fn mutate(&mut self, node: NodeId, mutation: &Mutation) -> Result<Mutation> {
        if !self.is_mutable(node)? {
            return Err(RuntimeError::NotMutable(self.qualified_name(node)?));
        }
        self.apply_tracked(node, mutation)
    }

    /// Apply and notify without the mutability check.
    pub(crate) fn apply_tracked(&mut self, node: NodeId, mutation: &Mutation) -> Result<Mutation> {
        let node = self.realize(node)?;
        let before = self.express(node)?;
        self.quiet += 1;
        let applied = self.apply_mutation(node, mutation);
        self.quiet -= 1;
        applied?;

        let node = self.live(node)?;
        let after = self.express(node)?;
        let forward = diff_definitions(&before, &after);
        let reverse = diff_definitions(&after, &before);
        self.notify(node, forward.clone(), reverse)?;
        Ok(forward)
    }

    fn apply_mutation(&mut self, node: NodeId, mutation: &Mutation) -> Result<()> {
        let node = self.realize(node)?;

        if let Some(attributes) = mutation.attributes {
            let attributes = attributes.difference(Attributes::VIRTUAL);
            self.node_mut(node)?.attributes = attributes;
            let content = self.content_mut(node)?;
            if attributes.contains(Attributes::HISTORY) && content.history.is_none() {
                content.history = Some(Default::default());
            }
        }

        apply_to_map(&mut self.content_mut(node)?.data, &mutation.data);

        for (name, patch) in &mutation.methods {
            match patch {
                Patch::Set(method) => {
                    self.add_method(node, name, method.clone())?;
                }
                Patch::Remove => {
                    self.remove_method(node, name)?;
                }
            }
        }

        for (kind, patch) in &mutation.events {
            let events = &mut self.content_mut(node)?.events;
            replace_listeners(events, *kind, patch);
        }

        for edit in &mutation.guards {
            let guards = &mut self.content_mut(node)?.guards;
            match &edit.patch {
                Patch::Set(rule) => {
                    guards.set(edit.kind, &edit.selector, rule.clone());
                }
                Patch::Remove => {
                    guards.remove(edit.kind, &edit.selector);
                }
            }
        }

        for (name, edit) in &mutation.states {
            match edit {
                SubstateEdit::Add(definition) => {
                    self.add_substate(node, name, definition.clone())?;
                }
                SubstateEdit::Remove => {
                    self.remove_substate(node, name)?;
                }
                SubstateEdit::Mutate(nested) => {
                    let Some(child) = self.substate(node, name)? else {
                        return Err(RuntimeError::InvalidTarget(name.clone()));
                    };
                    self.apply_mutation(child, nested)?;
                }
            }
        }

        let transitions = &mut self.content_mut(node)?.transitions;
        for (name, patch) in &mutation.transitions {
            match patch {
                Patch::Set(definition) => {
                    transitions.insert(name.clone(), definition.clone());
                }
                Patch::Remove => {
                    transitions.remove(name);
                }
            }
        }
        Ok(())
    }

    /// Report a local change: record it in active history states and emit
    /// `mutate`. Does nothing while notifications are suppressed.
    pub(crate) fn notify(&mut self, node: NodeId, forward: Mutation, reverse: Mutation) -> Result<()> {
        if self.quiet > 0 || forward.is_empty() {
            return Ok(());
        }
        if self.replaying == 0 {
            self.record_delta(node, &forward, &reverse)?;
        }
        let notice = MutationNotice { forward, reverse };
        self.emit_on(node, EventType::Mutate, EventPayload::Mutation(Arc::new(notice)), true)
    }
}

fn replace_listeners(
    events: &mut BTreeMap<EventType, Emitter>,
    kind: EventType,
    patch: &Patch<Vec<crate::core::event::Listener>>,
) {
    match patch {
        Patch::Set(listeners) => {
            let mut emitter = Emitter::new();
            for listener in listeners {
                emitter.add(listener.clone());
            }
            events.insert(kind, emitter);
        }
        Patch::Remove => {
            events.remove(&kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::StateDefinition;
    use crate::core::delta::{Edit, Mutation, SubstateEdit};
    use crate::core::event::{EventPayload, EventType, Listener};
    use crate::core::Attributes;
    use crate::runtime::{AttachOptions, Runtime, RuntimeError};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn document() -> StateDefinition {
        StateDefinition::new()
            .mutable()
            .data("title", "draft")
            .state("Editing", StateDefinition::new().initial().data("cursor", 0))
            .state("Review", StateDefinition::new())
    }

    #[test]
    fn express_captures_local_content() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("doc");
        let ctl = rt.attach(owner, "state", document(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();

        let expressed = rt.express(root).unwrap();
        assert_eq!(expressed, document());
        assert_eq!(expressed.substate_names(), vec!["Editing", "Review"]);
    }

    #[test]
    fn virtual_states_express_empty() {
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        rt.attach(base, "state", document(), AttachOptions::default()).unwrap();
        let child = rt.derive_owner(base, "child").unwrap();
        let ctl = rt.accessor(child, "state").unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let review = rt.query(root, "Review").unwrap().unwrap();

        let expressed = rt.express(review).unwrap();
        assert!(expressed.data_map().is_empty());
        assert!(!expressed.attribute_set().contains(Attributes::VIRTUAL));
    }

    #[test]
    fn mutate_requires_mutability() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let def = StateDefinition::new().state("A", StateDefinition::new().initial());
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();

        let edit = Mutation::new().with_data("x", Edit::Set(json!(1)));
        assert!(matches!(rt.mutate(root, &edit), Err(RuntimeError::NotMutable(path)) if path.is_empty()));
    }

    #[test]
    fn mutate_emits_one_notification_with_net_change() {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        let mut rt = Runtime::new();
        let owner = rt.create_owner("doc");
        let def = document().listener(
            EventType::Mutate,
            Listener::callback(move |_, event| {
                if let EventPayload::Mutation(notice) = &event.payload {
                    sink.lock().unwrap().push(notice.clone());
                }
            }),
        );
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();

        let edit = Mutation::new()
            .with_data("title", Edit::Set(json!("final")))
            .with_data("pages", Edit::Set(json!(3)))
            .with_substate("Review", SubstateEdit::Remove)
            .with_substate(
                "Editing",
                SubstateEdit::Mutate(Mutation::new().with_data("cursor", Edit::Remove)),
            );
        let forward = rt.mutate(root, &edit).unwrap();

        let notices = notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(forward.data.len(), 2);
        assert_eq!(notices[0].reverse.data.get("title"), Some(&Edit::Set(json!("draft"))));
        assert!(rt.query(root, "Review").unwrap().is_none());
        let editing = rt.query(root, "Editing").unwrap().unwrap();
        assert_eq!(rt.get_data(editing, "cursor").unwrap(), None);
    }

    #[test]
    fn reverse_mutation_restores_expression() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("doc");
        let ctl = rt.attach(owner, "state", document(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let before = rt.express(root).unwrap();

        let edit = Mutation::new()
            .with_data("title", Edit::Set(json!("other")))
            .with_substate("Archive", SubstateEdit::Add(StateDefinition::new().data("n", 1)));
        rt.mutate(root, &edit).unwrap();
        let after = rt.express(root).unwrap();
        assert_ne!(before, after);

        let reverse = StateDefinition::diff(&after, &before);
        rt.mutate(root, &reverse).unwrap();
        assert_eq!(rt.express(root).unwrap(), before);
    }

    #[test]
    fn nested_edit_of_missing_substate_is_invalid() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("doc");
        let ctl = rt.attach(owner, "state", document(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();

        let edit = Mutation::new().with_substate("Ghost", SubstateEdit::Mutate(Mutation::new()));
        assert!(matches!(
            rt.mutate(root, &edit),
            Err(RuntimeError::InvalidTarget(name)) if name == "Ghost"
        ));
    }
}
