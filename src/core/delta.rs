//! Structural edits: the diff/merge algebra behind `express()`,
//! `mutate()` and history replay.
//!
//! Data is edited with [`Edit`], a JSON patch tree whose `Remove` variant is
//! the reserved deletion sentinel. Everything else a state holds is edited
//! by name with a [`Patch`], and substates recursively with
//! [`SubstateEdit`]. Together they form a [`Mutation`].

use crate::builder::{StateDefinition, TransitionDefinition};
use crate::core::attributes::Attributes;
use crate::core::event::{EventType, Listener};
use crate::core::guard::{GuardKind, GuardRule};
use crate::core::method::{same_method, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Edit to a JSON value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Edit {
    /// Replace the value.
    Set(Value),
    /// Delete the key holding the value.
    Remove,
    /// Edit keys of an object, leaving the others untouched.
    Merge(BTreeMap<String, Edit>),
}

/// Compute the edit turning `before` into `after`, or `None` if equal.
///
/// # Example
///
/// ```rust
/// use protostate::core::delta::{apply, diff};
/// use serde_json::json;
///
/// let mut before = json!({ "a": 1, "nested": { "x": true, "y": false } });
/// let after = json!({ "nested": { "x": true, "z": 3 } });
///
/// let edit = diff(&before, &after).unwrap();
/// apply(&mut before, &edit);
/// assert_eq!(before, after);
/// ```
pub fn diff(before: &Value, after: &Value) -> Option<Edit> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => Some(Edit::Merge(diff_maps(b, a))),
        _ => Some(Edit::Set(after.clone())),
    }
}

/// Key-wise edits turning one object into another.
pub fn diff_maps(before: &Map<String, Value>, after: &Map<String, Value>) -> BTreeMap<String, Edit> {
    let mut edits = BTreeMap::new();
    for key in before.keys() {
        if !after.contains_key(key) {
            edits.insert(key.clone(), Edit::Remove);
        }
    }
    for (key, value) in after {
        match before.get(key) {
            Some(previous) => {
                if let Some(edit) = diff(previous, value) {
                    edits.insert(key.clone(), edit);
                }
            }
            None => {
                edits.insert(key.clone(), Edit::Set(value.clone()));
            }
        }
    }
    edits
}

/// Apply an edit in place. `Remove` at the top level resets to `null`.
pub fn apply(target: &mut Value, edit: &Edit) {
    match edit {
        Edit::Set(value) => *target = value.clone(),
        Edit::Remove => *target = Value::Null,
        Edit::Merge(edits) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                apply_to_map(map, edits);
            }
        }
    }
}

pub fn apply_to_map(target: &mut Map<String, Value>, edits: &BTreeMap<String, Edit>) {
    for (key, edit) in edits {
        match edit {
            Edit::Remove => {
                target.remove(key);
            }
            _ => apply(target.entry(key.clone()).or_insert(Value::Null), edit),
        }
    }
}

/// Set or delete a named entry.
#[derive(Clone)]
pub enum Patch<T> {
    Set(T),
    Remove,
}

impl<T> Patch<T> {
    pub fn is_remove(&self) -> bool {
        matches!(self, Patch::Remove)
    }
}

impl<T> fmt::Debug for Patch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Set(_) => f.write_str("Set(..)"),
            Patch::Remove => f.write_str("Remove"),
        }
    }
}

/// One guard selector edit.
#[derive(Clone, Debug)]
pub struct GuardEdit {
    pub kind: GuardKind,
    pub selector: String,
    pub patch: Patch<GuardRule>,
}

/// Edit of a named substate.
#[derive(Clone, Debug)]
pub enum SubstateEdit {
    /// Add the substate, replacing any existing one of the same name.
    Add(StateDefinition),
    Remove,
    /// Edit the existing substate in place.
    Mutate(Mutation),
}

/// A structural edit spanning every content category of a state.
#[derive(Clone, Default)]
pub struct Mutation {
    pub attributes: Option<Attributes>,
    pub data: BTreeMap<String, Edit>,
    pub methods: BTreeMap<String, Patch<Method>>,
    pub events: BTreeMap<EventType, Patch<Vec<Listener>>>,
    /// Applied in order.
    pub guards: Vec<GuardEdit>,
    /// Applied in order.
    pub states: Vec<(String, SubstateEdit)>,
    pub transitions: BTreeMap<String, Patch<TransitionDefinition>>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_none()
            && self.data.is_empty()
            && self.methods.is_empty()
            && self.events.is_empty()
            && self.guards.is_empty()
            && self.states.is_empty()
            && self.transitions.is_empty()
    }

    pub fn with_data(mut self, key: impl Into<String>, edit: Edit) -> Self {
        self.data.insert(key.into(), edit);
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, patch: Patch<Method>) -> Self {
        self.methods.insert(name.into(), patch);
        self
    }

    pub fn with_substate(mut self, name: impl Into<String>, edit: SubstateEdit) -> Self {
        self.states.push((name.into(), edit));
        self
    }

    pub fn with_guard(mut self, kind: GuardKind, selector: impl Into<String>, patch: Patch<GuardRule>) -> Self {
        self.guards.push(GuardEdit {
            kind,
            selector: selector.into(),
            patch,
        });
        self
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("attributes", &self.attributes)
            .field("data", &self.data)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("guards", &self.guards)
            .field("states", &self.states)
            .field("transitions", &self.transitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Payload of a `mutate` event.
#[derive(Clone, Debug)]
pub struct MutationNotice {
    /// Turns the state's previous content into its new content.
    pub forward: Mutation,
    /// Turns the new content back into the previous content.
    pub reverse: Mutation,
}

fn same_listeners(a: &[Listener], b: &[Listener]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

fn same_rules(a: &[(String, GuardRule)], b: &[(String, GuardRule)]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((ka, ra), (kb, rb))| ka == kb && ra.same_as(rb))
}

/// Compute the mutation that turns `before` into `after`.
///
/// Substates are matched by name; a substate whose attributes changed is
/// replaced wholesale.
pub fn diff_definitions(before: &StateDefinition, after: &StateDefinition) -> Mutation {
    let mut mutation = Mutation::new();

    if before.attributes != after.attributes {
        mutation.attributes = Some(after.attributes);
    }

    mutation.data = diff_maps(&before.data, &after.data);

    for name in before.methods.keys() {
        if !after.methods.contains_key(name) {
            mutation.methods.insert(name.clone(), Patch::Remove);
        }
    }
    for (name, method) in &after.methods {
        let unchanged = before
            .methods
            .get(name)
            .is_some_and(|previous| same_method(previous, method));
        if !unchanged {
            mutation.methods.insert(name.clone(), Patch::Set(method.clone()));
        }
    }

    let kinds: BTreeSet<EventType> = before
        .events
        .keys()
        .chain(after.events.keys())
        .copied()
        .collect();
    for kind in kinds {
        let old = before.events.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        let new = after.events.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        if same_listeners(old, new) {
            continue;
        }
        let patch = if new.is_empty() {
            Patch::Remove
        } else {
            Patch::Set(new.to_vec())
        };
        mutation.events.insert(kind, patch);
    }

    for kind in [GuardKind::Admit, GuardKind::Release] {
        let old = before.guards.rules(kind);
        let new = after.guards.rules(kind);
        if same_rules(old, new) {
            continue;
        }
        for (selector, _) in old {
            mutation.guards.push(GuardEdit {
                kind,
                selector: selector.clone(),
                patch: Patch::Remove,
            });
        }
        for (selector, rule) in new {
            mutation.guards.push(GuardEdit {
                kind,
                selector: selector.clone(),
                patch: Patch::Set(rule.clone()),
            });
        }
    }

    for (name, _) in &before.states {
        if after.substate(name).is_none() {
            mutation.states.push((name.clone(), SubstateEdit::Remove));
        }
    }
    for (name, new) in &after.states {
        match before.substate(name) {
            None => mutation
                .states
                .push((name.clone(), SubstateEdit::Add(new.clone()))),
            Some(old) if old.attributes != new.attributes => mutation
                .states
                .push((name.clone(), SubstateEdit::Add(new.clone()))),
            Some(old) => {
                let nested = diff_definitions(old, new);
                if !nested.is_empty() {
                    mutation.states.push((name.clone(), SubstateEdit::Mutate(nested)));
                }
            }
        }
    }

    for name in before.transitions.keys() {
        if !after.transitions.contains_key(name) {
            mutation.transitions.insert(name.clone(), Patch::Remove);
        }
    }
    for (name, transition) in &after.transitions {
        let unchanged = before
            .transitions
            .get(name)
            .is_some_and(|previous| previous.same_as(transition));
        if !unchanged {
            mutation
                .transitions
                .insert(name.clone(), Patch::Set(transition.clone()));
        }
    }

    mutation
}
