//! Normalized state definitions.
//!
//! A [`StateDefinition`] is the categorized form of a state: attributes,
//! data, methods, events, guards, substates and transitions. It is what
//! [`Runtime::attach`] builds trees from and what [`Runtime::express`]
//! returns.
//!
//! [`Runtime::attach`]: crate::runtime::Runtime::attach
//! [`Runtime::express`]: crate::runtime::Runtime::express

use crate::builder::error::{is_valid_name, DefinitionError};
use crate::builder::transition::TransitionDefinition;
use crate::core::attributes::Attributes;
use crate::core::delta::{diff_definitions, Mutation};
use crate::core::event::{Event, EventType, Listener};
use crate::core::guard::{GuardKind, GuardMap, GuardRule};
use crate::core::method::{Invocation, Method};
use crate::runtime::Runtime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use stillwater::validation::Validation;
use stillwater::NonEmptyVec;

/// Fluent definition of a state and its subtree.
///
/// # Example
///
/// ```rust
/// use protostate::builder::StateDefinition;
/// use serde_json::json;
///
/// let def = StateDefinition::new()
///     .data("retries", 3)
///     .state("Idle", StateDefinition::new().initial())
///     .state(
///         "Busy",
///         StateDefinition::new().method("status", |_, _| json!("busy")),
///     );
///
/// assert!(def.validate().is_success());
/// assert_eq!(def.substate_names(), vec!["Idle", "Busy"]);
/// ```
#[derive(Clone, Default)]
pub struct StateDefinition {
    pub(crate) attributes: Attributes,
    pub(crate) data: Map<String, Value>,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) events: BTreeMap<EventType, Vec<Listener>>,
    pub(crate) guards: GuardMap,
    pub(crate) states: Vec<(String, StateDefinition)>,
    pub(crate) transitions: BTreeMap<String, TransitionDefinition>,
}

impl StateDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add attribute bits.
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.insert(attributes);
        self
    }

    pub fn initial(self) -> Self {
        self.attributes(Attributes::INITIAL)
    }

    pub fn mutable(self) -> Self {
        self.attributes(Attributes::MUTABLE)
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Runtime, &Invocation) -> Value + Send + Sync + 'static,
    {
        self.method_arc(name, Arc::new(f))
    }

    pub fn method_arc(mut self, name: impl Into<String>, method: Method) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    pub fn on<F>(self, kind: EventType, f: F) -> Self
    where
        F: Fn(&mut Runtime, &Event) + Send + Sync + 'static,
    {
        self.listener(kind, Listener::callback(f))
    }

    /// Change to `selector` whenever `kind` is emitted on this state.
    pub fn redirect(self, kind: EventType, selector: impl Into<String>) -> Self {
        self.listener(kind, Listener::redirect(selector))
    }

    pub fn listener(mut self, kind: EventType, listener: Listener) -> Self {
        self.events.entry(kind).or_default().push(listener);
        self
    }

    pub fn admit(mut self, selector: &str, rule: impl Into<GuardRule>) -> Self {
        self.guards.set(GuardKind::Admit, selector, rule.into());
        self
    }

    pub fn release(mut self, selector: &str, rule: impl Into<GuardRule>) -> Self {
        self.guards.set(GuardKind::Release, selector, rule.into());
        self
    }

    /// Append a substate. Substate order is significant: it decides the
    /// fallback when an abstract state has no default substate.
    pub fn state(mut self, name: impl Into<String>, definition: StateDefinition) -> Self {
        self.states.push((name.into(), definition));
        self
    }

    pub fn transition(mut self, name: impl Into<String>, definition: TransitionDefinition) -> Self {
        self.transitions.insert(name.into(), definition);
        self
    }

    pub fn attribute_set(&self) -> Attributes {
        self.attributes
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    pub fn listeners(&self, kind: EventType) -> &[Listener] {
        self.events.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn guards(&self) -> &GuardMap {
        &self.guards
    }

    pub fn substate(&self, name: &str) -> Option<&StateDefinition> {
        self.states
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, def)| def)
    }

    pub fn substates(&self) -> impl Iterator<Item = (&str, &StateDefinition)> {
        self.states.iter().map(|(n, def)| (n.as_str(), def))
    }

    pub fn substate_names(&self) -> Vec<&str> {
        self.states.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn transition_definition(&self, name: &str) -> Option<&TransitionDefinition> {
        self.transitions.get(name)
    }

    /// Mutation turning `before` into `after`.
    pub fn diff(before: &StateDefinition, after: &StateDefinition) -> Mutation {
        diff_definitions(before, after)
    }

    /// Validate the whole subtree, accumulating every problem found.
    pub fn validate(&self) -> Validation<(), NonEmptyVec<DefinitionError>> {
        self.validate_at("")
    }

    fn validate_at(&self, path: &str) -> Validation<(), NonEmptyVec<DefinitionError>> {
        let mut checks: Vec<Validation<(), NonEmptyVec<DefinitionError>>> =
            vec![Validation::success(())];

        if self.attributes.contains(Attributes::VIRTUAL) {
            checks.push(Validation::fail(DefinitionError::ReservedAttribute {
                path: path.to_string(),
                attribute: "virtual".to_string(),
            }));
        }

        let mut seen: Vec<&str> = Vec::new();
        for (name, _) in &self.states {
            if !is_valid_name(name) {
                checks.push(Validation::fail(DefinitionError::InvalidName {
                    parent: path.to_string(),
                    name: name.clone(),
                }));
            } else if seen.contains(&name.as_str()) {
                checks.push(Validation::fail(DefinitionError::DuplicateSubstate {
                    parent: path.to_string(),
                    name: name.clone(),
                }));
            }
            seen.push(name);
        }

        let flagged = |flag: Attributes| -> Vec<String> {
            self.states
                .iter()
                .filter(|(_, def)| def.attributes.contains(flag))
                .map(|(name, _)| name.clone())
                .collect()
        };
        let initial = flagged(Attributes::INITIAL);
        if initial.len() > 1 {
            checks.push(Validation::fail(DefinitionError::MultipleInitial {
                parent: path.to_string(),
                names: initial,
            }));
        }
        let default = flagged(Attributes::DEFAULT);
        if default.len() > 1 {
            checks.push(Validation::fail(DefinitionError::MultipleDefault {
                parent: path.to_string(),
                names: default,
            }));
        }

        for (name, def) in &self.states {
            let child = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}.{name}")
            };
            checks.push(def.validate_at(&child));
        }

        Validation::all_vec(checks).map(|_| ())
    }
}

/// Two definitions are equal when their diff is empty. Functions compare
/// by identity, and substate order is not significant.
impl PartialEq for StateDefinition {
    fn eq(&self, other: &Self) -> bool {
        diff_definitions(self, other).is_empty()
    }
}

impl fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDefinition")
            .field("attributes", &self.attributes)
            .field("data", &self.data)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("guards", &self.guards)
            .field("states", &self.states)
            .field("transitions", &self.transitions)
            .finish()
    }
}
