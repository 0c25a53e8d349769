//! Transition definitions: templates for the transition object created
//! when a change matches their origin and target selectors.

use crate::core::event::{Callback, EventType, Listener};
use crate::core::method::{same_method, Method};
use crate::runtime::{Runtime, TransitionToken};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Action run between the exit and enter walks of a transition.
///
/// The operation receives the transition's token and must eventually pass
/// it to [`Runtime::complete`], either before returning or later.
pub type Operation = Arc<dyn Fn(&mut Runtime, TransitionToken) + Send + Sync>;

/// Template for a transition.
///
/// # Example
///
/// ```rust
/// use protostate::builder::TransitionDefinition;
///
/// let slow = TransitionDefinition::new()
///     .origin("Idle")
///     .target("Busy")
///     .operation(|rt, token| {
///         // finish immediately; a real operation could hold the token
///         let _ = rt.complete(token);
///     });
/// assert_eq!(slow.origin_selector(), "Idle");
/// ```
#[derive(Clone)]
pub struct TransitionDefinition {
    pub(crate) origin: String,
    pub(crate) target: String,
    pub(crate) operation: Option<Operation>,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) events: BTreeMap<EventType, Vec<Listener>>,
}

impl TransitionDefinition {
    /// A definition matching every origin and target.
    pub fn new() -> Self {
        Self {
            origin: "**".to_string(),
            target: "**".to_string(),
            operation: None,
            methods: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    pub fn origin(mut self, selector: impl Into<String>) -> Self {
        self.origin = selector.into();
        self
    }

    pub fn target(mut self, selector: impl Into<String>) -> Self {
        self.target = selector.into();
        self
    }

    pub fn operation<F>(mut self, operation: F) -> Self
    where
        F: Fn(&mut Runtime, TransitionToken) + Send + Sync + 'static,
    {
        self.operation = Some(Arc::new(operation));
        self
    }

    /// Method available on the owner while this transition is in flight.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Runtime, &crate::core::Invocation) -> serde_json::Value + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn on<F>(self, kind: EventType, f: F) -> Self
    where
        F: Fn(&mut Runtime, &crate::core::Event) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(f);
        self.listener(kind, Listener::Callback(callback))
    }

    pub fn listener(mut self, kind: EventType, listener: Listener) -> Self {
        self.events.entry(kind).or_default().push(listener);
        self
    }

    pub fn origin_selector(&self) -> &str {
        &self.origin
    }

    pub fn target_selector(&self) -> &str {
        &self.target
    }

    pub fn has_operation(&self) -> bool {
        self.operation.is_some()
    }

    pub fn listeners(&self, kind: EventType) -> &[Listener] {
        self.events.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn method_named(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Identity comparison: closures compare by allocation.
    pub fn same_as(&self, other: &TransitionDefinition) -> bool {
        let same_operation = match (&self.operation, &other.operation) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        };
        let same_methods = self.methods.len() == other.methods.len()
            && self
                .methods
                .iter()
                .zip(&other.methods)
                .all(|((ka, a), (kb, b))| ka == kb && same_method(a, b));
        let same_events = self.events.len() == other.events.len()
            && self.events.iter().zip(&other.events).all(|((ka, a), (kb, b))| {
                ka == kb && a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            });

        self.origin == other.origin
            && self.target == other.target
            && same_operation
            && same_methods
            && same_events
    }
}

impl Default for TransitionDefinition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransitionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionDefinition")
            .field("origin", &self.origin)
            .field("target", &self.target)
            .field("operation", &self.operation.is_some())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}
