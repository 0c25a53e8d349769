//! Event types, listeners and per-node emitters.
//!
//! Each `(node, event type)` pair owns an [`Emitter`]: an ordered multiset of
//! listeners. A listener is either a callback or a redirect, a bare selector
//! meaning "once the callbacks of this emission have run, change there".

use crate::core::delta::MutationNotice;
use crate::runtime::{ControllerId, NodeId, Runtime, TransitionInfo};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Built-in event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Construct,
    Destroy,
    Depart,
    Exit,
    Enter,
    Arrive,
    Mutate,
    NoSuchMethod,
    /// Emitted on a transition before its operation runs.
    Start,
    /// Emitted on a transition once its operation has completed.
    End,
    /// Emitted on a transition that was superseded.
    Abort,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        Self::Construct,
        Self::Destroy,
        Self::Depart,
        Self::Exit,
        Self::Enter,
        Self::Arrive,
        Self::Mutate,
        Self::NoSuchMethod,
        Self::Start,
        Self::End,
        Self::Abort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Construct => "construct",
            Self::Destroy => "destroy",
            Self::Depart => "depart",
            Self::Exit => "exit",
            Self::Enter => "enter",
            Self::Arrive => "arrive",
            Self::Mutate => "mutate",
            Self::NoSuchMethod => "noSuchMethod",
            Self::Start => "start",
            Self::End => "end",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration was attempted for an event type the runtime does not know.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown event type '{0}'")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Data carried by an emitted event.
#[derive(Clone, Debug)]
pub enum EventPayload {
    None,
    /// Arguments passed to [`Runtime::emit`](crate::runtime::Runtime::emit).
    Args(Value),
    Mutation(Arc<MutationNotice>),
    MissingMethod { name: String, args: Value },
}

/// An event as seen by a listener.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventType,
    /// The state the event was emitted on. Inherited listeners see the
    /// descendant's state here, not their own.
    pub node: NodeId,
    pub controller: ControllerId,
    /// The transition in progress, for protocol events.
    pub transition: Option<TransitionInfo>,
    pub payload: EventPayload,
}

/// Callback listener type.
pub type Callback = Arc<dyn Fn(&mut Runtime, &Event) + Send + Sync>;

/// A registered listener.
#[derive(Clone)]
pub enum Listener {
    Callback(Callback),
    /// Change to this selector, resolved from the emitting state, after the
    /// emission's callbacks have run.
    Redirect(String),
}

impl Listener {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut Runtime, &Event) + Send + Sync + 'static,
    {
        Listener::Callback(Arc::new(f))
    }

    pub fn redirect(selector: impl Into<String>) -> Self {
        Listener::Redirect(selector.into())
    }

    /// Identity comparison: callbacks are equal only if they are the same
    /// allocation.
    pub fn same_as(&self, other: &Listener) -> bool {
        match (self, other) {
            (Listener::Callback(a), Listener::Callback(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Listener::Redirect(a), Listener::Redirect(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Callback(_) => f.write_str("Listener::Callback(..)"),
            Listener::Redirect(sel) => write!(f, "Listener::Redirect({sel:?})"),
        }
    }
}

/// Key returned on registration, used to remove a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listeners for one event type on one node.
#[derive(Clone, Debug, Default)]
pub struct Emitter {
    listeners: Vec<(ListenerId, Listener)>,
    next_key: u64,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_key);
        self.next_key += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> Option<Listener> {
        let index = self.listeners.iter().position(|(key, _)| *key == id)?;
        Some(self.listeners.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listeners in registration order.
    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter().map(|(_, listener)| listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_str() {
        for kind in EventType::ALL {
            assert_eq!(kind.as_str().parse::<EventType>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "entered".parse::<EventType>().unwrap_err();
        assert_eq!(err, UnknownEventType("entered".to_string()));
    }

    #[test]
    fn emitter_preserves_registration_order() {
        let mut emitter = Emitter::new();
        emitter.add(Listener::redirect("A"));
        emitter.add(Listener::redirect("B"));
        emitter.add(Listener::redirect("A"));

        let order: Vec<String> = emitter
            .listeners()
            .map(|l| match l {
                Listener::Redirect(sel) => sel.clone(),
                Listener::Callback(_) => String::new(),
            })
            .collect();
        assert_eq!(order, vec!["A", "B", "A"]);
    }

    #[test]
    fn emitter_removes_by_key() {
        let mut emitter = Emitter::new();
        let first = emitter.add(Listener::redirect("A"));
        let second = emitter.add(Listener::callback(|_, _| {}));

        assert!(emitter.remove(first).is_some());
        assert!(emitter.remove(first).is_none());
        assert_eq!(emitter.len(), 1);
        assert!(emitter.remove(second).is_some());
        assert!(emitter.is_empty());
    }

    #[test]
    fn listener_identity() {
        let a = Listener::callback(|_, _| {});
        let b = a.clone();
        let c = Listener::callback(|_, _| {});
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert!(Listener::redirect("X").same_as(&Listener::redirect("X")));
    }
}
