//! Core value types of the state runtime.
//!
//! Everything here is independent of any particular tree:
//! - attribute bitsets and the selector grammar
//! - events, listeners and emitters
//! - guard rules and their evaluation
//! - the structural edit algebra behind mutation
//! - the history log and traversal planning
//!
//! These are pure values; the runtime owns the trees they are applied to.

pub mod attributes;
pub mod delta;
pub mod event;
pub mod guard;
pub mod history;
pub mod method;
pub mod selector;

pub use attributes::{Attributes, UnknownAttribute};
pub use delta::{Edit, Mutation, MutationNotice, Patch, SubstateEdit};
pub use event::{Callback, Emitter, Event, EventPayload, EventType, Listener, ListenerId, UnknownEventType};
pub use guard::{Guard, GuardContext, GuardKind, GuardMap, GuardRule};
pub use history::{DeltaRecord, HistoryEntry, ReplayPlan, ReplayStep, StateHistory, StateMarker};
pub use method::{method, Invocation, Method};
pub use selector::{Segment, Selector};
