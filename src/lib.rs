//! Protostate: hierarchical state machines that inherit.
//!
//! A state tree is attached to an owner under an accessor name. Owners form
//! a lineage, and an owner deriving from another sees the ancestor's tree
//! through its own controller: inherited states appear as lightweight
//! virtual nodes and become real the first time something local is written
//! to them. Behavior (methods, data, listeners, guards) resolves locally,
//! then along the lineage, then up the tree.
//!
//! # Core Concepts
//!
//! - **Definitions**: [`StateDefinition`] builds a tree declaratively and
//!   validates it with accumulated errors
//! - **Runtime**: [`Runtime`] owns every owner, controller and state and
//!   drives the transition protocol
//! - **Events**: construct, destroy, depart, exit, enter, arrive, mutate and
//!   noSuchMethod on states; start, end and abort on transitions
//! - **Mutation**: states can be expressed as definitions, diffed, and
//!   edited structurally, with history replay on `history` states
//!
//! # Example
//!
//! ```rust
//! use protostate::builder::StateDefinition;
//! use protostate::runtime::{AttachOptions, Runtime};
//! use serde_json::json;
//!
//! let mut rt = Runtime::new();
//! let base = rt.create_owner("lamp");
//! let def = StateDefinition::new()
//!     .state("Off", StateDefinition::new().initial().method("glow", |_, _| json!(0)))
//!     .state("On", StateDefinition::new().method("glow", |_, _| json!(100)));
//! rt.attach(base, "state", def, AttachOptions::default()).unwrap();
//!
//! // A derived owner inherits the tree without copying it.
//! let dimmer = rt.derive_owner(base, "dimmer").unwrap();
//! rt.go(dimmer, "state", "On").unwrap();
//!
//! assert_eq!(rt.invoke(dimmer, "glow", json!(null)).unwrap(), Some(json!(100)));
//! assert_eq!(rt.invoke(base, "glow", json!(null)).unwrap(), Some(json!(0)));
//! ```

pub mod builder;
pub mod core;
pub mod runtime;

// Re-export commonly used types
pub use builder::{DefinitionError, StateDefinition, TransitionDefinition};
pub use core::{Attributes, EventType, Guard, GuardKind, Listener, Mutation, Selector};
pub use runtime::{
    AttachOptions, ChangeOptions, ChangeOutcome, ControllerId, NodeId, OwnerId, Runtime, RuntimeError,
    Target,
};
