//! Builders for state and transition definitions.
//!
//! Definitions are plain values; nothing happens until one is attached to
//! an owner or added under an existing state.

pub mod definition;
pub mod error;
pub mod transition;

pub use definition::StateDefinition;
pub use error::DefinitionError;
pub use transition::{Operation, TransitionDefinition};
