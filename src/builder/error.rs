//! Definition errors reported by [`StateDefinition::validate`].
//!
//! [`StateDefinition::validate`]: crate::builder::StateDefinition::validate

use thiserror::Error;

/// Problems found in a state definition. Validation reports every problem
/// at once rather than stopping at the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Invalid state name '{name}' under '{parent}'")]
    InvalidName { parent: String, name: String },

    #[error("Substate '{name}' is defined more than once under '{parent}'")]
    DuplicateSubstate { parent: String, name: String },

    #[error("State '{parent}' has more than one initial substate: {names:?}")]
    MultipleInitial { parent: String, names: Vec<String> },

    #[error("State '{parent}' has more than one default substate: {names:?}")]
    MultipleDefault { parent: String, names: Vec<String> },

    #[error("Attribute '{attribute}' on '{path}' is reserved for the runtime")]
    ReservedAttribute { path: String, attribute: String },
}

/// Check a single state name. Names may not be empty, contain the path
/// separator, or be a wildcard.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && name != "*" && name != "**"
}
