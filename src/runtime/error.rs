//! Runtime errors.
//!
//! These cover programming errors only: unknown handles, foreign targets,
//! malformed registrations. Expected outcomes such as a guard rejecting a
//! change are reported as values instead.

use crate::builder::DefinitionError;
use crate::core::event::UnknownEventType;
use crate::runtime::{ControllerId, NodeId, OwnerId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("Unknown owner {0:?}")]
    UnknownOwner(OwnerId),

    #[error("Unknown controller {0:?}")]
    UnknownController(ControllerId),

    #[error("Unknown or destroyed state {0:?}")]
    UnknownNode(NodeId),

    #[error("Owner '{owner}' has no state accessor '{accessor}'")]
    NoAccessor { owner: String, accessor: String },

    #[error("Owner '{owner}' already has a state accessor '{accessor}'")]
    AlreadyAttached { owner: String, accessor: String },

    #[error("Invalid transition target: {0}")]
    InvalidTarget(String),

    #[error("Abstract state '{0}' has no concrete substate")]
    NoConcreteSubstate(String),

    #[error(transparent)]
    UnknownEventType(#[from] UnknownEventType),

    #[error("State '{0}' is sealed")]
    Sealed(String),

    #[error("State '{0}' is not mutable")]
    NotMutable(String),

    #[error("Invalid state definition: {}", format_definition_errors(.0))]
    InvalidDefinition(Vec<DefinitionError>),
}

fn format_definition_errors(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
