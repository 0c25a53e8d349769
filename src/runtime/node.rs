//! State node records.

use crate::builder::{StateDefinition, TransitionDefinition};
use crate::core::attributes::Attributes;
use crate::core::event::{Emitter, EventType};
use crate::core::guard::GuardMap;
use crate::core::history::StateHistory;
use crate::core::method::Method;
use crate::runtime::{ControllerId, NodeId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One state in a controller's tree. A node without content is virtual.
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) controller: ControllerId,
    pub(crate) superstate: Option<NodeId>,
    pub(crate) attributes: Attributes,
    pub(crate) content: Option<Box<Content>>,
}

/// Local content of a real node.
#[derive(Default)]
pub(crate) struct Content {
    pub(crate) data: Map<String, Value>,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) events: BTreeMap<EventType, Emitter>,
    pub(crate) guards: GuardMap,
    pub(crate) substates: Vec<NodeId>,
    pub(crate) transitions: BTreeMap<String, TransitionDefinition>,
    /// Path below this node of the state last exited from, for `retained`.
    pub(crate) retained: Option<Vec<String>>,
    pub(crate) history: Option<StateHistory>,
}

impl Content {
    /// Content of a definition, without substates.
    pub(crate) fn from_definition(definition: &StateDefinition) -> Self {
        let events = definition
            .events
            .iter()
            .map(|(kind, listeners)| {
                let mut emitter = Emitter::new();
                for listener in listeners {
                    emitter.add(listener.clone());
                }
                (*kind, emitter)
            })
            .collect();

        Self {
            data: definition.data.clone(),
            methods: definition.methods.clone(),
            events,
            guards: definition.guards.clone(),
            substates: Vec::new(),
            transitions: definition.transitions.clone(),
            retained: None,
            history: None,
        }
    }
}

impl Node {
    pub(crate) fn real(
        name: String,
        controller: ControllerId,
        superstate: Option<NodeId>,
        attributes: Attributes,
        content: Content,
    ) -> Self {
        Self {
            name,
            controller,
            superstate,
            attributes: attributes.difference(Attributes::VIRTUAL),
            content: Some(Box::new(content)),
        }
    }

    pub(crate) fn virtual_node(
        name: String,
        controller: ControllerId,
        superstate: Option<NodeId>,
        attributes: Attributes,
    ) -> Self {
        Self {
            name,
            controller,
            superstate,
            attributes: attributes | Attributes::VIRTUAL,
            content: None,
        }
    }

    pub(crate) fn is_virtual(&self) -> bool {
        self.content.is_none()
    }
}
