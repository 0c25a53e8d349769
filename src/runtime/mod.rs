//! The state runtime.
//!
//! A [`Runtime`] owns every owner, controller and state node. Everything is
//! addressed by small `Copy` handles, and every operation is a method on the
//! runtime. Listeners, methods, guards and transition operations receive the
//! runtime itself, so they may query it or (except guards) start further
//! changes; the protocol is written to tolerate that re-entry.

mod arena;
mod content;
mod controller;
mod emit;
mod error;
mod history;
mod mutation;
mod node;
mod resolve;
mod transition;
mod tree;

pub use arena::NodeId;
pub use controller::AttachOptions;
pub use error::{Result, RuntimeError};
pub use transition::{ChangeCallback, ChangeOptions, ChangeOutcome, Target, TransitionInfo, TransitionToken};

use crate::core::method::Method;
use arena::Arena;
use controller::Controller;
use node::{Content, Node};
use std::collections::BTreeMap;
use std::fmt;

/// Handle to an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u32);

/// Handle to a controller, one per `(owner, accessor)` binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControllerId(u32);

impl ControllerId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }
}

/// A host of state trees.
pub(crate) struct Owner {
    pub(crate) name: String,
    pub(crate) ancestor: Option<OwnerId>,
    /// The owner's own methods, shadowed by stubs of the same name.
    pub(crate) methods: BTreeMap<String, Method>,
    /// Method name to the accessor whose controller dispatches it.
    pub(crate) stubs: BTreeMap<String, String>,
    pub(crate) controllers: BTreeMap<String, ControllerId>,
}

/// Owns all state trees and drives their controllers.
///
/// # Example
///
/// ```rust
/// use protostate::builder::StateDefinition;
/// use protostate::runtime::{AttachOptions, ChangeOptions, ChangeOutcome, Runtime};
///
/// let mut rt = Runtime::new();
/// let door = rt.create_owner("door");
/// let def = StateDefinition::new()
///     .state("Closed", StateDefinition::new().initial())
///     .state("Open", StateDefinition::new());
///
/// let ctl = rt.attach(door, "state", def, AttachOptions::default()).unwrap();
/// let outcome = rt.change(ctl, "Open", ChangeOptions::default()).unwrap();
///
/// assert_eq!(outcome, ChangeOutcome::Completed);
/// let current = rt.state(door, "state").unwrap();
/// assert_eq!(rt.qualified_name(current).unwrap(), "Open");
/// ```
#[derive(Default)]
pub struct Runtime {
    owners: Vec<Owner>,
    controllers: Vec<Option<Controller>>,
    nodes: Arena,
    /// Nesting depth of operations that suppress `mutate` notifications.
    quiet: u32,
    /// Nesting depth of history replay; nothing is recorded while set.
    replaying: u32,
}

impl Runtime {
    /// An empty runtime with no owners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an owner with no ancestor.
    pub fn create_owner(&mut self, name: impl Into<String>) -> OwnerId {
        self.push_owner(name.into(), None)
    }

    /// Create an owner inheriting from `ancestor`.
    pub fn derive_owner(&mut self, ancestor: OwnerId, name: impl Into<String>) -> Result<OwnerId> {
        self.owner(ancestor)?;
        Ok(self.push_owner(name.into(), Some(ancestor)))
    }

    fn push_owner(&mut self, name: String, ancestor: Option<OwnerId>) -> OwnerId {
        let id = OwnerId(self.owners.len() as u32);
        self.owners.push(Owner {
            name,
            ancestor,
            methods: BTreeMap::new(),
            stubs: BTreeMap::new(),
            controllers: BTreeMap::new(),
        });
        id
    }

    /// Name given at creation.
    pub fn owner_name(&self, owner: OwnerId) -> Result<&str> {
        Ok(&self.owner(owner)?.name)
    }

    /// The owner this one derives from.
    pub fn ancestor(&self, owner: OwnerId) -> Result<Option<OwnerId>> {
        Ok(self.owner(owner)?.ancestor)
    }

    /// Ancestors of `owner`, nearest first.
    pub fn lineage(&self, owner: OwnerId) -> Result<Vec<OwnerId>> {
        let mut lineage = Vec::new();
        let mut cursor = self.owner(owner)?.ancestor;
        while let Some(id) = cursor {
            lineage.push(id);
            cursor = self.owner(id)?.ancestor;
        }
        Ok(lineage)
    }

    /// Give the owner a method of its own. Returns the replaced method.
    pub fn set_owner_method(&mut self, owner: OwnerId, name: impl Into<String>, method: Method) -> Result<Option<Method>> {
        Ok(self.owner_mut(owner)?.methods.insert(name.into(), method))
    }

    /// The owner's own method, ignoring stubs and lineage.
    pub fn owner_method(&self, owner: OwnerId, name: &str) -> Result<Option<Method>> {
        Ok(self.owner(owner)?.methods.get(name).cloned())
    }

    /// The accessor whose controller handles `name` on this owner, if a
    /// dispatch stub is installed.
    pub fn stub(&self, owner: OwnerId, name: &str) -> Result<Option<&str>> {
        Ok(self.owner(owner)?.stubs.get(name).map(String::as_str))
    }

    pub(crate) fn owner(&self, id: OwnerId) -> Result<&Owner> {
        self.owners
            .get(id.0 as usize)
            .ok_or(RuntimeError::UnknownOwner(id))
    }

    pub(crate) fn owner_mut(&mut self, id: OwnerId) -> Result<&mut Owner> {
        self.owners
            .get_mut(id.0 as usize)
            .ok_or(RuntimeError::UnknownOwner(id))
    }

    pub(crate) fn ctl(&self, id: ControllerId) -> Result<&Controller> {
        self.controllers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(RuntimeError::UnknownController(id))
    }

    pub(crate) fn ctl_mut(&mut self, id: ControllerId) -> Result<&mut Controller> {
        self.controllers
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(RuntimeError::UnknownController(id))
    }

    pub(crate) fn next_controller_id(&self) -> ControllerId {
        ControllerId(self.controllers.len() as u32)
    }

    /// The live handle for `id`, following realization forwards.
    pub(crate) fn live(&self, id: NodeId) -> Result<NodeId> {
        self.nodes.resolve(id).ok_or(RuntimeError::UnknownNode(id))
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or(RuntimeError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(RuntimeError::UnknownNode(id))
    }

    pub(crate) fn content(&self, id: NodeId) -> Result<Option<&Content>> {
        Ok(self.node(id)?.content.as_deref())
    }

    /// Content of a node already known to be real.
    pub(crate) fn content_mut(&mut self, id: NodeId) -> Result<&mut Content> {
        self.node_mut(id)?
            .content
            .as_deref_mut()
            .ok_or(RuntimeError::UnknownNode(id))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("owners", &self.owners.len())
            .field(
                "controllers",
                &self.controllers.iter().filter(|c| c.is_some()).count(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_walks_outward() {
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        let mid = rt.derive_owner(base, "mid").unwrap();
        let leaf = rt.derive_owner(mid, "leaf").unwrap();

        assert_eq!(rt.lineage(leaf).unwrap(), vec![mid, base]);
        assert_eq!(rt.ancestor(base).unwrap(), None);
        assert_eq!(rt.owner_name(leaf).unwrap(), "leaf");
    }

    #[test]
    fn unknown_handles_are_errors() {
        let mut rt = Runtime::new();
        let ghost = OwnerId(7);
        assert_eq!(rt.lineage(ghost), Err(RuntimeError::UnknownOwner(ghost)));
        assert!(rt.derive_owner(ghost, "x").is_err());
        assert!(rt.ctl(ControllerId::new(0)).is_err());
    }

    #[test]
    fn owner_methods_are_stored() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let m = crate::core::method(|_, _| serde_json::json!(1));
        assert!(rt.set_owner_method(owner, "m", m).unwrap().is_none());
        assert!(rt.owner_method(owner, "m").unwrap().is_some());
        assert_eq!(rt.stub(owner, "m").unwrap(), None);
    }
}
