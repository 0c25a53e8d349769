//! Controllers: the binding of one state tree to one owner accessor.

use crate::builder::StateDefinition;
use crate::core::attributes::Attributes;
use crate::core::event::{EventPayload, EventType};
use crate::core::method::{Invocation, Method};
use crate::runtime::node::{Content, Node};
use crate::runtime::transition::TransitionRecord;
use crate::runtime::{ChangeOptions, ChangeOutcome, ControllerId, NodeId, OwnerId, Result, RuntimeError, Runtime, Target};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use stillwater::validation::Validation;
use tracing::{debug, warn};

/// What a controller is currently in.
pub(crate) enum Current {
    State(NodeId),
    Transition(Box<TransitionRecord>),
}

pub(crate) struct Controller {
    pub(crate) owner: OwnerId,
    /// Accessor name on the owner.
    pub(crate) name: String,
    pub(crate) root: NodeId,
    pub(crate) current: Current,
    /// Substates of the root by name.
    pub(crate) aliases: BTreeMap<String, NodeId>,
    /// Virtual nodes by path.
    pub(crate) virtuals: BTreeMap<Vec<String>, NodeId>,
    /// Owner methods moved into the root, restored on release.
    pub(crate) relocated: BTreeMap<String, Method>,
    /// Stubs this controller installed on the owner.
    pub(crate) stubs: BTreeSet<String>,
    /// Bumped by every change that gets past its checks.
    pub(crate) serial: u64,
    pub(crate) last_completed: Option<u64>,
}

/// Options for [`Runtime::attach`].
#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    /// Selector of the initial state. Without it the controller starts at
    /// the deepest chain of `initial` substates.
    pub initial_state: Option<String>,
}

impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_state(mut self, selector: impl Into<String>) -> Self {
        self.initial_state = Some(selector.into());
        self
    }
}

/// Every method name defined anywhere in a definition's subtree.
pub(crate) fn method_names(definition: &StateDefinition) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = definition.methods.keys().cloned().collect();
    for (_, child) in &definition.states {
        names.extend(method_names(child));
    }
    names
}

impl Runtime {
    /// Bind a state tree built from `definition` to `owner` under `name`.
    pub fn attach(
        &mut self,
        owner: OwnerId,
        name: &str,
        definition: StateDefinition,
        options: AttachOptions,
    ) -> Result<ControllerId> {
        let owner_name = self.owner(owner)?.name.clone();
        if self.owner(owner)?.controllers.contains_key(name) {
            return Err(RuntimeError::AlreadyAttached {
                owner: owner_name,
                accessor: name.to_string(),
            });
        }
        if let Validation::Failure(errors) = definition.validate() {
            return Err(RuntimeError::InvalidDefinition(errors.iter().cloned().collect()));
        }

        let id = self.next_controller_id();
        self.quiet += 1;
        let root = self.build_tree(id, None, "", &definition);
        self.quiet -= 1;
        self.register(owner, name, id, root)?;

        for method in method_names(&definition) {
            self.install_stub(id, &method)?;
        }

        let initial = match self.initial_state(id, options.initial_state.as_deref()) {
            Ok(initial) => initial,
            Err(err) => {
                self.release(id)?;
                return Err(err);
            }
        };
        self.ctl_mut(id)?.current = Current::State(initial);
        self.record_markers(initial)?;

        let nodes = self.subtree(root)?;
        self.emit_construct(&nodes)?;
        debug!(owner = %owner_name, accessor = name, initial = %self.qualified_name(initial)?, "attached state tree");
        Ok(id)
    }

    fn register(&mut self, owner: OwnerId, name: &str, id: ControllerId, root: NodeId) -> Result<()> {
        let controller = Controller {
            owner,
            name: name.to_string(),
            root,
            current: Current::State(root),
            aliases: BTreeMap::new(),
            virtuals: BTreeMap::new(),
            relocated: BTreeMap::new(),
            stubs: BTreeSet::new(),
            serial: 0,
            last_completed: None,
        };
        self.controllers.push(Some(controller));
        let children: Vec<(String, NodeId)> = self
            .substates(root)?
            .into_iter()
            .map(|child| Ok((self.name(child)?.to_string(), child)))
            .collect::<Result<_>>()?;
        self.ctl_mut(id)?.aliases.extend(children);
        self.owner_mut(owner)?.controllers.insert(name.to_string(), id);
        Ok(())
    }

    /// The state a controller starts in.
    fn initial_state(&mut self, controller: ControllerId, selector: Option<&str>) -> Result<NodeId> {
        let root = self.ctl(controller)?.root;
        let start = match selector {
            Some(selector) => self
                .query(root, selector)?
                .ok_or_else(|| RuntimeError::InvalidTarget(selector.to_string()))?,
            None => {
                let mut path: Vec<String> = Vec::new();
                loop {
                    let mut next = None;
                    for name in self.names_below(controller, &path)? {
                        let mut child = path.clone();
                        child.push(name);
                        if self
                            .peek_attributes(controller, &child)?
                            .is_some_and(|a| a.contains(Attributes::INITIAL))
                        {
                            next = Some(child);
                            break;
                        }
                    }
                    match next {
                        Some(child) => path = child,
                        None => break,
                    }
                }
                self.resolve_path(controller, &path)?.unwrap_or(root)
            }
        };
        self.concrete(start)
    }

    /// The controller bound to `owner` under `name`. An owner inheriting
    /// from one that has such a controller gets its own, created on first
    /// access with an empty tree that resolves through the ancestor's.
    pub fn accessor(&mut self, owner: OwnerId, name: &str) -> Result<ControllerId> {
        if let Some(&id) = self.owner(owner)?.controllers.get(name) {
            return Ok(id);
        }
        let mut inherited = None;
        for ancestor in self.lineage(owner)? {
            if let Some(&id) = self.owner(ancestor)?.controllers.get(name) {
                inherited = Some(id);
                break;
            }
        }
        let Some(ancestor) = inherited else {
            return Err(RuntimeError::NoAccessor {
                owner: self.owner(owner)?.name.clone(),
                accessor: name.to_string(),
            });
        };

        let ancestor_state = match &self.ctl(ancestor)?.current {
            Current::State(state) => *state,
            Current::Transition(record) => record.origin,
        };
        let start_path = self.path(ancestor_state)?;
        let attributes = self.node(self.ctl(ancestor)?.root)?.attributes;

        let id = self.next_controller_id();
        let root = self.nodes.insert(Node::real(
            String::new(),
            id,
            None,
            attributes,
            Content::default(),
        ));
        self.register(owner, name, id, root)?;
        let initial = self.resolve_path(id, &start_path)?.unwrap_or(root);
        self.ctl_mut(id)?.current = Current::State(initial);
        debug!(
            owner = %self.owner(owner)?.name,
            accessor = name,
            initial = %self.qualified_name(initial)?,
            "created inheriting controller"
        );
        Ok(id)
    }

    /// Existing controller, without creating one.
    pub fn controller(&self, owner: OwnerId, name: &str) -> Result<Option<ControllerId>> {
        Ok(self.owner(owner)?.controllers.get(name).copied())
    }

    /// The current state of the owner's accessor. While a transition is in
    /// flight this is the state the transition is attached to.
    pub fn state(&mut self, owner: OwnerId, name: &str) -> Result<NodeId> {
        let controller = self.accessor(owner, name)?;
        self.current_state(controller)
    }

    /// Change the owner's accessor to `selector`.
    pub fn go(&mut self, owner: OwnerId, name: &str, selector: &str) -> Result<ChangeOutcome> {
        let controller = self.accessor(owner, name)?;
        self.change(controller, Target::from(selector), ChangeOptions::default())
    }

    /// Current state (pure). While changing, the node the transition is
    /// attached to.
    pub fn current_state(&self, controller: ControllerId) -> Result<NodeId> {
        Ok(match &self.ctl(controller)?.current {
            Current::State(state) => *state,
            Current::Transition(record) => record.attachment,
        })
    }

    /// True while a transition is in flight.
    pub fn is_changing(&self, controller: ControllerId) -> Result<bool> {
        Ok(matches!(self.ctl(controller)?.current, Current::Transition(_)))
    }

    /// Root state of the controller's tree.
    pub fn controller_root(&self, controller: ControllerId) -> Result<NodeId> {
        Ok(self.ctl(controller)?.root)
    }

    pub fn controller_owner(&self, controller: ControllerId) -> Result<OwnerId> {
        Ok(self.ctl(controller)?.owner)
    }

    /// Accessor name the controller is bound under.
    pub fn controller_name(&self, controller: ControllerId) -> Result<&str> {
        Ok(&self.ctl(controller)?.name)
    }

    /// A substate of the root by name.
    pub fn alias(&self, controller: ControllerId, name: &str) -> Result<Option<NodeId>> {
        Ok(self.ctl(controller)?.aliases.get(name).copied())
    }

    /// Make `name` on the owner dispatch through this controller, moving
    /// an existing owner implementation into the root.
    pub(crate) fn install_stub(&mut self, controller: ControllerId, name: &str) -> Result<()> {
        let (owner, accessor, root) = {
            let ctl = self.ctl(controller)?;
            (ctl.owner, ctl.name.clone(), ctl.root)
        };
        if self.owner(owner)?.stubs.contains_key(name) {
            return Ok(());
        }

        if let Some(own) = self.owner_mut(owner)?.methods.remove(name) {
            let root_content = self.content_mut(root)?;
            if !root_content.methods.contains_key(name) {
                root_content.methods.insert(name.to_string(), own.clone());
            }
            self.ctl_mut(controller)?.relocated.insert(name.to_string(), own);
        }
        self.owner_mut(owner)?.stubs.insert(name.to_string(), accessor);
        self.ctl_mut(controller)?.stubs.insert(name.to_string());
        Ok(())
    }

    /// Tear down a controller: emit `destroy` bottom-up, remove its stubs,
    /// restore relocated owner methods and free every node.
    pub fn release(&mut self, controller: ControllerId) -> Result<()> {
        let root = self.ctl(controller)?.root;
        let nodes = self.subtree(root)?;
        for &node in nodes.iter().rev() {
            if self.nodes.resolve(node).is_some() {
                self.emit_on(node, EventType::Destroy, EventPayload::None, false)?;
            }
        }

        let ctl = self
            .controllers
            .get_mut(controller.0 as usize)
            .and_then(Option::take)
            .ok_or(RuntimeError::UnknownController(controller))?;
        let owner = self.owner_mut(ctl.owner)?;
        for name in &ctl.stubs {
            if owner.stubs.get(name) == Some(&ctl.name) {
                owner.stubs.remove(name);
            }
        }
        for (name, method) in &ctl.relocated {
            owner.methods.insert(name.clone(), method.clone());
        }
        owner.controllers.remove(&ctl.name);

        for &node in ctl.virtuals.values() {
            self.nodes.remove(node);
        }
        for node in self.subtree(root)? {
            self.nodes.remove(node);
        }
        debug!(accessor = %ctl.name, "released controller");
        Ok(())
    }

    /// Call `name` through the controller: transition methods first while
    /// changing, then the current state's resolution. A miss emits
    /// `noSuchMethod` and returns `None`.
    pub fn dispatch(&mut self, controller: ControllerId, name: &str, args: Value) -> Result<Option<Value>> {
        let (owner, state, transition_method) = {
            let ctl = self.ctl(controller)?;
            match &ctl.current {
                Current::State(state) => (ctl.owner, *state, None),
                Current::Transition(record) => (
                    ctl.owner,
                    record.attachment,
                    record
                        .definition
                        .as_ref()
                        .and_then(|d| d.method_named(name))
                        .cloned(),
                ),
            }
        };

        let (holder, method) = match transition_method {
            Some(method) => (None, Some(method)),
            None => match self.resolve_method(state, name)? {
                Some((holder, method)) => (Some(holder), Some(method)),
                None => (None, None),
            },
        };

        let Some(method) = method else {
            warn!(method = name, state = %self.qualified_name(state)?, "no such method");
            self.emit_on(
                state,
                EventType::NoSuchMethod,
                EventPayload::MissingMethod {
                    name: name.to_string(),
                    args,
                },
                true,
            )?;
            return Ok(None);
        };

        let invocation = Invocation {
            owner,
            controller: Some(controller),
            state: Some(state),
            holder,
            args,
        };
        Ok(Some(method(self, &invocation)))
    }

    /// Call `name` on an owner: its stubs, then its own methods, then the
    /// same along its lineage. A stub found on an ancestor still dispatches
    /// through the receiving owner's own controller.
    pub fn invoke(&mut self, owner: OwnerId, name: &str, args: Value) -> Result<Option<Value>> {
        let mut cursor = Some(owner);
        while let Some(id) = cursor {
            let record = self.owner(id)?;
            if let Some(accessor) = record.stubs.get(name).cloned() {
                let controller = self.accessor(owner, &accessor)?;
                return self.dispatch(controller, name, args);
            }
            if let Some(method) = record.methods.get(name).cloned() {
                let invocation = Invocation {
                    owner,
                    controller: None,
                    state: None,
                    holder: None,
                    args,
                };
                return Ok(Some(method(self, &invocation)));
            }
            cursor = record.ancestor;
        }
        warn!(method = name, owner = %self.owner(owner)?.name, "no such method");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::method;
    use serde_json::json;

    fn def() -> StateDefinition {
        StateDefinition::new()
            .method("greet", |_, _| json!("root"))
            .state(
                "A",
                StateDefinition::new()
                    .initial()
                    .method("greet", |_, _| json!("A")),
            )
            .state("B", StateDefinition::new())
    }

    #[test]
    fn attach_starts_at_initial_chain() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def(), AttachOptions::default()).unwrap();
        let current = rt.state(owner, "state").unwrap();
        assert_eq!(rt.qualified_name(current).unwrap(), "A");
    }

    #[test]
    fn initial_state_option_wins() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def(), AttachOptions::new().initial_state("B"))
            .unwrap();
        let current = rt.state(owner, "state").unwrap();
        assert_eq!(rt.qualified_name(current).unwrap(), "B");
    }

    #[test]
    fn attaching_twice_is_an_error() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def(), AttachOptions::default()).unwrap();
        let err = rt
            .attach(owner, "state", def(), AttachOptions::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyAttached { .. }));
    }

    #[test]
    fn bad_initial_selector_leaves_nothing_attached() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let err = rt
            .attach(owner, "state", def(), AttachOptions::new().initial_state("Nope"))
            .unwrap_err();
        assert_eq!(err, RuntimeError::InvalidTarget("Nope".to_string()));
        assert_eq!(rt.controller(owner, "state").unwrap(), None);
        assert_eq!(rt.stub(owner, "greet").unwrap(), None);
    }

    #[test]
    fn invoke_dispatches_through_current_state() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def(), AttachOptions::default()).unwrap();

        assert_eq!(rt.invoke(owner, "greet", json!(null)).unwrap(), Some(json!("A")));
        rt.go(owner, "state", "B").unwrap();
        assert_eq!(rt.invoke(owner, "greet", json!(null)).unwrap(), Some(json!("root")));
    }

    #[test]
    fn owner_method_is_relocated_and_restored() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.set_owner_method(owner, "own", method(|_, _| json!("own")))
            .unwrap();
        let def = StateDefinition::new().state(
            "A",
            StateDefinition::new()
                .initial()
                .method("own", |_, _| json!("state")),
        );
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();

        assert_eq!(rt.stub(owner, "own").unwrap(), Some("state"));
        assert!(rt.owner_method(owner, "own").unwrap().is_none());
        assert_eq!(rt.invoke(owner, "own", json!(null)).unwrap(), Some(json!("state")));
        rt.go(owner, "state", "").unwrap();
        // the relocated original answers from the root
        assert_eq!(rt.invoke(owner, "own", json!(null)).unwrap(), Some(json!("own")));

        rt.release(ctl).unwrap();
        assert_eq!(rt.stub(owner, "own").unwrap(), None);
        assert_eq!(rt.invoke(owner, "own", json!(null)).unwrap(), Some(json!("own")));
    }

    #[test]
    fn missing_method_emits_notification() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let def = StateDefinition::new().on(EventType::NoSuchMethod, move |_, event| {
            if let EventPayload::MissingMethod { name, .. } = &event.payload {
                log.lock().unwrap().push(name.clone());
            }
        });
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();

        assert_eq!(rt.dispatch(ctl, "absent", json!([1])).unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), vec!["absent".to_string()]);
    }

    #[test]
    fn inheriting_owner_gets_its_own_controller() {
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        let base_ctl = rt.attach(base, "state", def(), AttachOptions::default()).unwrap();
        let child = rt.derive_owner(base, "child").unwrap();

        // the ancestor's stub dispatches through the child's own controller
        assert_eq!(rt.invoke(child, "greet", json!(null)).unwrap(), Some(json!("A")));
        let child_ctl = rt.controller(child, "state").unwrap().unwrap();
        assert_ne!(child_ctl, base_ctl);

        let current = rt.current_state(child_ctl).unwrap();
        assert!(rt.is_virtual(current).unwrap());
        assert_eq!(rt.qualified_name(current).unwrap(), "A");
    }

    #[test]
    fn no_accessor_without_lineage() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        assert!(matches!(
            rt.accessor(owner, "state"),
            Err(RuntimeError::NoAccessor { .. })
        ));
    }
}
