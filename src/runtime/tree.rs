//! Tree structure: paths, queries and substate add/remove.

use crate::builder::StateDefinition;
use crate::core::attributes::Attributes;
use crate::core::delta::{Mutation, SubstateEdit};
use crate::core::event::{EventPayload, EventType};
use crate::core::selector::{Segment, Selector};
use crate::runtime::controller::Current;
use crate::runtime::node::{Content, Node};
use crate::runtime::{ChangeOptions, ControllerId, NodeId, OwnerId, Result, RuntimeError, Runtime, Target};
use tracing::debug;

impl Runtime {
    /// Local name; empty for a root.
    pub fn name(&self, node: NodeId) -> Result<&str> {
        Ok(&self.node(node)?.name)
    }

    /// Names from the root down to `node`; empty for the root.
    pub fn path(&self, node: NodeId) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut cursor = self.live(node)?;
        loop {
            let n = self.node(cursor)?;
            match n.superstate {
                Some(parent) => {
                    names.push(n.name.clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        names.reverse();
        Ok(names)
    }

    /// Dot-joined path; `""` for the root.
    pub fn qualified_name(&self, node: NodeId) -> Result<String> {
        Ok(self.path(node)?.join("."))
    }

    /// Parent state, `None` for a root.
    pub fn superstate(&self, node: NodeId) -> Result<Option<NodeId>> {
        Ok(self.node(node)?.superstate)
    }

    /// Attribute set, including VIRTUAL for virtual nodes.
    pub fn attributes(&self, node: NodeId) -> Result<Attributes> {
        Ok(self.node(node)?.attributes)
    }

    /// Controller whose tree holds the node.
    pub fn controller_of(&self, node: NodeId) -> Result<ControllerId> {
        Ok(self.node(node)?.controller)
    }

    /// Owner of the node's controller.
    pub fn owner_of(&self, node: NodeId) -> Result<OwnerId> {
        Ok(self.ctl(self.controller_of(node)?)?.owner)
    }

    /// Real substates in order. Virtual nodes have none.
    pub fn substates(&self, node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self
            .content(node)?
            .map(|content| content.substates.clone())
            .unwrap_or_default())
    }

    /// Names of local and inherited substates.
    pub fn substate_names(&self, node: NodeId) -> Result<Vec<String>> {
        let controller = self.controller_of(node)?;
        let path = self.path(node)?;
        self.names_below(controller, &path)
    }

    /// A substate by name: the real one if present, otherwise a virtual node
    /// standing in for an inherited one.
    pub fn substate(&mut self, node: NodeId, name: &str) -> Result<Option<NodeId>> {
        let controller = self.controller_of(node)?;
        let mut path = self.path(node)?;
        path.push(name.to_string());
        self.resolve_path(controller, &path)
    }

    /// True if `node` is `ancestor` or lies beneath it.
    pub fn is_within(&self, node: NodeId, ancestor: NodeId) -> Result<bool> {
        let ancestor = self.live(ancestor)?;
        let mut cursor = Some(self.live(node)?);
        while let Some(id) = cursor {
            if id == ancestor {
                return Ok(true);
            }
            cursor = self.node(id)?.superstate;
        }
        Ok(false)
    }

    /// Nearest state containing both `a` and `b`.
    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        let mut lineage = Vec::new();
        let mut cursor = Some(self.live(a)?);
        while let Some(id) = cursor {
            lineage.push(id);
            cursor = self.node(id)?.superstate;
        }
        let mut cursor = Some(self.live(b)?);
        while let Some(id) = cursor {
            if lineage.contains(&id) {
                return Ok(id);
            }
            cursor = self.node(id)?.superstate;
        }
        Err(RuntimeError::InvalidTarget(format!(
            "'{}' and '{}' share no tree",
            self.qualified_name(a)?,
            self.qualified_name(b)?
        )))
    }

    /// The substate of `from` on the way down to `to`.
    pub(crate) fn child_toward(&self, from: NodeId, to: NodeId) -> Result<NodeId> {
        let from = self.live(from)?;
        let mut cursor = self.live(to)?;
        loop {
            match self.node(cursor)?.superstate {
                Some(parent) if parent == from => return Ok(cursor),
                Some(parent) => cursor = parent,
                None => return Err(RuntimeError::UnknownNode(to)),
            }
        }
    }

    /// Resolve a selector from `node`.
    ///
    /// Exact selectors follow local and inherited substates, materializing a
    /// virtual node where needed. Wildcard selectors return the first match
    /// in depth-first order of the whole tree.
    pub fn query(&mut self, node: NodeId, selector: &str) -> Result<Option<NodeId>> {
        let controller = self.controller_of(node)?;
        let context = self.path(node)?;
        let selector = Selector::parse(selector);

        if !selector.is_exact() {
            return match self.first_match(controller, &context, &selector, Vec::new())? {
                Some(path) => self.resolve_path(controller, &path),
                None => Ok(None),
            };
        }

        let mut cursor = if selector.is_relative() {
            context
        } else {
            Vec::new()
        };
        for segment in selector.segments() {
            match segment {
                Segment::Up => {
                    if cursor.pop().is_none() {
                        return Ok(None);
                    }
                }
                Segment::Name(name) => {
                    if !self.names_below(controller, &cursor)?.contains(name) {
                        return Ok(None);
                    }
                    cursor.push(name.clone());
                }
                Segment::Any | Segment::Descendants => return Ok(None),
            }
        }
        self.resolve_path(controller, &cursor)
    }

    fn first_match(
        &self,
        controller: ControllerId,
        context: &[String],
        selector: &Selector,
        path: Vec<String>,
    ) -> Result<Option<Vec<String>>> {
        if selector.matches(context, &path) {
            return Ok(Some(path));
        }
        for name in self.names_below(controller, &path)? {
            let mut child = path.clone();
            child.push(name);
            if let Some(found) = self.first_match(controller, context, selector, child)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Build a subtree from a definition. Emits nothing.
    pub(crate) fn build_tree(
        &mut self,
        controller: ControllerId,
        superstate: Option<NodeId>,
        name: &str,
        definition: &StateDefinition,
    ) -> NodeId {
        let mut content = Content::from_definition(definition);
        if definition.attributes.contains(Attributes::HISTORY) {
            content.history = Some(Default::default());
        }
        let id = self.nodes.insert(Node::real(
            name.to_string(),
            controller,
            superstate,
            definition.attributes,
            content,
        ));

        let children: Vec<NodeId> = definition
            .states
            .iter()
            .map(|(child, def)| self.build_tree(controller, Some(id), child, def))
            .collect();
        if let Some(content) = self.nodes.get_mut(id).and_then(|n| n.content.as_deref_mut()) {
            content.substates = children;
        }
        id
    }

    /// Real nodes of a subtree, parents before children.
    pub(crate) fn subtree(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let mut order = vec![self.live(node)?];
        let mut index = 0;
        while index < order.len() {
            if let Some(content) = self.content(order[index])? {
                order.extend(content.substates.iter().copied());
            }
            index += 1;
        }
        Ok(order)
    }

    pub(crate) fn emit_construct(&mut self, nodes: &[NodeId]) -> Result<()> {
        for &node in nodes {
            if self.nodes.resolve(node).is_some() {
                self.emit_on(node, EventType::Construct, EventPayload::None, false)?;
            }
        }
        Ok(())
    }

    /// True if an endpoint of the transition in flight lies in the subtree.
    pub(crate) fn transition_touches(&self, controller: ControllerId, subtree: NodeId) -> Result<bool> {
        let Current::Transition(record) = &self.ctl(controller)?.current else {
            return Ok(false);
        };
        for endpoint in [record.origin, record.source, record.target, record.domain, record.attachment] {
            if self.is_within(endpoint, subtree)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Add (or replace) a substate built from `definition`.
    ///
    /// A virtual parent is realized first. A virtual node already standing
    /// at the new path is adopted: its handles forward to the new node.
    /// Returns `None`, changing nothing, when the substate being replaced is
    /// in use by the transition in flight.
    pub fn add_substate(&mut self, parent: NodeId, name: &str, definition: StateDefinition) -> Result<Option<NodeId>> {
        if !crate::builder::error::is_valid_name(name) {
            return Err(RuntimeError::InvalidDefinition(vec![
                crate::builder::DefinitionError::InvalidName {
                    parent: self.qualified_name(parent)?,
                    name: name.to_string(),
                },
            ]));
        }
        if let stillwater::validation::Validation::Failure(errors) = definition.validate() {
            return Err(RuntimeError::InvalidDefinition(errors.iter().cloned().collect()));
        }

        let parent = self.realize(parent)?;
        if self.attributes(parent)?.contains(Attributes::SEALED) {
            return Err(RuntimeError::Sealed(self.qualified_name(parent)?));
        }
        let controller = self.controller_of(parent)?;

        let mut replaced = None;
        if let Some(existing) = self.real_child(parent, name) {
            if self.transition_touches(controller, existing)? {
                return Ok(None);
            }
            self.quiet += 1;
            let removed = self.remove_substate(parent, name);
            self.quiet -= 1;
            match removed? {
                Some(expression) => replaced = Some(expression),
                None => return Ok(None),
            }
        }

        self.quiet += 1;
        let node = self.build_tree(controller, Some(parent), name, &definition);
        self.quiet -= 1;
        self.content_mut(parent)?.substates.push(node);
        let ctl = self.ctl_mut(controller)?;
        if ctl.root == parent {
            ctl.aliases.insert(name.to_string(), node);
        }
        let path = self.path(node)?;
        self.adopt_virtuals(controller, &path)?;

        for method in crate::runtime::controller::method_names(&definition) {
            self.install_stub(controller, &method)?;
        }
        let created = self.subtree(node)?;
        self.emit_construct(&created)?;

        let forward = Mutation::new().with_substate(name, SubstateEdit::Add(definition));
        let reverse = match replaced {
            Some(previous) => Mutation::new().with_substate(name, SubstateEdit::Add(previous)),
            None => Mutation::new().with_substate(name, SubstateEdit::Remove),
        };
        self.notify(parent, forward, reverse)?;
        debug!(state = %self.qualified_name(node)?, "added substate");
        Ok(Some(self.live(node)?))
    }

    /// Remove a real substate and its subtree, returning its expression.
    ///
    /// Returns `None` when there is no such substate or the transition in
    /// flight passes through it. If the current state lies inside, the
    /// controller is first forced out to `parent`.
    pub fn remove_substate(&mut self, parent: NodeId, name: &str) -> Result<Option<StateDefinition>> {
        let parent = self.live(parent)?;
        let Some(child) = self.real_child(parent, name) else {
            return Ok(None);
        };
        let controller = self.controller_of(parent)?;
        if self.transition_touches(controller, child)? {
            return Ok(None);
        }

        let idle = match &self.ctl(controller)?.current {
            Current::State(current) => Some(*current),
            Current::Transition(_) => None,
        };
        if let Some(current) = idle {
            if self.is_within(current, child)? {
                self.change(controller, Target::Node(parent), ChangeOptions::new().forced())?;
            }
        }
        let occupied = match &self.ctl(controller)?.current {
            Current::State(current) => self.is_within(*current, child)?,
            Current::Transition(_) => self.transition_touches(controller, child)?,
        };
        if occupied {
            return Ok(None);
        }

        let expression = self.express(child)?;
        let nodes = self.subtree(child)?;
        for &node in nodes.iter().rev() {
            if self.nodes.resolve(node).is_some() {
                self.emit_on(node, EventType::Destroy, EventPayload::None, false)?;
            }
        }

        let path = self.path(child)?;
        let stale: Vec<NodeId> = {
            let ctl = self.ctl_mut(controller)?;
            let stale = ctl
                .virtuals
                .iter()
                .filter(|(p, _)| p.starts_with(&path))
                .map(|(_, &v)| v)
                .collect();
            ctl.virtuals.retain(|p, _| !p.starts_with(&path));
            stale
        };
        for node in stale {
            self.nodes.remove(node);
        }

        let parent = self.live(parent)?;
        self.content_mut(parent)?.substates.retain(|&s| s != child);
        let ctl = self.ctl_mut(controller)?;
        if ctl.root == parent {
            ctl.aliases.remove(name);
        }
        for node in nodes {
            self.nodes.remove(node);
        }

        let forward = Mutation::new().with_substate(name, SubstateEdit::Remove);
        let reverse = Mutation::new().with_substate(name, SubstateEdit::Add(expression.clone()));
        self.notify(parent, forward, reverse)?;
        debug!(parent = %self.qualified_name(parent)?, substate = name, "removed substate");
        Ok(Some(expression))
    }

    /// Destroy a state. The root releases the whole controller; a virtual
    /// node has nothing local to destroy. Returns `false` when the
    /// transition in flight passes through the state.
    pub fn destroy(&mut self, node: NodeId) -> Result<bool> {
        let id = self.live(node)?;
        let n = self.node(id)?;
        if n.is_virtual() {
            return Ok(false);
        }
        match n.superstate {
            None => {
                let controller = n.controller;
                if self.transition_touches(controller, id)? {
                    return Ok(false);
                }
                self.release(controller)?;
                Ok(true)
            }
            Some(parent) => {
                let name = n.name.clone();
                Ok(self.remove_substate(parent, &name)?.is_some())
            }
        }
    }
}
