//! Inheritance resolution, virtual nodes and realization.
//!
//! A node's protostate is the node at the same path in the tree of the
//! nearest ancestor owner bound under the same accessor. Paths that exist
//! only through inheritance are represented locally by virtual nodes: bare
//! records indexed by path on their controller, created on demand and
//! promoted to real nodes on the first local write.

use crate::core::attributes::Attributes;
use crate::runtime::controller::Current;
use crate::runtime::node::{Content, Node};
use crate::runtime::{ControllerId, NodeId, Result, RuntimeError, Runtime};
use tracing::debug;

impl Runtime {
    /// Follow `path` down real substates from `from`.
    pub(crate) fn follow_real(&self, from: NodeId, path: &[String]) -> Option<NodeId> {
        let mut cursor = self.nodes.resolve(from)?;
        for name in path {
            cursor = self.real_child(cursor, name)?;
        }
        Some(cursor)
    }

    pub(crate) fn real_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let content = self.nodes.get(parent)?.content.as_deref()?;
        content
            .substates
            .iter()
            .copied()
            .find(|&child| self.nodes.get(child).is_some_and(|n| n.name == name))
    }

    /// Real nodes at `path` in the trees of the controller's ancestor
    /// owners, nearest first.
    pub(crate) fn lineage_at(&self, controller: ControllerId, path: &[String]) -> Result<Vec<NodeId>> {
        let ctl = self.ctl(controller)?;
        let mut found = Vec::new();
        for ancestor in self.lineage(ctl.owner)? {
            let Some(&other) = self.owner(ancestor)?.controllers.get(&ctl.name) else {
                continue;
            };
            if let Some(node) = self.follow_real(self.ctl(other)?.root, path) {
                found.push(node);
            }
        }
        Ok(found)
    }

    /// Analogous nodes of `node` along the owner lineage, nearest first.
    pub(crate) fn lineage_nodes(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let controller = self.node(node)?.controller;
        let path = self.path(node)?;
        self.lineage_at(controller, &path)
    }

    /// The node this node inherits behavior from, if any ancestor owner's
    /// tree contains its path.
    pub fn protostate(&self, node: NodeId) -> Result<Option<NodeId>> {
        Ok(self.lineage_nodes(node)?.into_iter().next())
    }

    /// Names of the substates at `path`, local ones first, then inherited
    /// ones in lineage order.
    pub(crate) fn names_below(&self, controller: ControllerId, path: &[String]) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        let local = self.follow_real(self.ctl(controller)?.root, path);
        for holder in local.into_iter().chain(self.lineage_at(controller, path)?) {
            if let Some(content) = self.content(holder)? {
                for &child in &content.substates {
                    let name = &self.node(child)?.name;
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        Ok(names)
    }

    /// Attributes of the state at `path` without materializing it.
    pub(crate) fn peek_attributes(&self, controller: ControllerId, path: &[String]) -> Result<Option<Attributes>> {
        let root = self.ctl(controller)?.root;
        if let Some(local) = self.follow_real(root, path) {
            return Ok(Some(self.node(local)?.attributes));
        }
        match self.lineage_at(controller, path)?.first() {
            Some(&analogue) => Ok(Some(self.node(analogue)?.attributes)),
            None => Ok(None),
        }
    }

    /// The local node for `path`: real if one exists, otherwise a virtual
    /// node (reused from the index, or created) when some ancestor owner's
    /// tree defines the path. `None` if the path exists nowhere.
    pub(crate) fn resolve_path(&mut self, controller: ControllerId, path: &[String]) -> Result<Option<NodeId>> {
        let mut cursor = self.ctl(controller)?.root;
        for depth in 1..=path.len() {
            let name = &path[depth - 1];
            if let Some(child) = self.real_child(cursor, name) {
                cursor = child;
                continue;
            }
            let prefix = &path[..depth];
            if let Some(&existing) = self.ctl(controller)?.virtuals.get(prefix) {
                if let Some(live) = self.nodes.resolve(existing) {
                    cursor = live;
                    continue;
                }
            }
            let Some(analogue) = self.lineage_at(controller, prefix)?.first().copied() else {
                return Ok(None);
            };
            let attributes = self.node(analogue)?.attributes;
            let id = self.nodes.insert(Node::virtual_node(
                name.clone(),
                controller,
                Some(cursor),
                attributes,
            ));
            self.ctl_mut(controller)?.virtuals.insert(prefix.to_vec(), id);
            cursor = id;
        }
        Ok(Some(cursor))
    }

    /// True for a stand-in of an inherited state with no local content.
    pub fn is_virtual(&self, node: NodeId) -> Result<bool> {
        Ok(self.node(node)?.is_virtual())
    }

    /// Promote a virtual node to a real one under its (realized) parent.
    ///
    /// Idempotent: a real node is returned unchanged. The new node starts
    /// with no content and keeps resolving through its protostate. Every
    /// reference to the virtual node is redirected, and the old handle
    /// forwards to the real node.
    pub fn realize(&mut self, node: NodeId) -> Result<NodeId> {
        let id = self.live(node)?;
        let (name, controller, superstate, attributes) = {
            let n = self.node(id)?;
            if !n.is_virtual() {
                return Ok(id);
            }
            (n.name.clone(), n.controller, n.superstate, n.attributes)
        };
        let parent = superstate.ok_or(RuntimeError::UnknownNode(id))?;
        let parent = self.realize(parent)?;

        let real = match self.real_child(parent, &name) {
            Some(existing) => existing,
            None => {
                let real = self.nodes.insert(Node::real(
                    name.clone(),
                    controller,
                    Some(parent),
                    attributes,
                    Content::default(),
                ));
                self.content_mut(parent)?.substates.push(real);
                let ctl = self.ctl_mut(controller)?;
                if ctl.root == parent {
                    ctl.aliases.insert(name.clone(), real);
                }
                real
            }
        };

        self.redirect(controller, id, real)?;
        debug!(state = %self.qualified_name(real)?, "realized virtual state");
        Ok(real)
    }

    /// Point every reference to `from` at `to` and forward the old slot.
    pub(crate) fn redirect(&mut self, controller: ControllerId, from: NodeId, to: NodeId) -> Result<()> {
        let ctl = self.ctl_mut(controller)?;
        let swap = |id: &mut NodeId| {
            if *id == from {
                *id = to;
            }
        };
        match &mut ctl.current {
            Current::State(id) => swap(id),
            Current::Transition(record) => {
                swap(&mut record.origin);
                swap(&mut record.source);
                swap(&mut record.target);
                swap(&mut record.domain);
                swap(&mut record.attachment);
                if let Some(exited) = &mut record.exited {
                    swap(exited);
                }
                record.virtual_origins.retain(|&v| v != from);
            }
        }
        ctl.virtuals.retain(|_, &mut v| v != from);
        let virtuals: Vec<NodeId> = ctl.virtuals.values().copied().collect();

        for child in virtuals {
            if let Some(n) = self.nodes.get_mut(child) {
                if n.superstate == Some(from) {
                    n.superstate = Some(to);
                }
            }
        }
        self.nodes.forward(from, to);
        Ok(())
    }

    /// Redirect virtual nodes at or below `path` whose path now exists as a
    /// real node onto that real node.
    pub(crate) fn adopt_virtuals(&mut self, controller: ControllerId, path: &[String]) -> Result<()> {
        let mut candidates: Vec<(Vec<String>, NodeId)> = self
            .ctl(controller)?
            .virtuals
            .iter()
            .filter(|(p, _)| p.starts_with(path))
            .map(|(p, &v)| (p.clone(), v))
            .collect();
        candidates.sort_by_key(|(p, _)| p.len());

        let root = self.ctl(controller)?.root;
        for (virtual_path, id) in candidates {
            if let Some(real) = self.follow_real(root, &virtual_path) {
                self.redirect(controller, id, real)?;
            }
        }
        Ok(())
    }

    /// True if `node` is the idle current state or an endpoint of the
    /// transition in flight.
    pub(crate) fn is_referenced(&self, controller: ControllerId, node: NodeId) -> Result<bool> {
        Ok(match &self.ctl(controller)?.current {
            Current::State(id) => *id == node,
            Current::Transition(record) => {
                [record.origin, record.source, record.target, record.domain, record.attachment]
                    .contains(&node)
                    || record.virtual_origins.contains(&node)
            }
        })
    }

    /// Free a virtual node that nothing uses any more, then its virtual
    /// ancestors in turn.
    pub(crate) fn release_virtual(&mut self, node: NodeId) -> Result<()> {
        let mut cursor = self.nodes.resolve(node);
        while let Some(id) = cursor {
            let Some(n) = self.nodes.get(id) else {
                break;
            };
            if !n.is_virtual() {
                break;
            }
            let controller = n.controller;
            let parent = n.superstate;
            if self.is_referenced(controller, id)? {
                break;
            }
            let ctl = self.ctl(controller)?;
            let has_children = ctl
                .virtuals
                .values()
                .any(|&v| self.nodes.get(v).is_some_and(|child| child.superstate == Some(id)));
            if has_children {
                break;
            }

            self.ctl_mut(controller)?.virtuals.retain(|_, &mut v| v != id);
            self.nodes.remove(id);
            cursor = parent;
        }
        Ok(())
    }
}
