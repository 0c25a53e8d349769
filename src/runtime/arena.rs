//! Generational node arena.
//!
//! Slots are reused after removal with a bumped generation, so a stale
//! [`NodeId`] never aliases a newer node. A realized virtual node leaves a
//! forwarding slot behind: handles to the virtual node keep resolving to the
//! real node that replaced it. Forwarding slots live as long as their
//! target and are freed with it.

use crate::runtime::node::Node;
use std::collections::BTreeMap;

/// Handle to a state node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

enum Slot {
    Occupied(Node),
    Forwarded(NodeId),
    Vacant,
}

struct Entry {
    generation: u32,
    slot: Slot,
}

#[derive(Default)]
pub(crate) struct Arena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    /// Forwarding slots by the node they point at.
    forwarders: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Arena {
    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation += 1;
            entry.slot = Slot::Occupied(node);
            return NodeId::new(index, entry.generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Occupied(node),
        });
        NodeId::new(index, 0)
    }

    fn entry(&self, id: NodeId) -> Option<&Entry> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
    }

    /// Follow forwarding slots to the live node, if any.
    pub(crate) fn resolve(&self, id: NodeId) -> Option<NodeId> {
        let mut id = id;
        loop {
            match &self.entry(id)?.slot {
                Slot::Occupied(_) => return Some(id),
                Slot::Forwarded(next) => id = *next,
                Slot::Vacant => return None,
            }
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        let id = self.resolve(id)?;
        match &self.entry(id)?.slot {
            Slot::Occupied(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let id = self.resolve(id)?;
        match self.entries.get_mut(id.index as usize) {
            Some(Entry {
                slot: Slot::Occupied(node),
                ..
            }) => Some(node),
            _ => None,
        }
    }

    /// Replace a node with a forwarding entry to `to`. The slot is freed
    /// when `to` is removed.
    pub(crate) fn forward(&mut self, from: NodeId, to: NodeId) -> Option<Node> {
        let entry = self.entries.get_mut(from.index as usize)?;
        if entry.generation != from.generation {
            return None;
        }
        match std::mem::replace(&mut entry.slot, Slot::Forwarded(to)) {
            Slot::Occupied(node) => {
                self.forwarders.entry(to).or_default().push(from);
                Some(node)
            }
            other => {
                entry.slot = other;
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        match std::mem::replace(&mut entry.slot, Slot::Vacant) {
            Slot::Occupied(node) => {
                self.free.push(id.index);
                self.release_forwarders(id);
                Some(node)
            }
            other => {
                entry.slot = other;
                None
            }
        }
    }

    /// Free every forwarding slot that led to `target`, chains included.
    fn release_forwarders(&mut self, target: NodeId) {
        let mut pending = vec![target];
        while let Some(id) = pending.pop() {
            for from in self.forwarders.remove(&id).unwrap_or_default() {
                let Some(entry) = self.entries.get_mut(from.index as usize) else {
                    continue;
                };
                if entry.generation == from.generation && matches!(entry.slot, Slot::Forwarded(_)) {
                    entry.slot = Slot::Vacant;
                    self.free.push(from.index);
                    pending.push(from);
                }
            }
        }
    }

    #[cfg(test)]
    fn slots_in_use(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e.slot, Slot::Vacant))
            .count()
    }
}
