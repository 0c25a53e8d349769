//! Recording into and traversal of `history` states.

use crate::core::attributes::Attributes;
use crate::core::delta::Mutation;
use crate::core::history::{DeltaRecord, HistoryEntry, ReplayStep, StateHistory, StateMarker};
use crate::runtime::{ChangeOptions, NodeId, Result, RuntimeError, Runtime, Target};
use chrono::Utc;
use tracing::debug;

enum Replay {
    Apply(Vec<String>, Mutation),
    Visit(Vec<String>),
}

impl Runtime {
    /// The log of a history state.
    pub fn history(&self, node: NodeId) -> Result<Option<&StateHistory>> {
        Ok(self.content(self.live(node)?)?.and_then(|c| c.history.as_ref()))
    }

    /// Real history states containing `node`, nearest first.
    fn history_holders(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let mut holders = Vec::new();
        let mut cursor = Some(self.live(node)?);
        while let Some(id) = cursor {
            let n = self.node(id)?;
            if !n.is_virtual() && n.attributes.contains(Attributes::HISTORY) {
                holders.push(id);
            }
            cursor = n.superstate;
        }
        Ok(holders)
    }

    fn history_mut(&mut self, holder: NodeId) -> Result<&mut StateHistory> {
        Ok(self.content_mut(holder)?.history.get_or_insert_with(StateHistory::new))
    }

    /// Record `target` becoming current in every history state above it.
    pub(crate) fn record_markers(&mut self, target: NodeId) -> Result<()> {
        if self.replaying > 0 {
            return Ok(());
        }
        let path = self.path(target)?;
        for holder in self.history_holders(target)? {
            let depth = self.path(holder)?.len();
            let mut below = path[depth..].to_vec();
            if self.attributes(holder)?.contains(Attributes::SHALLOW) {
                below.truncate(1);
            }
            let marker = StateMarker {
                path: below.join("."),
                timestamp: Utc::now(),
            };
            self.history_mut(holder)?.record_state(marker);
        }
        Ok(())
    }

    /// Record a mutation of `node` in the history states above it whose
    /// subtree holds the current state.
    pub(crate) fn record_delta(&mut self, node: NodeId, forward: &Mutation, reverse: &Mutation) -> Result<()> {
        let controller = self.controller_of(node)?;
        let current = self.current_state(controller)?;
        let path = self.path(node)?;
        for holder in self.history_holders(node)? {
            if !self.is_within(current, holder)? {
                continue;
            }
            let depth = self.path(holder)?.len();
            let delta = DeltaRecord {
                path: path[depth..].to_vec(),
                forward: forward.clone(),
                reverse: reverse.clone(),
                timestamp: Utc::now(),
            };
            self.history_mut(holder)?.record_delta(delta);
        }
        Ok(())
    }

    /// Move through the history of `node` by `steps` markers (negative goes
    /// back), undoing or redoing the recorded mutations on the way and
    /// changing to each marker passed. Returns the number of markers moved.
    pub fn history_go(&mut self, node: NodeId, steps: isize) -> Result<isize> {
        let holder = self.live(node)?;
        let Some(history) = self.history(holder)? else {
            return Ok(0);
        };
        let plan = history.plan(steps);
        let actions = plan
            .steps
            .iter()
            .filter_map(|step| match (step, history.entry(step_index(step))?) {
                (ReplayStep::Reverse(_), HistoryEntry::Delta(d)) => Some(Replay::Apply(d.path.clone(), d.reverse.clone())),
                (ReplayStep::Apply(_), HistoryEntry::Delta(d)) => Some(Replay::Apply(d.path.clone(), d.forward.clone())),
                (ReplayStep::Visit(_), HistoryEntry::State(marker)) => Some(Replay::Visit(split_path(&marker.path))),
                _ => None,
            })
            .collect::<Vec<_>>();

        self.replaying += 1;
        let replayed = self.replay(holder, actions);
        self.replaying -= 1;
        replayed?;

        let holder = self.live(holder)?;
        self.history_mut(holder)?.set_cursor(plan.cursor);
        debug!(state = %self.qualified_name(holder)?, moved = plan.moved, "history traversed");
        Ok(plan.moved)
    }

    fn replay(&mut self, holder: NodeId, actions: Vec<Replay>) -> Result<()> {
        let controller = self.controller_of(holder)?;
        for action in actions {
            let base = self.path(holder)?;
            match action {
                Replay::Apply(below, mutation) => {
                    let path = [base, below].concat();
                    let node = self
                        .resolve_path(controller, &path)?
                        .ok_or_else(|| RuntimeError::InvalidTarget(path.join(".")))?;
                    self.apply_tracked(node, &mutation)?;
                }
                Replay::Visit(below) => {
                    let path = [base, below].concat();
                    let node = self
                        .resolve_path(controller, &path)?
                        .ok_or_else(|| RuntimeError::InvalidTarget(path.join(".")))?;
                    self.change(controller, Target::Node(node), ChangeOptions::new().forced())?;
                }
            }
        }
        Ok(())
    }
}

fn step_index(step: &ReplayStep) -> usize {
    match *step {
        ReplayStep::Reverse(i) | ReplayStep::Apply(i) | ReplayStep::Visit(i) => i,
    }
}

fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::StateDefinition;
    use crate::core::delta::{Edit, Mutation};
    use crate::core::Attributes;
    use crate::runtime::{AttachOptions, Runtime};
    use serde_json::json;

    fn tracked() -> StateDefinition {
        StateDefinition::new()
            .attributes(Attributes::HISTORY | Attributes::MUTABLE)
            .state("A", StateDefinition::new().initial())
            .state("B", StateDefinition::new().state("BA", StateDefinition::new()))
            .state("C", StateDefinition::new())
    }

    fn current(rt: &Runtime, ctl: crate::runtime::ControllerId) -> String {
        let state = rt.current_state(ctl).unwrap();
        rt.qualified_name(state).unwrap()
    }

    #[test]
    fn arrivals_are_recorded_as_markers() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", tracked(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        rt.go(owner, "state", "B.BA").unwrap();
        rt.go(owner, "state", "C").unwrap();

        let history = rt.history(root).unwrap().unwrap();
        assert_eq!(history.get_path(), vec!["A", "B.BA", "C"]);
    }

    #[test]
    fn shallow_history_keeps_first_segment() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let def = tracked().attributes(Attributes::SHALLOW);
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        rt.go(owner, "state", "B.BA").unwrap();

        assert_eq!(rt.history(root).unwrap().unwrap().get_path(), vec!["A", "B"]);
    }

    #[test]
    fn traversal_moves_between_markers() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", tracked(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        rt.go(owner, "state", "B").unwrap();
        rt.go(owner, "state", "C").unwrap();

        assert_eq!(rt.history_go(root, -1).unwrap(), -1);
        assert_eq!(current(&rt, ctl), "B");
        assert_eq!(rt.history_go(root, -5).unwrap(), -1);
        assert_eq!(current(&rt, ctl), "A");
        assert_eq!(rt.history_go(root, 2).unwrap(), 2);
        assert_eq!(current(&rt, ctl), "C");
        // replay recorded nothing of its own
        assert_eq!(rt.history(root).unwrap().unwrap().markers().len(), 3);
    }

    #[test]
    fn new_arrival_after_rewind_truncates_the_future() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", tracked(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        rt.go(owner, "state", "B").unwrap();
        rt.go(owner, "state", "C").unwrap();
        rt.history_go(root, -2).unwrap();
        rt.go(owner, "state", "C").unwrap();

        assert_eq!(rt.history(root).unwrap().unwrap().get_path(), vec!["A", "C"]);
    }

    #[test]
    fn traversal_undoes_and_redoes_mutations() {
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", tracked(), AttachOptions::default()).unwrap();
        let root = rt.controller_root(ctl).unwrap();
        rt.go(owner, "state", "B").unwrap();
        rt.mutate(root, &Mutation::new().with_data("x", Edit::Set(json!(1))))
            .unwrap();

        rt.history_go(root, -1).unwrap();
        assert_eq!(rt.get_data(root, "x").unwrap(), None);
        assert_eq!(current(&rt, ctl), "A");

        rt.history_go(root, 1).unwrap();
        assert_eq!(rt.get_data(root, "x").unwrap(), Some(json!(1)));
        assert_eq!(current(&rt, ctl), "B");
    }
}
