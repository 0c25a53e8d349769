//! The change protocol.
//!
//! A change runs depart, enter (on the transition), exit up to the domain,
//! the optional operation, enter down to the target, then arrive. While it
//! runs the controller's current is the transition itself. Listeners may
//! start another change at any point; the new one supersedes the old, which
//! notices through the controller's serial and stops.

use crate::builder::TransitionDefinition;
use crate::core::attributes::Attributes;
use crate::core::event::{Event, EventPayload, EventType, Listener};
use crate::core::guard::GuardKind;
use crate::core::selector::Selector;
use crate::runtime::controller::Current;
use crate::runtime::{ControllerId, NodeId, Result, RuntimeError, Runtime};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback run when a change completes or is rejected.
pub type ChangeCallback = Arc<dyn Fn(&mut Runtime, ControllerId) + Send + Sync>;

/// Options for a single [`Runtime::change`].
#[derive(Clone, Default)]
pub struct ChangeOptions {
    /// Skip final/conclusive checks, guards and retained redirection.
    pub forced: bool,
    pub success: Option<ChangeCallback>,
    pub failure: Option<ChangeCallback>,
}

impl ChangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip guards, FINAL, CONCLUSIVE and RETAINED.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Called once the change completes.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Runtime, ControllerId) + Send + Sync + 'static,
    {
        self.success = Some(Arc::new(f));
        self
    }

    /// Called when the change is rejected.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Runtime, ControllerId) + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ChangeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeOptions")
            .field("forced", &self.forced)
            .field("success", &self.success.is_some())
            .field("failure", &self.failure.is_some())
            .finish()
    }
}

/// Where to change to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Root,
    Node(NodeId),
    /// Selector resolved from the current state.
    Path(String),
}

impl From<NodeId> for Target {
    fn from(node: NodeId) -> Self {
        Target::Node(node)
    }
}

impl From<&str> for Target {
    fn from(selector: &str) -> Self {
        Target::Path(selector.to_string())
    }
}

impl From<String> for Target {
    fn from(selector: String) -> Self {
        Target::Path(selector)
    }
}

/// Handle of an in-flight transition, used to resume it once its operation
/// is done. Tokens of superseded or finished transitions are inert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransitionToken {
    controller: ControllerId,
    serial: u64,
}

impl TransitionToken {
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    /// Controller serial at the change that created the token.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// How a change ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOutcome {
    Completed,
    /// Waiting on the transition's operation.
    Pending(TransitionToken),
    /// A guard or a final/conclusive state refused it.
    Rejected,
    /// Another change started before this one finished.
    Superseded,
}

/// View of a transition handed to listeners.
#[derive(Clone, Debug)]
pub struct TransitionInfo {
    pub token: TransitionToken,
    /// Name of the matched transition definition.
    pub name: Option<String>,
    pub origin: NodeId,
    pub target: NodeId,
    pub domain: NodeId,
    pub attachment: NodeId,
    pub started: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Exiting,
    Operating,
    Entering,
}

pub(crate) struct TransitionRecord {
    pub(crate) serial: u64,
    pub(crate) name: Option<String>,
    pub(crate) origin: NodeId,
    /// Where the exit walk started.
    pub(crate) source: NodeId,
    pub(crate) target: NodeId,
    pub(crate) domain: NodeId,
    pub(crate) attachment: NodeId,
    pub(crate) definition: Option<TransitionDefinition>,
    pub(crate) success: Option<ChangeCallback>,
    pub(crate) stage: Stage,
    /// Set once `exit` has been emitted on the attachment, until the
    /// transition moves up.
    pub(crate) exited: Option<NodeId>,
    pub(crate) started: DateTime<Utc>,
    /// Virtual origins of superseded transitions, released on completion.
    pub(crate) virtual_origins: Vec<NodeId>,
}

impl TransitionRecord {
    fn info(&self, controller: ControllerId) -> TransitionInfo {
        TransitionInfo {
            token: TransitionToken {
                controller,
                serial: self.serial,
            },
            name: self.name.clone(),
            origin: self.origin,
            target: self.target,
            domain: self.domain,
            attachment: self.attachment,
            started: self.started,
        }
    }

    fn listeners(&self, kind: EventType) -> Vec<Listener> {
        self.definition
            .as_ref()
            .map(|d| d.listeners(kind).to_vec())
            .unwrap_or_default()
    }
}

impl Runtime {
    /// Change a controller's state. See the module docs for the protocol.
    ///
    /// Guard rejection is an outcome, not an error. Errors are reserved for
    /// targets that cannot be resolved in this controller's tree.
    pub fn change(
        &mut self,
        controller: ControllerId,
        target: impl Into<Target>,
        options: ChangeOptions,
    ) -> Result<ChangeOutcome> {
        let target = target.into();
        let (origin, in_flight) = match &self.ctl(controller)?.current {
            Current::State(state) => (*state, false),
            Current::Transition(record) => (record.origin, true),
        };
        let target = self.resolve_target(controller, &target)?;
        let target = self.settle(target, options.forced)?;

        if !options.forced && !self.change_allowed(origin, target)? {
            debug!(
                from = %self.qualified_name(origin)?,
                to = %self.qualified_name(target)?,
                "change rejected"
            );
            if let Some(failure) = &options.failure {
                failure(self, controller);
            }
            return Ok(ChangeOutcome::Rejected);
        }

        let serial = {
            let ctl = self.ctl_mut(controller)?;
            ctl.serial += 1;
            ctl.serial
        };

        let mut source = origin;
        let mut carried = Vec::new();
        if in_flight {
            let Some(previous) = self.take_transition(controller)? else {
                return Err(RuntimeError::UnknownController(controller));
            };
            debug!(
                from = %self.qualified_name(previous.origin)?,
                to = %self.qualified_name(previous.target)?,
                "transition aborted"
            );
            source = match previous.exited {
                Some(exited) if exited == previous.attachment && exited != previous.domain => self
                    .superstate(exited)?
                    .unwrap_or(previous.attachment),
                _ => previous.attachment,
            };
            carried = previous.virtual_origins.clone();
            carried.extend([previous.origin, previous.source, previous.domain]);
            let info = previous.info(controller);
            self.emit_transition(&info, previous.listeners(EventType::Abort), EventType::Abort)?;
            self.emit_transition(&info, previous.listeners(EventType::Destroy), EventType::Destroy)?;
            if self.superseded(controller, serial) {
                for node in carried {
                    self.release_virtual(node)?;
                }
                return Ok(ChangeOutcome::Superseded);
            }
        }

        let source = self.live(source)?;
        let target = self.live(target)?;
        let domain = self.common_ancestor(source, target)?;

        if !in_flight {
            self.emit_on(origin, EventType::Depart, EventPayload::None, false)?;
            if self.superseded(controller, serial) {
                return Ok(ChangeOutcome::Superseded);
            }
        }

        let origin = self.live(origin)?;
        let (name, definition) = match self.find_transition(origin, target)? {
            Some((name, definition)) => (Some(name), Some(definition)),
            None => (None, None),
        };
        let record = TransitionRecord {
            serial,
            name,
            origin,
            source,
            target,
            domain,
            attachment: source,
            definition,
            success: options.success.clone(),
            stage: Stage::Exiting,
            exited: None,
            started: Utc::now(),
            virtual_origins: carried,
        };
        debug!(
            from = %self.qualified_name(origin)?,
            to = %self.qualified_name(target)?,
            domain = %self.qualified_name(domain)?,
            "transition started"
        );
        self.ctl_mut(controller)?.current = Current::Transition(Box::new(record));

        self.emit_live_transition(controller, EventType::Enter)?;
        if !self.still_live(controller, serial) {
            return Ok(self.outcome(controller, serial));
        }

        loop {
            let Some((attachment, domain, origin)) = self.with_record(controller, serial, |r| {
                (r.attachment, r.domain, r.origin)
            }) else {
                return Ok(self.outcome(controller, serial));
            };
            if attachment == domain {
                break;
            }
            self.with_record_mut(controller, serial, |r| r.exited = Some(attachment));
            self.emit_on(attachment, EventType::Exit, EventPayload::None, false)?;
            if !self.still_live(controller, serial) {
                return Ok(self.outcome(controller, serial));
            }
            let exited = self.retain_exit(attachment, origin)?;
            let parent = self
                .superstate(exited)?
                .ok_or(RuntimeError::UnknownNode(exited))?;
            self.with_record_mut(controller, serial, |r| {
                r.attachment = parent;
                r.exited = None;
            });
        }

        let operation = self
            .with_record(controller, serial, |r| {
                r.definition.as_ref().and_then(|d| d.operation.clone())
            })
            .flatten();
        match operation {
            Some(operation) => {
                self.with_record_mut(controller, serial, |r| r.stage = Stage::Operating);
                self.emit_live_transition(controller, EventType::Start)?;
                if !self.still_live(controller, serial) {
                    return Ok(self.outcome(controller, serial));
                }
                let token = TransitionToken { controller, serial };
                trace!(?token, "transition operation running");
                operation(self, token);
                Ok(self.outcome(controller, serial))
            }
            None => self.finish(controller, serial),
        }
    }

    /// Resume a transition whose operation has finished. Returns `false` if
    /// the token's transition is no longer waiting.
    pub fn complete(&mut self, token: TransitionToken) -> Result<bool> {
        let waiting = self
            .with_record(token.controller, token.serial, |r| r.stage == Stage::Operating)
            .unwrap_or(false);
        if !waiting {
            return Ok(false);
        }
        self.finish(token.controller, token.serial)?;
        Ok(true)
    }

    /// The transition in flight, if any.
    pub fn transition_info(&self, controller: ControllerId) -> Result<Option<TransitionInfo>> {
        Ok(match &self.ctl(controller)?.current {
            Current::Transition(record) => Some(record.info(controller)),
            Current::State(_) => None,
        })
    }

    fn finish(&mut self, controller: ControllerId, serial: u64) -> Result<ChangeOutcome> {
        self.with_record_mut(controller, serial, |r| r.stage = Stage::Entering);
        self.emit_live_transition(controller, EventType::End)?;
        if !self.still_live(controller, serial) {
            return Ok(self.outcome(controller, serial));
        }

        loop {
            let Some((attachment, target)) =
                self.with_record(controller, serial, |r| (r.attachment, r.target))
            else {
                return Ok(self.outcome(controller, serial));
            };
            if attachment == target {
                break;
            }
            let child = self.child_toward(attachment, target)?;
            self.with_record_mut(controller, serial, |r| r.attachment = child);
            self.emit_on(child, EventType::Enter, EventPayload::None, false)?;
            if !self.still_live(controller, serial) {
                return Ok(self.outcome(controller, serial));
            }
        }

        let Some(record) = self.take_transition(controller)? else {
            return Ok(ChangeOutcome::Superseded);
        };
        let target = record.target;
        self.record_markers(target)?;
        self.emit_on(target, EventType::Arrive, EventPayload::None, false)?;
        let superseded = self.superseded(controller, serial);

        let stale = [record.origin, record.source, record.domain];
        for node in record.virtual_origins.iter().copied().chain(stale) {
            self.release_virtual(node)?;
        }
        if superseded {
            return Ok(ChangeOutcome::Superseded);
        }

        self.ctl_mut(controller)?.last_completed = Some(serial);
        debug!(
            state = %self.qualified_name(target)?,
            elapsed_ms = (Utc::now() - record.started).num_milliseconds(),
            "transition completed"
        );
        let info = record.info(controller);
        self.emit_transition(&info, record.listeners(EventType::Destroy), EventType::Destroy)?;
        if let Some(success) = &record.success {
            success(self, controller);
        }
        Ok(ChangeOutcome::Completed)
    }

    /// Take the transition in flight out of the controller, leaving its
    /// attachment as the idle current state.
    fn take_transition(&mut self, controller: ControllerId) -> Result<Option<TransitionRecord>> {
        let ctl = self.ctl_mut(controller)?;
        let resting = match &ctl.current {
            Current::Transition(record) => record.attachment,
            Current::State(_) => return Ok(None),
        };
        match std::mem::replace(&mut ctl.current, Current::State(resting)) {
            Current::Transition(record) => Ok(Some(*record)),
            Current::State(_) => Ok(None),
        }
    }

    fn with_record<T>(&self, controller: ControllerId, serial: u64, f: impl FnOnce(&TransitionRecord) -> T) -> Option<T> {
        match &self.ctl(controller).ok()?.current {
            Current::Transition(record) if record.serial == serial => Some(f(record)),
            _ => None,
        }
    }

    fn with_record_mut(&mut self, controller: ControllerId, serial: u64, f: impl FnOnce(&mut TransitionRecord)) {
        if let Ok(ctl) = self.ctl_mut(controller) {
            if let Current::Transition(record) = &mut ctl.current {
                if record.serial == serial {
                    f(record);
                }
            }
        }
    }

    fn still_live(&self, controller: ControllerId, serial: u64) -> bool {
        self.with_record(controller, serial, |_| ()).is_some()
    }

    fn superseded(&self, controller: ControllerId, serial: u64) -> bool {
        self.ctl(controller).map_or(true, |ctl| ctl.serial != serial)
    }

    fn outcome(&self, controller: ControllerId, serial: u64) -> ChangeOutcome {
        let Ok(ctl) = self.ctl(controller) else {
            return ChangeOutcome::Superseded;
        };
        if ctl.last_completed == Some(serial) {
            return ChangeOutcome::Completed;
        }
        match &ctl.current {
            Current::Transition(record) if record.serial == serial => {
                ChangeOutcome::Pending(TransitionToken { controller, serial })
            }
            _ => ChangeOutcome::Superseded,
        }
    }

    fn emit_live_transition(&mut self, controller: ControllerId, kind: EventType) -> Result<()> {
        let (info, listeners) = match &self.ctl(controller)?.current {
            Current::Transition(record) => (record.info(controller), record.listeners(kind)),
            Current::State(_) => return Ok(()),
        };
        self.emit_transition(&info, listeners, kind)
    }

    /// Emit on the transition object. Redirects resolve from its attachment.
    fn emit_transition(&mut self, info: &TransitionInfo, listeners: Vec<Listener>, kind: EventType) -> Result<()> {
        if listeners.is_empty() {
            return Ok(());
        }
        let event = Event {
            kind,
            node: info.attachment,
            controller: info.token.controller,
            transition: Some(info.clone()),
            payload: EventPayload::None,
        };
        self.run_listeners(&event, listeners);
        Ok(())
    }

    fn resolve_target(&mut self, controller: ControllerId, target: &Target) -> Result<NodeId> {
        match target {
            Target::Root => self.controller_root(controller),
            Target::Path(selector) => {
                let from = self.current_state(controller)?;
                self.query(from, selector)?
                    .ok_or_else(|| RuntimeError::InvalidTarget(selector.clone()))
            }
            Target::Node(node) => {
                let node = self.live(*node)?;
                let owning = self.controller_of(node)?;
                if owning == controller {
                    return Ok(node);
                }
                let foreign = || RuntimeError::InvalidTarget(format!("{node:?} belongs to another controller"));
                let (ours, theirs) = (self.ctl(controller)?, self.ctl(owning)?);
                if ours.name != theirs.name || !self.lineage(ours.owner)?.contains(&theirs.owner) {
                    return Err(foreign());
                }
                let path = self.path(node)?;
                self.resolve_path(controller, &path)?.ok_or_else(foreign)
            }
        }
    }

    /// Apply retained redirection (unless forced), then descend abstract
    /// states to a concrete one.
    fn settle(&mut self, target: NodeId, forced: bool) -> Result<NodeId> {
        let mut target = target;
        if !forced && self.attributes(target)?.contains(Attributes::RETAINED) {
            let retained = self.content(target)?.and_then(|c| c.retained.clone());
            if let Some(below) = retained {
                let controller = self.controller_of(target)?;
                let mut path = self.path(target)?;
                path.extend(below);
                if let Some(found) = self.resolve_path(controller, &path)? {
                    target = found;
                }
            }
        }
        self.concrete(target)
    }

    /// Descend from an abstract state through default (else first)
    /// substates until a concrete one is reached.
    pub(crate) fn concrete(&mut self, node: NodeId) -> Result<NodeId> {
        let controller = self.controller_of(node)?;
        let mut path = self.path(node)?;
        let mut current = self.live(node)?;
        while self.attributes(current)?.contains(Attributes::ABSTRACT) {
            let names = self.names_below(controller, &path)?;
            let mut chosen = None;
            for name in &names {
                let mut child = path.clone();
                child.push(name.clone());
                if self
                    .peek_attributes(controller, &child)?
                    .is_some_and(|a| a.contains(Attributes::DEFAULT))
                {
                    chosen = Some(name.clone());
                    break;
                }
            }
            let Some(name) = chosen.or_else(|| names.first().cloned()) else {
                return Err(RuntimeError::NoConcreteSubstate(self.qualified_name(current)?));
            };
            path.push(name);
            current = self
                .resolve_path(controller, &path)?
                .ok_or_else(|| RuntimeError::NoConcreteSubstate(path.join(".")))?;
        }
        Ok(current)
    }

    /// Final, conclusive and guard checks for leaving `origin` for `target`.
    fn change_allowed(&self, origin: NodeId, target: NodeId) -> Result<bool> {
        let origin = self.live(origin)?;
        let target = self.live(target)?;
        if origin != target && self.attributes(origin)?.contains(Attributes::FINAL) {
            return Ok(false);
        }
        let domain = self.common_ancestor(origin, target)?;
        let mut cursor = origin;
        while cursor != domain {
            if self.attributes(cursor)?.contains(Attributes::CONCLUSIVE) {
                return Ok(false);
            }
            cursor = self
                .superstate(cursor)?
                .ok_or(RuntimeError::UnknownNode(cursor))?;
        }
        Ok(self.evaluate_guard(origin, GuardKind::Release, target)?
            && self.evaluate_guard(target, GuardKind::Admit, origin)?)
    }

    /// First transition definition whose selectors match, searched from the
    /// target upward, then from the origin upward.
    fn find_transition(&self, origin: NodeId, target: NodeId) -> Result<Option<(String, TransitionDefinition)>> {
        let origin_path = self.path(origin)?;
        let target_path = self.path(target)?;
        let matches = |selector: &str, context: &[String], candidate: &[String]| {
            let selector = Selector::parse(selector);
            selector.is_universal() || selector.matches(context, candidate)
        };

        for start in [target, origin] {
            let mut cursor = Some(start);
            while let Some(node) = cursor {
                let context = self.path(node)?;
                let holders = std::iter::once(node).chain(self.lineage_nodes(node)?);
                for holder in holders {
                    let Some(content) = self.content(holder)? else {
                        continue;
                    };
                    for (name, definition) in &content.transitions {
                        if matches(&definition.origin, context.as_slice(), origin_path.as_slice())
                            && matches(&definition.target, context.as_slice(), target_path.as_slice())
                        {
                            return Ok(Some((name.clone(), definition.clone())));
                        }
                    }
                }
                cursor = self.superstate(node)?;
            }
        }
        Ok(None)
    }

    /// Record the exit of a retained state. Returns the (possibly realized)
    /// exited node.
    fn retain_exit(&mut self, node: NodeId, origin: NodeId) -> Result<NodeId> {
        let attributes = self.attributes(node)?;
        if !attributes.contains(Attributes::RETAINED) {
            return Ok(node);
        }
        let node_path = self.path(node)?;
        let origin_path = self.path(origin)?;
        if !origin_path.starts_with(&node_path) {
            return Ok(node);
        }
        let mut below = origin_path[node_path.len()..].to_vec();
        if attributes.contains(Attributes::SHALLOW) {
            below.truncate(1);
        }
        let node = self.realize(node)?;
        self.content_mut(node)?.retained = if below.is_empty() { None } else { Some(below) };
        Ok(node)
    }
}

