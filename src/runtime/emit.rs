//! Event emission.
//!
//! Listeners are gathered from the emitting state, then from its analogues
//! along the owner lineage, and (for bubbling emissions) again at each
//! superstate. The set is fixed before anything runs, so listeners added
//! during an emission wait for the next one.

use crate::core::event::{Event, EventPayload, EventType, Listener};
use crate::runtime::{ChangeOptions, NodeId, Result, Runtime, Target};
use tracing::{trace, warn};

impl Runtime {
    /// Emit `kind` on `node`, bubbling through its superstates.
    pub fn emit(&mut self, node: NodeId, kind: EventType, payload: EventPayload) -> Result<()> {
        self.emit_on(node, kind, payload, true)
    }

    /// Emit on `node`. Protocol events pass `via_tree = false` so that they
    /// reach the node's own and inherited listeners only.
    pub(crate) fn emit_on(&mut self, node: NodeId, kind: EventType, payload: EventPayload, via_tree: bool) -> Result<()> {
        let node = self.live(node)?;
        let controller = self.controller_of(node)?;
        let listeners = self.gather(node, kind, via_tree)?;
        trace!(
            event = kind.as_str(),
            state = %self.qualified_name(node)?,
            listeners = listeners.len(),
            "emit"
        );
        if listeners.is_empty() {
            return Ok(());
        }

        let event = Event {
            kind,
            node,
            controller,
            transition: self.transition_info(controller)?,
            payload,
        };
        self.run_listeners(&event, listeners);
        Ok(())
    }

    fn gather(&self, node: NodeId, kind: EventType, via_tree: bool) -> Result<Vec<Listener>> {
        let mut gathered = Vec::new();
        let mut level = Some(node);
        while let Some(current) = level {
            let holders = std::iter::once(current).chain(self.lineage_nodes(current)?);
            for holder in holders {
                let Some(emitter) = self.content(holder)?.and_then(|c| c.events.get(&kind)) else {
                    continue;
                };
                gathered.extend(emitter.listeners().cloned());
            }
            if !via_tree {
                break;
            }
            level = self.superstate(current)?;
        }
        Ok(gathered)
    }

    /// Run callbacks in order, then follow redirects in order.
    pub(crate) fn run_listeners(&mut self, event: &Event, listeners: Vec<Listener>) {
        let mut redirects = Vec::new();
        for listener in listeners {
            match listener {
                Listener::Callback(callback) => callback(self, event),
                Listener::Redirect(selector) => redirects.push(selector),
            }
        }
        for selector in redirects {
            self.follow_redirect(event, &selector);
        }
    }

    fn follow_redirect(&mut self, event: &Event, selector: &str) {
        let result = self.live(event.node).and_then(|context| {
            let target = self
                .query(context, selector)?
                .ok_or_else(|| crate::runtime::RuntimeError::InvalidTarget(selector.to_string()))?;
            self.change(event.controller, Target::Node(target), ChangeOptions::default())
        });
        if let Err(error) = result {
            warn!(
                event = event.kind.as_str(),
                selector,
                %error,
                "redirect failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::StateDefinition;
    use crate::core::event::{EventPayload, EventType};
    use crate::runtime::{AttachOptions, Runtime};
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> crate::core::event::Listener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: &str| {
            let sink = sink.clone();
            let tag = tag.to_string();
            crate::core::event::Listener::callback(move |_, _| sink.lock().unwrap().push(tag.clone()))
        };
        (log, make)
    }

    #[test]
    fn custom_emission_bubbles_up_the_tree() {
        let (log, make) = recorder();
        let def = StateDefinition::new()
            .listener(EventType::Mutate, make("root"))
            .state(
                "A",
                StateDefinition::new()
                    .initial()
                    .listener(EventType::Mutate, make("A")),
            );
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let a = rt.current_state(ctl).unwrap();

        rt.emit(a, EventType::Mutate, EventPayload::None).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["A", "root"]);
    }

    #[test]
    fn emitted_arguments_reach_every_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let def = StateDefinition::new().state(
            "A",
            StateDefinition::new().initial().on(EventType::Enter, move |_, event| {
                if let EventPayload::Args(args) = &event.payload {
                    sink.lock().unwrap().push(args.clone());
                }
            }),
        );
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        let ctl = rt.attach(owner, "state", def, AttachOptions::default()).unwrap();
        let a = rt.current_state(ctl).unwrap();

        rt.emit(a, EventType::Enter, EventPayload::Args(serde_json::json!({ "level": 3 })))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({ "level": 3 })]);
    }

    #[test]
    fn protocol_emission_stays_on_the_node() {
        let (log, make) = recorder();
        let def = StateDefinition::new()
            .listener(EventType::Arrive, make("root"))
            .state("A", StateDefinition::new().initial())
            .state("B", StateDefinition::new().listener(EventType::Arrive, make("B")));
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def, AttachOptions::default()).unwrap();

        rt.go(owner, "state", "B").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["B"]);
    }

    #[test]
    fn inherited_listeners_run_after_local_ones() {
        let (log, make) = recorder();
        let mut rt = Runtime::new();
        let base = rt.create_owner("base");
        let def = StateDefinition::new()
            .state("A", StateDefinition::new().initial())
            .state("B", StateDefinition::new().listener(EventType::Arrive, make("base")));
        rt.attach(base, "state", def, AttachOptions::default()).unwrap();
        let child = rt.derive_owner(base, "child").unwrap();
        let ctl = rt.accessor(child, "state").unwrap();
        let root = rt.controller_root(ctl).unwrap();
        let b = rt.query(root, "B").unwrap().unwrap();
        rt.listen(b, EventType::Arrive, make("child")).unwrap();

        rt.go(child, "state", "B").unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["child", "base"]);
    }

    #[test]
    fn redirect_changes_state_after_callbacks() {
        let (log, make) = recorder();
        let def = StateDefinition::new()
            .state("A", StateDefinition::new().initial())
            .state(
                "B",
                StateDefinition::new()
                    .redirect(EventType::Arrive, "..C")
                    .listener(EventType::Arrive, make("B")),
            )
            .state("C", StateDefinition::new());
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def, AttachOptions::default()).unwrap();

        rt.go(owner, "state", "B").unwrap();
        let current = rt.state(owner, "state").unwrap();
        assert_eq!(rt.qualified_name(current).unwrap(), "C");
        assert_eq!(*log.lock().unwrap(), vec!["B"]);
    }

    #[test]
    fn failed_redirect_is_not_an_error() {
        let def = StateDefinition::new()
            .state("A", StateDefinition::new().initial())
            .state("B", StateDefinition::new().redirect(EventType::Arrive, "Nowhere"));
        let mut rt = Runtime::new();
        let owner = rt.create_owner("o");
        rt.attach(owner, "state", def, AttachOptions::default()).unwrap();

        assert!(rt.go(owner, "state", "B").is_ok());
        let current = rt.state(owner, "state").unwrap();
        assert_eq!(rt.qualified_name(current).unwrap(), "B");
    }
}
