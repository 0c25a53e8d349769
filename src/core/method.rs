//! State methods and their invocation context.

use crate::runtime::{ControllerId, NodeId, OwnerId, Runtime};
use serde_json::Value;
use std::sync::Arc;

/// Context handed to a method when it is dispatched.
#[derive(Clone, Debug)]
pub struct Invocation {
    /// The owner the call was made on. For inherited methods this is the
    /// descendant, not the owner whose tree defines the method.
    pub owner: OwnerId,
    pub controller: Option<ControllerId>,
    /// The current state the call was dispatched from.
    pub state: Option<NodeId>,
    /// The state whose method table supplied the implementation.
    pub holder: Option<NodeId>,
    pub args: Value,
}

/// A state (or owner) method.
pub type Method = Arc<dyn Fn(&mut Runtime, &Invocation) -> Value + Send + Sync>;

/// Wrap a closure as a [`Method`].
pub fn method<F>(f: F) -> Method
where
    F: Fn(&mut Runtime, &Invocation) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identity comparison of two method implementations.
pub fn same_method(a: &Method, b: &Method) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
