//! Types application handlers are written against.

use std::any::Any;
use std::fmt;

use courier_fabric::{Args, Channel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Error produced by a method or subscription handler.
///
/// Crosses the wire verbatim as JSON. Anything implementing
/// [`std::error::Error`] converts into it by its `Display` text.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError(Value);

impl HandlerError {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self(payload.into())
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    pub fn into_payload(self) -> Value {
        self.0
    }

    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self(Value::String(message))
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(error: E) -> Self {
        Self(Value::String(error.to_string()))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(message) => f.write_str(message),
            other => write!(f, "{}", other),
        }
    }
}

/// Deserialize positional argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| HandlerError::new(format!("missing argument {}", index)))?;
    serde_json::from_value(value)
        .map_err(|e| HandlerError::new(format!("argument {}: {}", index, e)))
}

/// Teardown callback returned by a subscription handler; runs at most once.
#[must_use = "dropping a Teardown without returning it leaks the subscription"]
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(teardown)))
    }

    /// For subscriptions that hold no resources.
    pub fn noop() -> Self {
        Self(None)
    }

    pub(crate) fn run(mut self) {
        if let Some(teardown) = self.0.take() {
            teardown();
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Teardown").field(&self.0.is_some()).finish()
    }
}

/// Sends events to one subscriber. Cheap to clone into timers and tasks.
#[derive(Clone)]
pub struct Emitter {
    channel: Channel,
    id: String,
}

impl Emitter {
    pub(crate) fn new(channel: Channel, id: String) -> Self {
        Self { channel, id }
    }

    /// The subscription's invocation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Emit a successful event carrying `value`.
    pub fn next<T: Serialize>(&self, value: T) {
        match serde_json::to_value(value) {
            Ok(value) => self.emit(None, vec![value]),
            Err(e) => self.error(e),
        }
    }

    /// Emit an error event.
    pub fn error(&self, error: impl Into<HandlerError>) {
        self.emit(Some(error.into().into_payload()), Vec::new());
    }

    /// Emit `(err, ...args)` as-is.
    pub fn emit(&self, error: Option<Value>, args: Args) {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(error.unwrap_or(Value::Null));
        payload.extend(args);
        if let Err(e) = self.channel.emit(self.id.as_str(), payload) {
            debug!(id = %self.id, error = %e, "subscriber gone, event dropped");
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("id", &self.id).finish()
    }
}
