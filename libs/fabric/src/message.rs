use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Positional arguments carried by a named event.
pub type Args = Vec<Value>;

/// A single named event travelling over a [`Channel`](crate::Channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: String,
    #[serde(default)]
    pub args: Args,
}

impl Message {
    pub fn new(event: impl Into<String>, args: Args) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }
}
