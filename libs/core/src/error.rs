use serde_json::Value;
use thiserror::Error;

use crate::protocol::tokens;

/// Terminal outcome of a call or subscription that did not succeed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invocation id already in flight")]
    IdConflict,

    #[error("timed out")]
    Timeout,

    #[error("identity rejected")]
    Identity,

    #[error("no such method or subscription")]
    NotFound,

    /// Error payload produced by a remote handler, forwarded as-is
    #[error("remote error: {0}")]
    Remote(Value),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Fabric(#[from] courier_fabric::Error),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Interpret the error slot of a reply.
    ///
    /// `null`/`false` mean success and yield `None`; protocol tokens map to
    /// their variant; anything else is a handler error.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Bool(false) => None,
            Value::String(token) => Some(match token.as_str() {
                tokens::ID_CONFLICT => Error::IdConflict,
                tokens::TIMEOUT => Error::Timeout,
                tokens::IDENTITY => Error::Identity,
                tokens::NOT_EXIST => Error::NotFound,
                _ => Error::Remote(value.clone()),
            }),
            other => Some(Error::Remote(other.clone())),
        }
    }

    /// Encode for the error slot of a reply.
    pub fn to_wire(&self) -> Value {
        match self {
            Error::IdConflict => Value::from(tokens::ID_CONFLICT),
            Error::Timeout => Value::from(tokens::TIMEOUT),
            Error::Identity => Value::from(tokens::IDENTITY),
            Error::NotFound => Value::from(tokens::NOT_EXIST),
            Error::Remote(value) => value.clone(),
            other => Value::from(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
