//! Wire-level event names and error tokens shared by every channel.

pub use courier_fabric::KICK;

use courier_fabric::Args;
use serde_json::Value;

/// Method calls: `(service, target, method, id, ...args)` towards the broker,
/// `(method, id, ...args)` towards the service.
pub const METHOD: &str = "$method";

/// Subscriptions, same payload shapes as [`METHOD`].
pub const SUBSCRIPTION: &str = "$subscription";

/// Suffix of the per-subscription cancellation event.
pub const UNLISTEN: &str = "$unlisten";

/// Identity exchange, both directions.
pub const IDENTIFY: &str = "identify";

/// Acknowledges a client identity.
pub const ACCEPTED: &str = "accepted";

/// Error tokens carried in the error slot of a reply.
pub mod tokens {
    pub const ID_CONFLICT: &str = "idconflict";
    pub const TIMEOUT: &str = "timeout";
    pub const IDENTITY: &str = "identity";
    pub const NOT_EXIST: &str = "notexist";
}

/// Cancellation event for subscription `id`.
pub fn unlisten_event(id: &str) -> String {
    format!("{}{}", id, UNLISTEN)
}

/// Inverse of [`unlisten_event`].
pub fn unlistened_id(event: &str) -> Option<&str> {
    event.strip_suffix(UNLISTEN).filter(|id| !id.is_empty())
}

/// Method or subscription request as sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub service: String,
    /// Instance to address; any instance when `None`
    pub target: Option<String>,
    pub method: String,
    pub id: String,
    pub args: Args,
}

impl CallRequest {
    pub fn parse(args: Args) -> Option<Self> {
        let mut args = args.into_iter();
        let service = string(args.next()?)?;
        // Callers may send an empty string for "any instance"
        let target = match args.next()? {
            Value::String(target) if !target.is_empty() => Some(target),
            _ => None,
        };
        let method = string(args.next()?)?;
        let id = string(args.next()?)?;
        Some(Self {
            service,
            target,
            method,
            id,
            args: args.collect(),
        })
    }

    pub fn to_args(&self) -> Args {
        let mut payload = Vec::with_capacity(self.args.len() + 4);
        payload.push(Value::String(self.service.clone()));
        payload.push(self.target.clone().map_or(Value::Null, Value::String));
        payload.push(Value::String(self.method.clone()));
        payload.push(Value::String(self.id.clone()));
        payload.extend(self.args.iter().cloned());
        payload
    }

    /// The request as forwarded to the serving instance.
    pub fn invocation(&self) -> Invocation {
        Invocation {
            method: self.method.clone(),
            id: self.id.clone(),
            args: self.args.clone(),
        }
    }
}

/// Method or subscription request as delivered to a service.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub method: String,
    pub id: String,
    pub args: Args,
}

impl Invocation {
    pub fn parse(args: Args) -> Option<Self> {
        let mut args = args.into_iter();
        let method = string(args.next()?)?;
        let id = string(args.next()?)?;
        Some(Self {
            method,
            id,
            args: args.collect(),
        })
    }

    pub fn to_args(&self) -> Args {
        let mut payload = Vec::with_capacity(self.args.len() + 2);
        payload.push(Value::String(self.method.clone()));
        payload.push(Value::String(self.id.clone()));
        payload.extend(self.args.iter().cloned());
        payload
    }
}

fn string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_request_forwards_as_invocation() {
        let request = CallRequest::parse(vec![
            json!("calculator"),
            json!(""),
            json!("multiply"),
            json!("id-1"),
            json!(2),
            json!(3),
        ])
        .unwrap();
        assert_eq!(request.target, None);
        assert_eq!(
            request.invocation().to_args(),
            vec![json!("multiply"), json!("id-1"), json!(2), json!(3)]
        );
        assert_eq!(CallRequest::parse(request.to_args()), Some(request));
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_eq!(CallRequest::parse(vec![json!("calculator")]), None);
        assert_eq!(Invocation::parse(vec![json!("multiply"), json!(5)]), None);
    }

    #[test]
    fn unlisten_round_trip() {
        let event = unlisten_event("abc");
        assert_eq!(event, "abc$unlisten");
        assert_eq!(unlistened_id(&event), Some("abc"));
        assert_eq!(unlistened_id("$unlisten"), None);
        assert_eq!(unlistened_id("$method"), None);
    }
}
