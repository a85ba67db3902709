//! Courier Fabric - named-event channels over in-process pairs and sockets
//!
//! Provides the [`Channel`] abstraction (a bidirectional pipe of named events
//! with `on`/`once`/`emit`/`remove_listener`), length-prefixed framing over TCP,
//! TLS and Unix sockets, a codec seam, and the one-shot request/reply primitive
//! everything above correlates with.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use courier_fabric::{Channel, codec::JsonCodec, request::request_reply, transport::Address};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // In-process pair
//! let (left, right) = Channel::pair();
//! let mut pings = right.on("ping");
//! left.emit("ping", vec![json!(1)])?;
//! assert_eq!(pings.recv().await, Some(vec![json!(1)]));
//!
//! // Or over a socket
//! let address: Address = "127.0.0.1:61610".parse()?;
//! let transport = address.connect(Some(Duration::from_secs(1))).await?;
//! let (channel, pump) = Channel::framed(transport, JsonCodec);
//! pump.start();
//! let reply = request_reply(&channel, "identify", "accepted", vec![json!({})], Duration::from_millis(2500)).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod request;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, Inbox, Listener, ListenerId, Once, Pump, KICK};
pub use error::{Error, Result};
pub use message::{Args, Message};
