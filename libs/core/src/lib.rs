//! Courier Core - RPC and pub/sub broker over courier-fabric channels
//!
//! A [`Broker`] routes method calls and subscriptions between [`Service`]s.
//! Services register handlers and reach each other through [`Proxy`]s; an
//! [`Adapter`](adapter::Adapter) owns each service's link to the broker,
//! either in-process ([`LocalAdapter`]) or over a socket ([`SocketAdapter`]
//! talking to a [`SocketServer`], optionally over TLS).
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Broker, Teardown};
//! use std::time::Duration;
//!
//! # async fn example() -> courier_core::Result<()> {
//! let broker = Broker::new();
//!
//! let clock = broker.local_service("clock");
//! clock.add_subscription("ticks", |emit, _args| {
//!     let task = tokio::spawn(async move {
//!         let mut interval = tokio::time::interval(Duration::from_secs(1));
//!         loop {
//!             interval.tick().await;
//!             emit.next("tick");
//!         }
//!     });
//!     Ok(Teardown::new(move || task.abort()))
//! });
//!
//! let client = broker.local_service("local");
//! let ticks = client.proxy("clock").subscribe("ticks", vec![], |event| {
//!     println!("{:?}", event);
//! });
//! tokio::time::sleep(Duration::from_secs(3)).await;
//! ticks.unsubscribe();
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod broker;
pub mod error;
pub mod handler;
pub mod id;
pub mod poll;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod service;
pub mod storage;
pub mod timing;

pub use adapter::{Adapter, ClientHooks, ConnectState, LocalAdapter, SocketAdapter};
pub use broker::{Broker, Connection, WeakBroker};
pub use error::{Error, Result};
pub use handler::{arg, Emitter, HandlerError, Teardown};
pub use id::IdGenerator;
pub use proxy::{Proxy, Subscription};
pub use server::{BrokerHooks, SocketServer, SocketServerOptions};
pub use service::{Service, ServiceOptions, WeakService};
pub use timing::{Backoff, Timing};

pub use courier_fabric::transport::{Address, TlsClientConfig, TlsServerConfig};
pub use courier_fabric::{Args, Channel};
