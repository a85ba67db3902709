//! Adapters own the connection between a [`Service`](crate::Service) and a broker.
//!
//! The service never connects by itself: its adapter binds and unbinds
//! channels on it as links come and go.

pub mod local;
pub mod socket;

pub use local::LocalAdapter;
pub use socket::{ClientHooks, ConnectState, DefaultClientHooks, SocketAdapter, SocketAdapterBuilder};

pub use crate::service::WeakService;

/// Connection policy for one service.
pub trait Adapter: Send + Sync {
    /// Take charge of `service`. Called once, from service construction.
    fn attach(&self, service: WeakService);

    /// Drop the current link.
    fn disconnect(&self);

    /// Drop the current link and establish a new one.
    fn reconnect(&self);

    /// Stop for good.
    fn close(&self);
}
