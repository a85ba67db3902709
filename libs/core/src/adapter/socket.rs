//! Network adapter: connects a service to a remote broker's socket listener.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use courier_fabric::codec::JsonCodec;
use courier_fabric::request::request_reply;
use courier_fabric::transport::{Address, TlsClientConfig};
use courier_fabric::{Channel, Once};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Adapter, WeakService};
use crate::error::{Error, Result};
use crate::protocol::{ACCEPTED, IDENTIFY};
use crate::service::Service;
use crate::timing::Timing;

/// Where a socket adapter is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Identifying,
    Connected,
}

/// Client-side identity hooks.
#[async_trait]
pub trait ClientHooks: Send + Sync {
    /// Whether to trust the broker that presented `identity`.
    async fn verify_broker(&self, _identity: &Value) -> bool {
        true
    }

    /// Identity sent to the broker. `base` already holds the service type and
    /// instance id; those two fields are enforced whatever this returns.
    async fn identity(&self, base: Value, _broker_identity: &Value) -> Value {
        base
    }

    /// Called when identification fails. Return `true` to give up for good.
    async fn handle_error(&self, _error: &Error) -> bool {
        false
    }
}

/// Trusts every broker and never gives up.
pub struct DefaultClientHooks;

impl ClientHooks for DefaultClientHooks {}

/// How a connection attempt ended.
enum Session {
    /// Was connected, the link dropped
    Dropped,
    /// Could not open a transport
    Unreachable,
    /// Identification failed
    Rejected,
    /// Stop reconnecting
    Aborted,
}

struct SocketInner {
    address: Address,
    tls: Option<TlsClientConfig>,
    hooks: Arc<dyn ClientHooks>,
    service: OnceLock<WeakService>,
    state: watch::Sender<ConnectState>,
    current: Mutex<Option<Channel>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// Connects a service to a broker over TCP, TLS or a Unix socket, identifying
/// itself and reconnecting whenever the link drops.
#[derive(Clone)]
pub struct SocketAdapter {
    inner: Arc<SocketInner>,
}

impl SocketAdapter {
    pub fn new(address: Address) -> Self {
        Self::builder(address).build()
    }

    pub fn builder(address: Address) -> SocketAdapterBuilder {
        SocketAdapterBuilder::new(address)
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn state(&self) -> watch::Receiver<ConnectState> {
        self.inner.state.subscribe()
    }
}

impl fmt::Debug for SocketAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAdapter")
            .field("address", &self.inner.address)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Builder for configuring a [`SocketAdapter`]
pub struct SocketAdapterBuilder {
    address: Address,
    tls: Option<TlsClientConfig>,
    hooks: Arc<dyn ClientHooks>,
}

impl SocketAdapterBuilder {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            tls: None,
            hooks: Arc::new(DefaultClientHooks),
        }
    }

    /// Dial the broker over TLS
    pub fn tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the identity hooks
    pub fn hooks(mut self, hooks: impl ClientHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn build(self) -> SocketAdapter {
        let (state, _) = watch::channel(ConnectState::Disconnected);
        SocketAdapter {
            inner: Arc::new(SocketInner {
                address: self.address,
                tls: self.tls,
                hooks: self.hooks,
                service: OnceLock::new(),
                state,
                current: Mutex::new(None),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

impl SocketInner {
    fn service(&self) -> Option<Service> {
        self.service.get().and_then(WeakService::upgrade)
    }

    fn set_state(&self, state: ConnectState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let session = tokio::select! {
                _ = self.cancel.cancelled() => break,
                session = self.session() => session,
            };
            self.set_state(ConnectState::Disconnected);
            let delay = match self.service().map(|service| service.timing().clone()) {
                None => break,
                Some(timing) => match session {
                    Session::Dropped => Duration::ZERO,
                    Session::Unreachable => timing.reconnect_delay,
                    Session::Rejected => timing.identify_retry,
                    Session::Aborted => break,
                },
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.drop_link();
        self.set_state(ConnectState::Disconnected);
        debug!(address = %self.address, "socket adapter stopped");
    }

    /// One connection attempt, through to the link dropping.
    async fn session(&self) -> Session {
        let Some((name, instance_id, timing)) = self.service().map(|service| {
            (
                service.name().to_string(),
                service.instance_id().to_string(),
                service.timing().clone(),
            )
        }) else {
            return Session::Aborted;
        };

        self.set_state(ConnectState::Connecting);
        debug!(service = %name, address = %self.address, tls = self.tls.is_some(), "connecting");
        let connecting = match &self.tls {
            Some(tls) => self.address.connect_tls(tls, timing.connect_timeout).await,
            None => self.address.connect(timing.connect_timeout).await,
        };
        let transport = match connecting {
            Ok(transport) => transport,
            Err(e) => {
                debug!(address = %self.address, error = %e, "broker unreachable");
                return Session::Unreachable;
            }
        };

        let (channel, pump) = Channel::framed(transport, JsonCodec);
        let greeting = channel.once(IDENTIFY);
        // Holds calls the broker routes here before the service is bound
        let inbox = channel.inbox();
        pump.start();
        *self.current.lock() = Some(channel.clone());
        self.set_state(ConnectState::Identifying);

        if let Err(error) = self
            .identify(&channel, greeting, &name, &instance_id, &timing)
            .await
        {
            warn!(service = %name, address = %self.address, error = %error, "identification failed");
            self.drop_link();
            return if self.hooks.handle_error(&error).await {
                Session::Aborted
            } else {
                Session::Rejected
            };
        }

        let Some(service) = self.service() else {
            self.drop_link();
            return Session::Aborted;
        };
        service.bind_with_inbox(channel.clone(), inbox);
        drop(service);
        self.set_state(ConnectState::Connected);
        info!(service = %name, address = %self.address, "connected to broker");

        channel.closed().await;
        info!(service = %name, address = %self.address, "lost connection to broker");
        {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| c.same(&channel)) {
                current.take();
            }
        }
        if let Some(service) = self.service() {
            service.release_channel(&channel);
        }
        Session::Dropped
    }

    async fn identify(
        &self,
        channel: &Channel,
        greeting: Once,
        name: &str,
        instance_id: &str,
        timing: &Timing,
    ) -> Result<()> {
        let broker_identity = match tokio::time::timeout(timing.reply_timeout, greeting).await {
            Ok(Some(args)) => args.into_iter().next().unwrap_or(Value::Null),
            Ok(None) => return Err(Error::Closed),
            Err(_) => return Err(Error::Timeout),
        };
        if !self.hooks.verify_broker(&broker_identity).await {
            return Err(Error::Identity);
        }

        let base = json!({ "type": name, "id": instance_id });
        let identity = match self.hooks.identity(base.clone(), &broker_identity).await {
            Value::Object(mut fields) => {
                fields.insert("type".into(), name.into());
                fields.insert("id".into(), instance_id.into());
                Value::Object(fields)
            }
            _ => base,
        };

        request_reply(channel, IDENTIFY, ACCEPTED, vec![identity], timing.reply_timeout)
            .await
            .map(drop)
            .map_err(|e| match e {
                courier_fabric::Error::Timeout(_) => Error::Timeout,
                // The broker hangs up on identities it rejects
                courier_fabric::Error::ConnectionClosed => Error::Identity,
                other => Error::Fabric(other),
            })
    }

    fn drop_link(&self) {
        let channel = self.current.lock().take();
        if let Some(channel) = channel {
            if let Some(service) = self.service() {
                service.release_channel(&channel);
            }
            channel.close();
        }
    }
}

impl Adapter for SocketAdapter {
    fn attach(&self, service: WeakService) {
        if self.inner.service.set(service).is_err() {
            return;
        }
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.inner.clone().supervise());
        }
    }

    /// Drops the link; the adapter reconnects right away.
    fn disconnect(&self) {
        self.inner.drop_link();
    }

    fn reconnect(&self) {
        self.inner.drop_link();
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.drop_link();
        self.inner.set_state(ConnectState::Disconnected);
    }
}
