//! Broker-side socket listener: identifies remote services and registers them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use courier_fabric::codec::JsonCodec;
use courier_fabric::request::request_reply;
use courier_fabric::transport::{
    Address, TlsServerConfig, Transport, TransportListener, DEFAULT_PORT,
};
use courier_fabric::Channel;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, WeakBroker};
use crate::error::Result;
use crate::protocol::{ACCEPTED, IDENTIFY};

/// Broker-side identity hooks.
#[async_trait]
pub trait BrokerHooks: Send + Sync {
    /// Identity presented to every connecting client.
    async fn identity(&self) -> Value {
        json!({})
    }

    /// Whether to admit the client that presented `identity`.
    async fn verify_client(&self, _identity: &Value) -> bool {
        true
    }
}

/// Presents an empty identity and admits everyone.
pub struct DefaultBrokerHooks;

impl BrokerHooks for DefaultBrokerHooks {}

pub struct SocketServerOptions {
    pub address: Address,
    /// Serve TLS with this certificate pair; plain TCP when `None`
    pub tls: Option<TlsServerConfig>,
    pub hooks: Arc<dyn BrokerHooks>,
}

impl SocketServerOptions {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            tls: None,
            hooks: Arc::new(DefaultBrokerHooks),
        }
    }

    pub fn tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn hooks(mut self, hooks: impl BrokerHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
}

impl Default for SocketServerOptions {
    fn default() -> Self {
        Self::new(Address::tcp("0.0.0.0", DEFAULT_PORT))
    }
}

/// Accepts socket connections on behalf of a [`Broker`].
///
/// Stops when closed, dropped, or when the broker closes.
pub struct SocketServer {
    address: Address,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl SocketServer {
    pub async fn bind(broker: &Broker, options: SocketServerOptions) -> Result<Self> {
        let listener = match &options.tls {
            Some(tls) => options.address.bind_tls(tls).await?,
            None => options.address.bind().await?,
        };
        let local_addr = listener.local_addr();
        let shutdown = broker.shutdown_token().child_token();
        info!(
            address = %options.address,
            ?local_addr,
            tls = options.tls.is_some(),
            "socket listener started"
        );

        tokio::spawn(accept_loop(
            broker.downgrade(),
            listener,
            options.hooks,
            shutdown.clone(),
        ));
        Ok(Self {
            address: options.address,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address clients should connect to; resolves an ephemeral TCP port.
    pub fn address(&self) -> Address {
        match (&self.address, self.local_addr) {
            (Address::Tcp(_), Some(addr)) => Address::Tcp(addr.to_string()),
            (address, _) => address.clone(),
        }
    }

    /// Stop accepting and drop every connection this listener admitted.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    broker: WeakBroker,
    mut listener: Box<dyn TransportListener>,
    hooks: Arc<dyn BrokerHooks>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(transport) => {
                tokio::spawn(admit(
                    broker.clone(),
                    transport,
                    hooks.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    if let Err(e) = listener.close().await {
        debug!(error = %e, "closing listener");
    }
    info!("socket listener stopped");
}

/// Identify one connection and hand it to the broker.
async fn admit(
    broker: WeakBroker,
    transport: Box<dyn Transport>,
    hooks: Arc<dyn BrokerHooks>,
    shutdown: CancellationToken,
) {
    let peer = transport.peer();
    let (channel, pump) = Channel::framed(transport, JsonCodec);
    pump.start();
    debug!(%peer, "new socket, identifying");

    let Some(timing) = broker.upgrade().map(|broker| broker.timing().clone()) else {
        channel.close();
        return;
    };
    let own = hooks.identity().await;
    let identity = match request_reply(&channel, IDENTIFY, IDENTIFY, vec![own], timing.reply_timeout).await {
        Ok(args) => args.into_iter().next().filter(Value::is_object),
        Err(e) => {
            info!(%peer, error = %e, "no identity received");
            None
        }
    };
    let Some(identity) = identity else {
        channel.close();
        return;
    };
    let Some(service_type) = identity.get("type").and_then(Value::as_str).map(str::to_string) else {
        info!(%peer, "identity without a type");
        channel.close();
        return;
    };
    if !hooks.verify_client(&identity).await {
        info!(%peer, service = %service_type, "client identity rejected");
        channel.close();
        return;
    }

    let Some(broker) = broker.upgrade().filter(|broker| !broker.is_closed()) else {
        channel.close();
        return;
    };
    let proposed = identity.get("id").and_then(Value::as_str);
    let connection = broker.connect_instance(&service_type, proposed, channel.clone());
    drop(broker);
    info!(%peer, service = %service_type, instance = connection.instance_id(), "client identified");

    if channel.emit(ACCEPTED, Vec::new()).is_ok() {
        tokio::select! {
            _ = channel.closed() => {}
            _ = shutdown.cancelled() => channel.close(),
        }
    }
    connection.disconnect();
}
