use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use courier_fabric::request::request_reply;
use courier_fabric::{Args, Channel, Inbox};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapter::LocalAdapter;
use crate::error::Error;
use crate::poll::wait_for;
use crate::protocol::{self, CallRequest, KICK, METHOD, SUBSCRIPTION};
use crate::service::Service;
use crate::storage::{InFlightIds, ServiceRegistry};
use crate::timing::Timing;

/// Live subscriptions started by one connection, by invocation id.
type Sessions = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

pub(crate) struct BrokerInner {
    services: ServiceRegistry,
    ids: InFlightIds,
    timing: Timing,
    closed: AtomicBool,
    shutdown: CancellationToken,
    local: Mutex<Vec<Service>>,
}

/// Routes method calls and subscriptions between connected services.
///
/// Cloning is cheap; all clones share one registry.
///
/// ```no_run
/// use courier_core::Broker;
///
/// # async fn run() {
/// let broker = Broker::new();
/// let calculator = broker.local_service("calculator");
/// calculator.add_method("multiply", |args| async move {
///     let x: i64 = courier_core::arg(&args, 0)?;
///     let y: i64 = courier_core::arg(&args, 1)?;
///     Ok(x * y)
/// });
///
/// let client = broker.local_service("local");
/// let product = client
///     .proxy("calculator")
///     .call("multiply", vec![2.into(), 3.into()])
///     .await
///     .unwrap();
/// assert_eq!(product, 6);
/// # }
/// ```
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Non-owning broker handle, for adapters and listeners.
#[derive(Clone)]
pub struct WeakBroker(Weak<BrokerInner>);

impl WeakBroker {
    pub fn upgrade(&self) -> Option<Broker> {
        self.0.upgrade().map(|inner| Broker { inner })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_timing(Timing::default())
    }

    pub fn with_timing(timing: Timing) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                services: ServiceRegistry::new(),
                ids: InFlightIds::new(),
                timing,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                local: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.timing
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn in_flight(&self) -> &InFlightIds {
        &self.inner.ids
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker(Arc::downgrade(&self.inner))
    }

    /// Cancelled when the broker closes.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Register `channel` as an instance of `service_type` and start routing
    /// its requests.
    pub fn connect(&self, service_type: &str, channel: Channel) -> Connection {
        self.connect_instance(service_type, None, channel)
    }

    /// Like [`connect`](Self::connect), proposing an instance id.
    pub fn connect_instance(
        &self,
        service_type: &str,
        proposed_id: Option<&str>,
        channel: Channel,
    ) -> Connection {
        let instance_id = self
            .inner
            .services
            .add_instance(service_type, proposed_id, channel.clone());
        info!(service = service_type, instance = %instance_id, "service connected");

        let sessions: Sessions = Arc::default();
        let router = tokio::spawn(route(
            Arc::downgrade(&self.inner),
            channel.clone(),
            channel.inbox(),
            sessions.clone(),
            service_type.to_string(),
            instance_id.clone(),
        ));
        Connection {
            broker: Arc::downgrade(&self.inner),
            service_type: service_type.to_string(),
            instance_id,
            channel,
            sessions,
            router,
        }
    }

    /// A service living in this process, connected through a [`LocalAdapter`].
    ///
    /// The broker keeps it and closes it on [`close`](Self::close).
    pub fn local_service(&self, name: impl Into<String>) -> Service {
        let service = Service::new(name, LocalAdapter::new(self));
        self.inner.local.lock().push(service.clone());
        service
    }

    /// Close every connection and local service. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing broker");
        self.inner.shutdown.cancel();

        let local: Vec<Service> = self.inner.local.lock().drain(..).collect();
        for service in local {
            service.close();
        }
        for channel in self.inner.services.clear() {
            channel.close();
        }
        info!("broker closed");
    }
}

/// Handle on one registered service connection.
///
/// Dropping it leaves the connection registered until its channel closes.
pub struct Connection {
    broker: Weak<BrokerInner>,
    service_type: String,
    instance_id: String,
    channel: Channel,
    sessions: Sessions,
    router: JoinHandle<()>,
}

impl Connection {
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Unregister and stop routing; subscriptions this connection started end.
    pub fn disconnect(self) {
        self.router.abort();
        self.sessions.lock().clear();
        if let Some(broker) = self.broker.upgrade() {
            if broker
                .services
                .remove(&self.service_type, &self.instance_id)
                .is_some()
            {
                info!(service = %self.service_type, instance = %self.instance_id, "service disconnected");
            }
        }
    }
}

/// Serve one connection's requests in arrival order, then unregister it.
async fn route(
    broker: Weak<BrokerInner>,
    caller: Channel,
    mut inbox: Inbox,
    sessions: Sessions,
    service_type: String,
    instance_id: String,
) {
    while let Some(message) = inbox.recv().await {
        let Some(broker) = broker.upgrade() else {
            break;
        };
        match message.event.as_str() {
            METHOD => broker.on_method(&caller, message.args),
            SUBSCRIPTION => broker.on_subscription(&caller, &sessions, message.args),
            KICK => break,
            event => {
                if let Some(id) = protocol::unlistened_id(event) {
                    let stop = sessions.lock().remove(id);
                    if let Some(stop) = stop {
                        let _ = stop.send(());
                    }
                }
            }
        }
    }

    sessions.lock().clear();
    if let Some(broker) = broker.upgrade() {
        if broker.services.remove(&service_type, &instance_id).is_some() {
            info!(service = %service_type, instance = %instance_id, "service disconnected");
        }
    }
}

impl BrokerInner {
    fn on_method(self: &Arc<Self>, caller: &Channel, args: Args) {
        let Some(request) = CallRequest::parse(args) else {
            warn!("malformed method request");
            return;
        };
        if !self.claim(caller, &request.id) {
            return;
        }
        tokio::spawn(self.clone().run_method(caller.clone(), request));
    }

    fn on_subscription(self: &Arc<Self>, caller: &Channel, sessions: &Sessions, args: Args) {
        let Some(request) = CallRequest::parse(args) else {
            warn!("malformed subscription request");
            return;
        };
        if !self.claim(caller, &request.id) {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        sessions.lock().insert(request.id.clone(), stop_tx);
        tokio::spawn(
            self.clone()
                .run_subscription(caller.clone(), request, stop_rx, sessions.clone()),
        );
    }

    /// Mark `id` in flight, or tell the caller it already is.
    fn claim(&self, caller: &Channel, id: &str) -> bool {
        if self.ids.add(id) {
            return true;
        }
        info!(id, "conflicting id");
        reply(caller, id, vec![Error::IdConflict.to_wire()]);
        false
    }

    /// Wait for a serving instance; on failure the caller gets `timeout` and
    /// the id is released.
    async fn resolve(&self, caller: &Channel, request: &CallRequest) -> Option<Channel> {
        let target = wait_for(&self.timing.backoff, || {
            self.services.get(&request.service, request.target.as_deref())
        })
        .await;
        if target.is_none() {
            info!(service = %request.service, id = %request.id, "no such service");
            reply(caller, &request.id, vec![Error::Timeout.to_wire()]);
            self.ids.remove(&request.id);
        }
        target
    }

    async fn run_method(self: Arc<Self>, caller: Channel, request: CallRequest) {
        let Some(target) = self.resolve(&caller, &request).await else {
            return;
        };
        debug!(service = %request.service, method = %request.method, id = %request.id, "method forwarded");

        let payload = match request_reply(
            &target,
            METHOD,
            &request.id,
            request.invocation().to_args(),
            self.timing.reply_timeout,
        )
        .await
        {
            Ok(payload) => {
                debug!(id = %request.id, "method replied");
                payload
            }
            Err(e) => {
                info!(id = %request.id, error = %e, "method timed out");
                vec![Error::Timeout.to_wire()]
            }
        };
        reply(&caller, &request.id, payload);
        self.ids.remove(&request.id);
    }

    async fn run_subscription(
        self: Arc<Self>,
        caller: Channel,
        request: CallRequest,
        mut stop: oneshot::Receiver<()>,
        sessions: Sessions,
    ) {
        let id = request.id.clone();
        let mut caller_kick = caller.once(KICK);

        let target = tokio::select! {
            target = self.resolve(&caller, &request) => target,
            _ = &mut stop => {
                self.ids.remove(&id);
                None
            }
        };
        let Some(target) = target else {
            sessions.lock().remove(&id);
            return;
        };

        let mut relay = target.on(id.as_str());
        let mut target_kick = target.once(KICK);
        if let Err(e) = target.emit(SUBSCRIPTION, request.invocation().to_args()) {
            debug!(id = %id, error = %e, "target gone before subscribing");
        }
        info!(service = %request.service, method = %request.method, id = %id, "subscription started");

        let reason = loop {
            tokio::select! {
                event = relay.recv() => match event {
                    Some(args) => {
                        trace!(id = %id, "subscription event");
                        reply(&caller, &id, args);
                    }
                    None => break "target closed",
                },
                _ = &mut stop => break "unlistened",
                _ = &mut caller_kick => break "caller gone",
                _ = &mut target_kick => break "target gone",
            }
        };

        drop(relay);
        sessions.lock().remove(&id);
        self.ids.remove(&id);
        if let Err(e) = target.emit(protocol::unlisten_event(&id), Vec::new()) {
            trace!(id = %id, error = %e, "target gone, unlisten dropped");
        }
        info!(id = %id, reason, "subscription ended");
    }
}

fn reply(channel: &Channel, id: &str, payload: Args) {
    if let Err(e) = channel.emit(id, payload) {
        debug!(id, error = %e, "caller gone, reply dropped");
    }
}
