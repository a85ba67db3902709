use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use courier_fabric::{Args, Channel, Inbox};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::Adapter;
use crate::error::Error;
use crate::handler::{Emitter, HandlerError, Teardown};
use crate::id::IdGenerator;
use crate::protocol::{self, Invocation, KICK, METHOD, SUBSCRIPTION};
use crate::proxy::Proxy;
use crate::timing::Timing;

/// Name used by services that only consume other services.
pub const DEFAULT_NAME: &str = "local";

type MethodFn = Arc<dyn Fn(Args) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;
type SubscriptionFn = Arc<dyn Fn(Emitter, Args) -> Result<Teardown, HandlerError> + Send + Sync>;
type Sessions = Arc<Mutex<HashMap<String, Teardown>>>;

/// Construction options for a [`Service`].
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub timing: Timing,
    pub id_generator: IdGenerator,
    /// Instance id proposed to the broker; generated when `None`
    pub instance_id: Option<String>,
}

struct Binding {
    channel: Channel,
    router: JoinHandle<()>,
    sessions: Sessions,
}

impl Binding {
    fn end(self) {
        self.router.abort();
        end_sessions(&self.sessions);
    }
}

pub(crate) struct ServiceInner {
    name: String,
    instance_id: String,
    options: ServiceOptions,
    methods: RwLock<HashMap<String, MethodFn>>,
    subscriptions: RwLock<HashMap<String, SubscriptionFn>>,
    binding: Mutex<Option<Binding>>,
    connected: watch::Sender<bool>,
    adapter: OnceLock<Arc<dyn Adapter>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(adapter) = self.adapter.get() {
            adapter.close();
        }
        if let Some(binding) = self.binding.get_mut().take() {
            binding.end();
        }
    }
}

/// Application-facing endpoint.
///
/// Registers methods and subscriptions other services can reach, and hands
/// out [`Proxy`]s to reach theirs. At most one [`Channel`] is bound at a
/// time; the [`Adapter`] decides when that changes.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

/// Non-owning handle held by adapters.
#[derive(Clone)]
pub struct WeakService(Weak<ServiceInner>);

impl WeakService {
    pub fn upgrade(&self) -> Option<Service> {
        self.0.upgrade().map(|inner| Service { inner })
    }
}

impl Service {
    /// Create the service and hand it to `adapter`. Must be called inside a
    /// Tokio runtime.
    pub fn new(name: impl Into<String>, adapter: impl Adapter + 'static) -> Self {
        Self::with_options(name, adapter, ServiceOptions::default())
    }

    /// A consumer-only service registered under [`DEFAULT_NAME`].
    pub fn client(adapter: impl Adapter + 'static) -> Self {
        Self::new(DEFAULT_NAME, adapter)
    }

    pub fn with_options(
        name: impl Into<String>,
        adapter: impl Adapter + 'static,
        mut options: ServiceOptions,
    ) -> Self {
        let instance_id = options
            .instance_id
            .take()
            .unwrap_or_else(|| options.id_generator.generate());
        let (connected, _) = watch::channel(false);
        let inner = Arc::new(ServiceInner {
            name: name.into(),
            instance_id,
            options,
            methods: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            binding: Mutex::new(None),
            connected,
            adapter: OnceLock::new(),
        });
        let adapter: Arc<dyn Adapter> = Arc::new(adapter);
        let _ = inner.adapter.set(adapter.clone());
        let service = Service { inner };
        adapter.attach(service.downgrade());
        service
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.options.timing
    }

    pub fn downgrade(&self) -> WeakService {
        WeakService(Arc::downgrade(&self.inner))
    }

    pub(crate) fn next_id(&self) -> String {
        self.inner.options.id_generator.generate()
    }

    /// Register a method handler.
    ///
    /// The handler's value is sent back as the call's result; an `Err`, or a
    /// panic, is sent back as the call's error.
    pub fn add_method<F, Fut, T>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        let handler: MethodFn = Arc::new(move |args| {
            let call = handler(args);
            async move {
                let value = call.await?;
                serde_json::to_value(value).map_err(HandlerError::from)
            }
            .boxed()
        });
        self.inner.methods.write().insert(name.into(), handler);
    }

    /// Register a subscription handler.
    ///
    /// The handler sets up whatever produces events, pushes them through the
    /// [`Emitter`], and returns the [`Teardown`] run when the subscriber
    /// leaves. Returning `Err` sends that error to the subscriber once and
    /// registers nothing.
    pub fn add_subscription<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Emitter, Args) -> Result<Teardown, HandlerError> + Send + Sync + 'static,
    {
        self.inner
            .subscriptions
            .write()
            .insert(name.into(), Arc::new(handler));
    }

    /// Proxy for calling any instance of `service`.
    pub fn proxy(&self, service: impl Into<String>) -> Proxy {
        Proxy::new(self.clone(), service.into(), None)
    }

    /// Proxy pinned to one instance of `service`.
    pub fn proxy_target(&self, service: impl Into<String>, target: impl Into<String>) -> Proxy {
        Proxy::new(self.clone(), service.into(), Some(target.into()))
    }

    /// Currently bound, open channel.
    pub fn channel(&self) -> Option<Channel> {
        self.inner
            .binding
            .lock()
            .as_ref()
            .map(|binding| binding.channel.clone())
            .filter(|channel| !channel.is_closed())
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    /// Connect-state observer: `true` while a channel is bound.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Bind the method and subscription tables to `channel`, replacing any
    /// previous binding.
    pub fn bind_channel(&self, channel: Channel) {
        let inbox = channel.inbox();
        self.bind_with_inbox(channel, inbox);
    }

    /// [`bind_channel`](Self::bind_channel) with an inbox armed earlier, so
    /// traffic that arrived before the bind is still served, in order.
    pub fn bind_with_inbox(&self, channel: Channel, inbox: Inbox) {
        let sessions: Sessions = Arc::default();
        let router = tokio::spawn(route(
            Arc::downgrade(&self.inner),
            channel.clone(),
            inbox,
            sessions.clone(),
        ));
        let previous = self.inner.binding.lock().replace(Binding {
            channel,
            router,
            sessions,
        });
        if let Some(previous) = previous {
            previous.end();
        }
        info!(service = %self.inner.name, "bound to channel");
        self.inner.connected.send_replace(true);
    }

    /// Drop the current binding, running the teardown of every live subscription.
    pub fn unbind_channel(&self) {
        let binding = self.inner.binding.lock().take();
        if let Some(binding) = binding {
            binding.end();
            info!(service = %self.inner.name, "unbound from channel");
            self.inner.connected.send_replace(false);
        }
    }

    /// Unbind only if `channel` is the one currently bound.
    pub fn release_channel(&self, channel: &Channel) {
        let binding = {
            let mut binding = self.inner.binding.lock();
            match binding.as_ref() {
                Some(current) if current.channel.same(channel) => binding.take(),
                _ => None,
            }
        };
        if let Some(binding) = binding {
            binding.end();
            info!(service = %self.inner.name, "unbound from channel");
            self.inner.connected.send_replace(false);
        }
    }

    /// No channel showed up in time; have the adapter start over.
    pub fn broker_timeout(&self) {
        warn!(service = %self.inner.name, "could not reach broker");
        if let Some(adapter) = self.inner.adapter.get() {
            adapter.reconnect();
        }
    }

    /// Stop the adapter and unbind for good.
    pub fn close(&self) {
        info!(service = %self.inner.name, "closing service");
        if let Some(adapter) = self.inner.adapter.get() {
            adapter.close();
        }
        self.unbind_channel();
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Serve inbound method and subscription traffic in arrival order.
async fn route(service: Weak<ServiceInner>, channel: Channel, mut inbox: Inbox, sessions: Sessions) {
    while let Some(message) = inbox.recv().await {
        let Some(inner) = service.upgrade() else {
            break;
        };
        match message.event.as_str() {
            METHOD => inner.on_method(&channel, message.args),
            SUBSCRIPTION => inner.on_subscription(&channel, &sessions, message.args),
            KICK => break,
            event => {
                if let Some(id) = protocol::unlistened_id(event) {
                    let teardown = sessions.lock().remove(id);
                    if let Some(teardown) = teardown {
                        debug!(service = %inner.name, id, "subscription teardown");
                        teardown.run();
                    }
                }
            }
        }
    }
    end_sessions(&sessions);
}

fn end_sessions(sessions: &Sessions) {
    let ended: Vec<Teardown> = sessions.lock().drain().map(|(_, teardown)| teardown).collect();
    ended.into_iter().for_each(Teardown::run);
}

impl ServiceInner {
    fn on_method(&self, channel: &Channel, args: Args) {
        let Some(invocation) = Invocation::parse(args) else {
            warn!(service = %self.name, "malformed method invocation");
            return;
        };
        let handler = self.methods.read().get(&invocation.method).cloned();
        let Some(handler) = handler else {
            debug!(service = %self.name, method = %invocation.method, "no such method");
            reply(channel, &invocation.id, vec![Error::NotFound.to_wire()]);
            return;
        };
        debug!(service = %self.name, method = %invocation.method, id = %invocation.id, "called method");

        let channel = channel.clone();
        tokio::spawn(async move {
            let payload = match invoke(handler, invocation.args).await {
                Ok(value) => vec![Value::Null, value],
                Err(error) => vec![error.into_payload()],
            };
            reply(&channel, &invocation.id, payload);
        });
    }

    fn on_subscription(&self, channel: &Channel, sessions: &Sessions, args: Args) {
        let Some(invocation) = Invocation::parse(args) else {
            warn!(service = %self.name, "malformed subscription");
            return;
        };
        let handler = self.subscriptions.read().get(&invocation.method).cloned();
        let Some(handler) = handler else {
            debug!(service = %self.name, method = %invocation.method, "no such subscription");
            reply(channel, &invocation.id, vec![Error::NotFound.to_wire()]);
            return;
        };
        debug!(service = %self.name, method = %invocation.method, id = %invocation.id, "called subscription");

        let emitter = Emitter::new(channel.clone(), invocation.id.clone());
        let setup = catch_unwind(AssertUnwindSafe(|| handler(emitter, invocation.args)))
            .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)));
        match setup {
            Ok(teardown) => {
                let replaced = sessions.lock().insert(invocation.id, teardown);
                if let Some(replaced) = replaced {
                    replaced.run();
                }
            }
            Err(error) => {
                debug!(service = %self.name, id = %invocation.id, "subscription setup failed");
                reply(channel, &invocation.id, vec![error.into_payload()]);
            }
        }
    }
}

async fn invoke(handler: MethodFn, args: Args) -> Result<Value, HandlerError> {
    let call = catch_unwind(AssertUnwindSafe(|| handler(args))).map_err(HandlerError::from_panic)?;
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .map_err(HandlerError::from_panic)?
}

fn reply(channel: &Channel, id: &str, payload: Args) {
    if let Err(e) = channel.emit(id, payload) {
        debug!(id, error = %e, "caller gone, reply dropped");
    }
}
