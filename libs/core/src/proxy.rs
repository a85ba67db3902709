use std::fmt;
use std::sync::Arc;

use courier_fabric::request::request_reply;
use courier_fabric::{Args, Channel, ListenerId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::poll::wait_for;
use crate::protocol::{self, CallRequest, METHOD, SUBSCRIPTION};
use crate::service::Service;

/// Caller-side handle on a remote service.
///
/// Requests go out through the owning service's bound channel; when none is
/// bound yet they wait for one on the readiness schedule.
#[derive(Clone)]
pub struct Proxy {
    service: Service,
    name: String,
    target: Option<String>,
}

impl Proxy {
    pub(crate) fn new(service: Service, name: String, target: Option<String>) -> Self {
        Self {
            service,
            name,
            target,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn request(&self, method: &str, id: String, args: Args) -> CallRequest {
        CallRequest {
            service: self.name.clone(),
            target: self.target.clone(),
            method: method.to_string(),
            id,
            args,
        }
    }

    /// Wait for a bound channel, or have the service start over.
    async fn channel(&self) -> Result<Channel> {
        let service = &self.service;
        match wait_for(&service.timing().backoff, || service.channel()).await {
            Some(channel) => Ok(channel),
            None => {
                service.broker_timeout();
                Err(Error::Timeout)
            }
        }
    }

    /// Call `method` and resolve with its result.
    ///
    /// An id conflict is retried with a fresh id; every other failure is
    /// final.
    pub async fn call(&self, method: &str, args: Args) -> Result<Value> {
        let mut conflicts = 0;
        loop {
            let id = self.service.next_id();
            match self.call_once(method, id, args.clone()).await {
                Err(Error::IdConflict) if conflicts < self.service.timing().max_id_retries => {
                    conflicts += 1;
                    debug!(service = %self.name, method, conflicts, "id conflict, retrying");
                }
                outcome => return outcome,
            }
        }
    }

    /// [`call`](Self::call), deserializing the result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Args) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::custom(format!("unexpected result from {}: {}", method, e)))
    }

    async fn call_once(&self, method: &str, id: String, args: Args) -> Result<Value> {
        let channel = self.channel().await?;
        let request = self.request(method, id, args);
        trace!(service = %self.name, method, id = %request.id, "calling");

        let reply = request_reply(
            &channel,
            METHOD,
            &request.id,
            request.to_args(),
            self.service.timing().call_timeout(),
        )
        .await
        .map_err(|e| match e {
            courier_fabric::Error::Timeout(_) => Error::Timeout,
            courier_fabric::Error::ConnectionClosed => Error::Closed,
            other => Error::Fabric(other),
        })?;

        let mut reply = reply.into_iter();
        if let Some(error) = reply.next().as_ref().and_then(Error::from_wire) {
            return Err(error);
        }
        Ok(reply.next().unwrap_or(Value::Null))
    }

    /// Subscribe to `method`, calling `callback` with every event.
    ///
    /// Events arrive as `Ok(args)`; an error event arrives as `Err`. If the
    /// connection drops the callback gets one final `Err(Error::Closed)`.
    pub fn subscribe<F>(&self, method: &str, args: Args, callback: F) -> Subscription
    where
        F: FnMut(Result<Args>) + Send + 'static,
    {
        let id = self.service.next_id();
        let state = Arc::new(Mutex::new(SubscriptionState::default()));
        let task = tokio::spawn(run_subscription(
            self.clone(),
            self.request(method, id.clone(), args),
            state.clone(),
            callback,
        ));
        Subscription { id, state, task }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.name)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Default)]
struct SubscriptionState {
    stopped: bool,
    active: Option<(Channel, ListenerId)>,
}

async fn run_subscription<F>(
    proxy: Proxy,
    request: CallRequest,
    state: Arc<Mutex<SubscriptionState>>,
    mut callback: F,
) where
    F: FnMut(Result<Args>) + Send + 'static,
{
    let channel = match proxy.channel().await {
        Ok(channel) => channel,
        Err(error) => {
            if !state.lock().stopped {
                callback(Err(error));
            }
            return;
        }
    };

    // Emitted under the lock so an unsubscribe can never overtake it
    let (mut events, sent) = {
        let mut state = state.lock();
        if state.stopped {
            return;
        }
        let events = channel.on(request.id.as_str());
        state.active = Some((channel.clone(), events.id()));
        (events, channel.emit(SUBSCRIPTION, request.to_args()))
    };
    if sent.is_err() {
        callback(Err(Error::Closed));
        return;
    }
    debug!(service = %proxy.name, method = %request.method, id = %request.id, "subscribed");

    while let Some(event) = events.recv().await {
        if state.lock().stopped {
            return;
        }
        let mut event = event.into_iter();
        match event.next().as_ref().and_then(Error::from_wire) {
            Some(error) => callback(Err(error)),
            None => callback(Ok(event.collect())),
        }
    }
    if !state.lock().stopped {
        debug!(id = %request.id, "subscription lost its connection");
        callback(Err(Error::Closed));
    }
}

/// Handle on a live subscription.
#[must_use = "dropping a Subscription does not unsubscribe; call unsubscribe()"]
pub struct Subscription {
    id: String,
    state: Arc<Mutex<SubscriptionState>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !self.state.lock().stopped && !self.task.is_finished()
    }

    /// Stop receiving events and tell the serving side. Idempotent.
    pub fn unsubscribe(&self) {
        let active = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.active.take()
        };
        debug!(id = %self.id, "unsubscribing");
        if let Some((channel, listener)) = active {
            if let Err(e) = channel.emit(protocol::unlisten_event(&self.id), Vec::new()) {
                trace!(id = %self.id, error = %e, "channel gone, unlisten dropped");
            }
            channel.remove_listener(&self.id, listener);
        }
        self.task.abort();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
