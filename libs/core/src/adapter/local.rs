//! In-process adapter: links a service to a broker through a channel pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courier_fabric::Channel;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Adapter, WeakService};
use crate::broker::{Broker, Connection};
use crate::service::Service;

type Resolver = Box<dyn Fn() -> Option<Broker> + Send + Sync>;

struct Link {
    channel: Channel,
    connection: Connection,
}

struct LocalInner {
    resolve: Resolver,
    service: OnceLock<WeakService>,
    link: Mutex<Option<Link>>,
    retry_pending: AtomicBool,
    cancel: CancellationToken,
}

/// Connects a service to a broker in the same process.
///
/// While no open broker is available it retries every
/// [`Timing::local_retry`](crate::Timing::local_retry). When the broker
/// closes the link it looks for a broker again.
#[derive(Clone)]
pub struct LocalAdapter {
    inner: Arc<LocalInner>,
}

impl LocalAdapter {
    /// Adapter for `broker`, without keeping it alive.
    pub fn new(broker: &Broker) -> Self {
        let broker = broker.downgrade();
        Self::with_resolver(move || broker.upgrade())
    }

    /// Adapter asking `resolve` for the broker on every connection attempt.
    pub fn with_resolver(resolve: impl Fn() -> Option<Broker> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                resolve: Box::new(resolve),
                service: OnceLock::new(),
                link: Mutex::new(None),
                retry_pending: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

impl LocalInner {
    fn service(&self) -> Option<Service> {
        self.service.get().and_then(WeakService::upgrade)
    }

    fn connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(service) = self.service() else {
            return;
        };
        self.disconnect();

        let Some(broker) = (self.resolve)().filter(|broker| !broker.is_closed()) else {
            debug!(service = service.name(), "no broker available");
            self.schedule_connect(service.timing().local_retry);
            return;
        };

        let (broker_end, service_end) = Channel::pair();
        service.bind_channel(service_end.clone());
        let connection =
            broker.connect_instance(service.name(), Some(service.instance_id()), broker_end);
        info!(service = service.name(), instance = connection.instance_id(), "connected to local broker");
        *self.link.lock() = Some(Link {
            channel: service_end.clone(),
            connection,
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = service_end.closed() => {
                    if this.release(&service_end) {
                        info!("local broker went away");
                        this.connect();
                    }
                }
            }
        });
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    this.retry_pending.store(false, Ordering::SeqCst);
                    this.connect();
                }
            }
        });
    }

    /// Forget the link if `channel` is still its channel.
    fn release(&self, channel: &Channel) -> bool {
        let link = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(current) if current.channel.same(channel) => link.take(),
                _ => None,
            }
        };
        match link {
            Some(link) => {
                self.teardown(link);
                true
            }
            None => false,
        }
    }

    fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            self.teardown(link);
        }
    }

    fn teardown(&self, link: Link) {
        link.connection.disconnect();
        if let Some(service) = self.service() {
            service.release_channel(&link.channel);
        }
        link.channel.close();
    }
}

impl Adapter for LocalAdapter {
    fn attach(&self, service: WeakService) {
        if self.inner.service.set(service).is_ok() {
            self.inner.connect();
        }
    }

    fn disconnect(&self) {
        self.inner.disconnect();
    }

    fn reconnect(&self) {
        self.inner.connect();
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.disconnect();
    }
}
