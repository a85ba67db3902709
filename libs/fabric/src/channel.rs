use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::message::{Args, Message};
use crate::transport::frame::{FrameReader, FrameWriter};
use crate::transport::Transport;

/// Event delivered to a channel's own listeners when it is torn down.
pub const KICK: &str = "$kick";

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Handle identifying a registered listener, see [`Channel::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Sink {
    Many(mpsc::UnboundedSender<Args>),
    Once(oneshot::Sender<Args>),
}

struct Slot {
    id: ListenerId,
    sink: Sink,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    events: HashMap<String, Vec<Slot>>,
    inboxes: Vec<(ListenerId, mpsc::UnboundedSender<Message>)>,
    closed: bool,
}

impl Table {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

enum Outlet {
    /// In-process pair: emitting dispatches straight into the other end.
    Peer(OnceLock<Weak<Inner>>),
    /// Socket end: emitting queues a frame for the writer task.
    Wire(mpsc::UnboundedSender<Message>),
}

struct Inner {
    serial: u64,
    table: Mutex<Table>,
    outlet: Outlet,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Inner {
    fn new(outlet: Outlet) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            table: Mutex::new(Table::default()),
            outlet,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Deliver an inbound message to the listeners of this end.
    fn dispatch(&self, message: Message) {
        let mut table = self.table.lock();
        if table.closed {
            return;
        }
        trace!(channel = self.serial, event = %message.event, "dispatch");

        table
            .inboxes
            .retain(|(_, inbox)| inbox.send(message.clone()).is_ok());

        let Some(slots) = table.events.remove(&message.event) else {
            return;
        };
        let mut kept = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot.sink {
                Sink::Many(tx) => {
                    // A dropped receiver means the listener is gone; prune it.
                    if tx.send(message.args.clone()).is_ok() {
                        kept.push(Slot {
                            id: slot.id,
                            sink: Sink::Many(tx),
                        });
                    }
                }
                Sink::Once(tx) => {
                    let _ = tx.send(message.args.clone());
                }
            }
        }
        if !kept.is_empty() {
            table.events.insert(message.event, kept);
        }
    }

    fn remove(&self, event: &str, id: ListenerId) {
        let mut table = self.table.lock();
        if let Some(slots) = table.events.get_mut(event) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                table.events.remove(event);
            }
        }
    }

    fn remove_inbox(&self, id: ListenerId) {
        self.table.lock().inboxes.retain(|(slot, _)| *slot != id);
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(channel = self.serial, "closing channel");
        self.dispatch(Message::new(KICK, Vec::new()));
        {
            let mut table = self.table.lock();
            table.closed = true;
            table.events.clear();
            table.inboxes.clear();
        }
        self.closed.cancel();
        if let Outlet::Peer(peer) = &self.outlet {
            if let Some(peer) = peer.get().and_then(Weak::upgrade) {
                peer.close();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The last handle of a pair end is gone; the other end can no longer
        // be answered.
        if let Outlet::Peer(peer) = &self.outlet {
            if let Some(peer) = peer.get().and_then(Weak::upgrade) {
                peer.close();
            }
        }
    }
}

/// Bidirectional named-event channel.
///
/// A `Channel` is one end of a connection: [`emit`](Channel::emit) delivers to
/// the listeners registered on the *other* end. Cloning yields another handle
/// to the same end; identity is reference equality ([`Channel::same`]).
///
/// Listeners are plain queues, so dispatch never runs user code and every
/// listener observes events in emission order.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Create a connected in-process pair.
    pub fn pair() -> (Channel, Channel) {
        let a = Arc::new(Inner::new(Outlet::Peer(OnceLock::new())));
        let b = Arc::new(Inner::new(Outlet::Peer(OnceLock::new())));
        if let Outlet::Peer(slot) = &a.outlet {
            let _ = slot.set(Arc::downgrade(&b));
        }
        if let Outlet::Peer(slot) = &b.outlet {
            let _ = slot.set(Arc::downgrade(&a));
        }
        (Channel { inner: a }, Channel { inner: b })
    }

    /// Wrap a byte transport as a channel end.
    ///
    /// Nothing is read until [`Pump::start`] is called, which lets callers arm
    /// listeners for the first inbound event without racing the reader.
    pub fn framed<C: Codec>(transport: Box<dyn Transport>, codec: C) -> (Channel, Pump<C>) {
        let (outgoing_tx, outgoing) = mpsc::unbounded_channel();
        let channel = Channel {
            inner: Arc::new(Inner::new(Outlet::Wire(outgoing_tx))),
        };
        let peer = transport.peer();
        let (reader, writer) = transport.split();
        debug!(channel = channel.inner.serial, %peer, "framed channel created");
        let pump = Pump {
            channel: channel.clone(),
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            outgoing,
            codec,
        };
        (channel, pump)
    }

    /// Emit an event to the other end.
    pub fn emit(&self, event: impl Into<String>, args: Args) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let message = Message::new(event, args);
        match &self.inner.outlet {
            Outlet::Peer(peer) => {
                let peer = peer
                    .get()
                    .and_then(Weak::upgrade)
                    .ok_or(Error::ConnectionClosed)?;
                peer.dispatch(message);
                Ok(())
            }
            Outlet::Wire(outgoing) => outgoing
                .send(message)
                .map_err(|_| Error::ConnectionClosed),
        }
    }

    /// Listen to every emission of `event` until the returned listener is dropped.
    pub fn on(&self, event: impl Into<String>) -> Listener {
        let event = event.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.table.lock();
        let id = table.allocate();
        if !table.closed {
            table
                .events
                .entry(event.clone())
                .or_default()
                .push(Slot {
                    id,
                    sink: Sink::Many(tx),
                });
        }
        Listener {
            event,
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Wait for the next emission of `event`.
    ///
    /// Resolves to `None` if the channel closes first.
    pub fn once(&self, event: impl Into<String>) -> Once {
        let event = event.into();
        let (tx, rx) = oneshot::channel();
        let mut table = self.inner.table.lock();
        let id = table.allocate();
        if !table.closed {
            table
                .events
                .entry(event.clone())
                .or_default()
                .push(Slot {
                    id,
                    sink: Sink::Once(tx),
                });
        }
        Once {
            event,
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Ordered stream of every inbound event, whatever its name.
    pub fn inbox(&self) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.table.lock();
        let id = table.allocate();
        if !table.closed {
            table.inboxes.push((id, tx));
        }
        Inbox {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a listener registered with [`on`](Channel::on) or
    /// [`once`](Channel::once). Removing twice is a no-op.
    pub fn remove_listener(&self, event: &str, id: ListenerId) {
        self.inner.remove(event, id);
    }

    /// Number of listeners currently registered on this end.
    pub fn listener_count(&self) -> usize {
        let table = self.inner.table.lock();
        table.events.values().map(Vec::len).sum::<usize>() + table.inboxes.len()
    }

    /// Number of listeners registered for a single event.
    pub fn listener_count_for(&self, event: &str) -> usize {
        self.inner
            .table
            .lock()
            .events
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Tear the channel down.
    ///
    /// Listeners first receive [`KICK`], then all of them are dropped; pending
    /// [`Once`] futures resolve to `None`. For a pair the other end is closed
    /// too, for a framed channel the socket is shut down. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has been closed, from either side.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.closed.clone();
        async move { token.cancelled().await }
    }

    /// Whether both handles refer to the same channel end.
    pub fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("serial", &self.inner.serial)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stream of emissions for one event. Unregisters itself on drop.
pub struct Listener {
    event: String,
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Args>,
    channel: Weak<Inner>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next emission, or `None` once the listener was removed or the channel closed.
    pub async fn recv(&mut self) -> Option<Args> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(&self.event, self.id);
        }
    }
}

/// Single emission of one event. Unregisters itself on drop if it never fired.
pub struct Once {
    event: String,
    id: ListenerId,
    rx: oneshot::Receiver<Args>,
    channel: Weak<Inner>,
}

impl Once {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Future for Once {
    type Output = Option<Args>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.ok())
    }
}

impl Drop for Once {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(&self.event, self.id);
        }
    }
}

/// Ordered stream of every inbound [`Message`]. Unregisters itself on drop.
pub struct Inbox {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Message>,
    channel: Weak<Inner>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove_inbox(self.id);
        }
    }
}

/// Reader/writer tasks of a framed channel, see [`Channel::framed`].
#[must_use = "a framed channel does nothing until its pump is started"]
pub struct Pump<C> {
    channel: Channel,
    reader: FrameReader,
    writer: FrameWriter,
    outgoing: mpsc::UnboundedReceiver<Message>,
    codec: C,
}

impl<C: Codec> Pump<C> {
    /// Spawn the reader and writer tasks on the current runtime.
    pub fn start(self) {
        let Pump {
            channel,
            reader,
            writer,
            outgoing,
            codec,
        } = self;
        let codec = Arc::new(codec);
        tokio::spawn(write_loop(channel.clone(), writer, outgoing, codec.clone()));
        tokio::spawn(read_loop(channel, reader, codec));
    }
}

async fn read_loop<C: Codec>(channel: Channel, mut reader: FrameReader, codec: Arc<C>) {
    let closed = channel.inner.closed.clone();
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        match frame.and_then(|bytes| codec.decode::<Message>(&bytes)) {
            Ok(message) => channel.inner.dispatch(message),
            Err(Error::ConnectionClosed) => {
                debug!(channel = channel.inner.serial, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(channel = channel.inner.serial, error = %e, "dropping connection");
                break;
            }
        }
    }
    channel.close();
}

async fn write_loop<C: Codec>(
    channel: Channel,
    mut writer: FrameWriter,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    codec: Arc<C>,
) {
    let closed = channel.inner.closed.clone();
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = write_message(&mut writer, codec.as_ref(), &message).await {
            debug!(channel = channel.inner.serial, error = %e, "write failed");
            channel.close();
            return;
        }
    }
    // Flush whatever was emitted right before the close.
    while let Ok(message) = outgoing.try_recv() {
        if write_message(&mut writer, codec.as_ref(), &message).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    channel.close();
}

async fn write_message<C: Codec>(
    writer: &mut FrameWriter,
    codec: &C,
    message: &Message,
) -> Result<()> {
    let bytes = codec.encode(message)?;
    writer.write_frame(&bytes).await
}
