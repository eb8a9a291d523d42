//! Multicast, demand-aware change broadcasting.
//!
//! `Relay` fans a stream of values out to zero or more subscribers using
//! per-subscriber channels. Subscribers that cannot keep up lose
//! intermediate values instead of buffering unbounded history, which is the
//! right trade-off for "latest state" consumers.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::channel::mpsc;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use indexmap::IndexMap;

use crate::lock_unpoisoned;

/// Thread-safe broadcaster of value-changed events.
///
/// Every subscriber gets its own channel sized to the demand it declared:
/// unlimited subscribers receive every published value, demand-bounded
/// subscribers hold at most `demand` undelivered values and silently miss
/// the rest until they consume from their stream again. Publishing never
/// runs subscriber code; it only enqueues, so it is safe to call while the
/// publisher holds other locks of its own.
///
/// # Examples
///
/// ```
/// use sharedstate::Relay;
/// use futures::StreamExt;
///
/// let relay = Relay::new();
/// let mut updates = relay.subscribe();
/// relay.publish(1);
/// assert_eq!(futures::executor::block_on(updates.next()), Some(1));
/// ```
pub struct Relay<T>
where
    T: Clone + Send + 'static,
{
    core: Arc<Mutex<RelayCore<T>>>,
    upstream: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T> Clone for Relay<T>
where
    T: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Relay {
            core: self.core.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

struct RelayCore<T> {
    subscribers: IndexMap<u64, SubscriberTx<T>>,
    next_id: u64,
    completed: bool,
}

enum SubscriberTx<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum Delivery {
    Delivered,
    /// Demand exhausted; the value is lost for this subscriber only.
    Dropped,
    Disconnected,
}

impl<T> SubscriberTx<T> {
    fn deliver(&mut self, value: T) -> Delivery {
        match self {
            SubscriberTx::Unbounded(tx) => match tx.unbounded_send(value) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Disconnected,
            },
            SubscriberTx::Bounded(tx) => match tx.try_send(value) {
                Ok(()) => Delivery::Delivered,
                Err(e) if e.is_full() => Delivery::Dropped,
                Err(_) => Delivery::Disconnected,
            },
        }
    }
}

impl<T> Relay<T>
where
    T: Clone + Send + 'static,
{
    /// Create a relay with no subscribers.
    pub fn new() -> Self {
        Relay {
            core: Arc::new(Mutex::new(RelayCore {
                subscribers: IndexMap::new(),
                next_id: 0,
                completed: false,
            })),
            upstream: None,
        }
    }

    /// Create a relay that invokes `upstream` whenever the subscriber count
    /// transitions from zero to one.
    ///
    /// The hook is the "please produce values" signal: producers that are
    /// expensive to run can stay idle until someone is actually listening.
    pub fn with_upstream(upstream: impl Fn() + Send + Sync + 'static) -> Self {
        Relay {
            upstream: Some(Arc::new(upstream)),
            ..Relay::new()
        }
    }

    /// Subscribe with unlimited demand: every published value is delivered.
    pub fn subscribe(&self) -> ValueStream<T> {
        let (tx, rx) = mpsc::unbounded();
        self.register(SubscriberTx::Unbounded(tx), rx.boxed())
    }

    /// Subscribe with bounded demand: at most `demand` undelivered values
    /// are held for this subscriber; values published beyond that are
    /// dropped until the subscriber consumes from its stream again.
    ///
    /// A demand of zero is treated as one.
    pub fn subscribe_with_demand(&self, demand: usize) -> ValueStream<T> {
        let (tx, rx) = mpsc::channel(demand.saturating_sub(1));
        self.register(SubscriberTx::Bounded(tx), rx.boxed())
    }

    fn register(&self, tx: SubscriberTx<T>, rx: BoxStream<'static, T>) -> ValueStream<T> {
        let (id, first) = {
            let mut core = lock_unpoisoned(&self.core);
            if core.completed {
                return ValueStream::closed();
            }
            let id = core.next_id;
            core.next_id += 1;
            core.subscribers.insert(id, tx);
            (id, core.subscribers.len() == 1)
        };
        // The upstream hook runs outside the relay lock so it may publish
        // or subscribe without deadlocking.
        if first {
            if let Some(upstream) = &self.upstream {
                upstream();
            }
        }
        let weak = Arc::downgrade(&self.core);
        let handle = SubscriptionHandle::new(move || cancel_subscriber(&weak, id));
        ValueStream::from_parts(rx, handle)
    }

    /// Publish a value to every current subscriber, respecting each
    /// subscriber's remaining demand. Ignored after [`Relay::complete`].
    pub fn publish(&self, value: T) {
        let mut core = lock_unpoisoned(&self.core);
        if core.completed {
            log::debug!("relay publish after completion ignored");
            return;
        }
        let mut disconnected = Vec::new();
        for (&id, tx) in core.subscribers.iter_mut() {
            match tx.deliver(value.clone()) {
                Delivery::Delivered => {}
                Delivery::Dropped => log::trace!("relay dropped value for slow subscriber {id}"),
                Delivery::Disconnected => disconnected.push(id),
            }
        }
        for id in disconnected {
            core.subscribers.shift_remove(&id);
        }
    }

    /// Terminally complete the relay: all subscriber streams end, and any
    /// later publish or subscribe is a no-op (later subscribers get an
    /// already-finished stream).
    pub fn complete(&self) {
        let mut core = lock_unpoisoned(&self.core);
        if core.completed {
            return;
        }
        core.completed = true;
        core.subscribers.clear();
    }

    /// Whether [`Relay::complete`] has been called.
    pub fn is_completed(&self) -> bool {
        lock_unpoisoned(&self.core).completed
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.core).subscribers.len()
    }
}

fn cancel_subscriber<T>(core: &Weak<Mutex<RelayCore<T>>>, id: u64) {
    if let Some(core) = core.upgrade() {
        lock_unpoisoned(&core).subscribers.shift_remove(&id);
    }
}

impl<T> Default for Relay<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Relay::new()
    }
}

impl<T> fmt::Debug for Relay<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock_unpoisoned(&self.core);
        f.debug_struct("Relay")
            .field("subscribers", &core.subscribers.len())
            .field("completed", &core.completed)
            .finish()
    }
}

/// Handle for cancelling a relay subscription.
///
/// Cancelling removes the subscriber from the relay's set under the relay
/// lock; calling it more than once is a no-op. Dropping the handle does
/// not cancel — dropping the [`ValueStream`] itself ends delivery on the
/// next publish instead.
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl SubscriptionHandle {
    fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        SubscriptionHandle {
            cancel: Arc::new(cancel),
        }
    }

    pub(crate) fn noop() -> Self {
        SubscriptionHandle::new(|| {})
    }

    /// Remove the subscriber from the relay. Idempotent.
    pub fn cancel(&self) {
        (self.cancel)();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionHandle")
    }
}

/// Stream of values delivered to one relay subscriber.
///
/// Implements [`futures::Stream`]; the stream ends when the relay
/// completes or the subscription is cancelled.
pub struct ValueStream<T> {
    inner: BoxStream<'static, T>,
    handle: SubscriptionHandle,
}

impl<T> ValueStream<T>
where
    T: Send + 'static,
{
    pub(crate) fn from_parts(inner: BoxStream<'static, T>, handle: SubscriptionHandle) -> Self {
        ValueStream { inner, handle }
    }

    /// A stream that is already finished, with an inert handle.
    pub(crate) fn closed() -> Self {
        ValueStream {
            inner: stream::empty().boxed(),
            handle: SubscriptionHandle::noop(),
        }
    }

    /// Prepend `first` ahead of the remaining deliveries (replay-one).
    /// The seeded value does not consume the subscriber's demand.
    pub(crate) fn seeded(first: T, rest: ValueStream<T>) -> Self {
        let ValueStream { inner, handle } = rest;
        ValueStream {
            inner: stream::iter([first]).chain(inner).boxed(),
            handle,
        }
    }

    /// The cancellation handle for the underlying subscription.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Cancel the underlying subscription. Idempotent.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Transform each delivered value, keeping the same subscription.
    ///
    /// This is how derived references present a projected view of a base
    /// reference's change stream without their own relay.
    pub fn map_value<U, F>(self, f: F) -> ValueStream<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        ValueStream {
            inner: self.inner.map(f).boxed(),
            handle: self.handle,
        }
    }
}

impl<T> Stream for ValueStream<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for ValueStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueStream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn delivers_published_values_in_order() {
        let relay = Relay::new();
        let mut updates = relay.subscribe();

        relay.publish(1);
        relay.publish(2);
        relay.publish(3);

        assert_eq!(updates.next().await, Some(1));
        assert_eq!(updates.next().await, Some(2));
        assert_eq!(updates.next().await, Some(3));
    }

    #[tokio::test]
    async fn demand_of_one_drops_values_until_consumed() {
        let relay = Relay::new();
        let mut updates = relay.subscribe_with_demand(1);

        relay.publish("a");
        relay.publish("b");
        relay.publish("c");

        // Only the first publish fit the declared demand.
        assert_eq!(updates.next().await, Some("a"));
        assert_eq!(updates.next().now_or_never(), None);

        // Consuming restored demand, so the next publish flows again.
        relay.publish("d");
        assert_eq!(updates.next().await, Some("d"));
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_value() {
        let relay = Relay::new();
        let mut first = relay.subscribe();
        let mut second = relay.subscribe();

        relay.publish(10);

        assert_eq!(first.next().await, Some(10));
        assert_eq!(second.next().await, Some(10));
    }

    #[tokio::test]
    async fn complete_ends_streams_and_ignores_later_publishes() {
        let relay = Relay::new();
        let mut updates = relay.subscribe();

        relay.publish(1);
        relay.complete();
        relay.publish(2);

        assert_eq!(updates.next().await, Some(1));
        assert_eq!(updates.next().await, None);
        assert!(relay.is_completed());

        // Subscribing after completion yields an already-finished stream.
        let mut late = relay.subscribe();
        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_delivery() {
        let relay = Relay::new();
        let mut updates = relay.subscribe();
        let handle = updates.handle();

        handle.cancel();
        handle.cancel();
        assert_eq!(relay.subscriber_count(), 0);

        relay.publish(1);
        assert_eq!(updates.next().await, None);
    }

    #[tokio::test]
    async fn upstream_fires_on_each_zero_to_one_transition() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let relay: Relay<i32> = Relay::with_upstream(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });

        let a = relay.subscribe();
        let b = relay.subscribe();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        a.cancel();
        b.cancel();
        let _c = relay.subscribe();
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let relay = Relay::new();
        let updates = relay.subscribe();
        assert_eq!(relay.subscriber_count(), 1);

        drop(updates);
        relay.publish(1);
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn map_value_transforms_deliveries() {
        let relay = Relay::new();
        let mut doubled = relay.subscribe().map_value(|n: i32| n * 2);

        relay.publish(21);
        assert_eq!(doubled.next().await, Some(42));
    }
}
