//! Persistence-strategy interface and the in-memory test double.
//!
//! A [`Store`] is the narrow seam between the reference subsystem and
//! whatever actually holds the bytes: load and save a value, and feed
//! externally-observed changes back through a subscription. The persisted
//! layout is entirely the store's concern.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::lock_unpoisoned;

/// Identity of a persistence key. Two stores with equal ids address the
/// same logical state, and the registry deduplicates on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        StoreId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(id: &str) -> Self {
        StoreId::new(id)
    }
}

impl From<String> for StoreId {
    fn from(id: String) -> Self {
        StoreId::new(id)
    }
}

/// Why a load is happening; stores may use this to optimize (e.g. serve
/// an initial load from a warm cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReason {
    /// First load after construction.
    Initial,
    /// A caller explicitly asked to reload.
    Explicit,
    /// The store's own change feed reported an external write.
    ExternalChange,
}

/// Why a save is happening; stores may skip a redundant reload of their
/// own change feed after a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    /// Triggered by a locked mutation committing.
    Mutation,
    /// A caller explicitly awaited a save.
    Explicit,
}

/// Callbacks a store invokes when it observes the persisted value change
/// behind the subsystem's back.
pub struct StoreSubscriber<T> {
    on_value: Arc<dyn Fn(Option<T>) + Send + Sync>,
    on_loading: Arc<dyn Fn(bool) + Send + Sync>,
}

impl<T> StoreSubscriber<T> {
    pub fn new(
        on_value: impl Fn(Option<T>) + Send + Sync + 'static,
        on_loading: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        StoreSubscriber {
            on_value: Arc::new(on_value),
            on_loading: Arc::new(on_loading),
        }
    }

    /// Subscriber that ignores loading-state transitions.
    pub fn values_only(on_value: impl Fn(Option<T>) + Send + Sync + 'static) -> Self {
        StoreSubscriber::new(on_value, |_| {})
    }

    /// Deliver an externally-observed value change (`None` = the key no
    /// longer has a value).
    pub fn notify_value(&self, value: Option<T>) {
        (self.on_value)(value);
    }

    /// Signal transient unavailability of the backing medium.
    pub fn notify_loading(&self, loading: bool) {
        (self.on_loading)(loading);
    }
}

impl<T> Clone for StoreSubscriber<T> {
    fn clone(&self) -> Self {
        StoreSubscriber {
            on_value: self.on_value.clone(),
            on_loading: self.on_loading.clone(),
        }
    }
}

impl<T> fmt::Debug for StoreSubscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreSubscriber")
    }
}

/// Cancellable handle to a store's change feed. Cancels on drop; explicit
/// cancellation is idempotent.
pub struct StoreSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        StoreSubscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to cancel, for stores without a change
    /// feed.
    pub fn detached() -> Self {
        StoreSubscription { cancel: None }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreSubscription")
    }
}

/// Capability interface for a persistence key: opaque identity plus
/// read/write/subscribe over one value of type `T`.
///
/// `load` and `save` deliver their result exactly once per call.
#[async_trait]
pub trait Store<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Persistence-key identity used for registry deduplication.
    fn id(&self) -> StoreId;

    /// Read the persisted value; `Ok(None)` means the key has no value
    /// yet (callers keep their default).
    async fn load(&self, reason: LoadReason) -> Result<Option<T>, StoreError>;

    /// Write the value.
    async fn save(&self, value: &T, reason: SaveReason) -> Result<(), StoreError>;

    /// Register for externally-observed changes. The subscriber may be
    /// called zero or more times until the subscription is dropped.
    fn subscribe(&self, subscriber: StoreSubscriber<T>) -> StoreSubscription;
}

struct MemCell<T> {
    id: StoreId,
    slot: Mutex<Option<T>>,
    subscribers: Mutex<Vec<(u64, StoreSubscriber<T>)>>,
    next_subscriber: AtomicU64,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

/// In-memory [`Store`] for tests: a shared slot plus knobs for simulating
/// external writes, transient unavailability and injected failures.
///
/// Clones share the same slot, so a test can keep one handle for
/// inspection while handing another to the subsystem.
pub struct InMemoryStore<T> {
    cell: Arc<MemCell<T>>,
}

impl<T> Clone for InMemoryStore<T> {
    fn clone(&self) -> Self {
        InMemoryStore {
            cell: self.cell.clone(),
        }
    }
}

impl<T> InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// An empty store (loads report absent).
    pub fn new(id: impl Into<StoreId>) -> Self {
        InMemoryStore {
            cell: Arc::new(MemCell {
                id: id.into(),
                slot: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                fail_loads: AtomicBool::new(false),
                fail_saves: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
                saves: AtomicUsize::new(0),
            }),
        }
    }

    /// A store whose slot already holds `value`.
    pub fn with_value(id: impl Into<StoreId>, value: T) -> Self {
        let store = InMemoryStore::new(id);
        *lock_unpoisoned(&store.cell.slot) = Some(value);
        store
    }

    /// Simulate another process writing the key: updates the slot and
    /// notifies every subscriber.
    pub fn write_external(&self, value: T) {
        *lock_unpoisoned(&self.cell.slot) = Some(value.clone());
        for (_, subscriber) in lock_unpoisoned(&self.cell.subscribers).iter() {
            subscriber.notify_value(Some(value.clone()));
        }
    }

    /// Simulate the key being deleted externally.
    pub fn clear_external(&self) {
        *lock_unpoisoned(&self.cell.slot) = None;
        for (_, subscriber) in lock_unpoisoned(&self.cell.subscribers).iter() {
            subscriber.notify_value(None);
        }
    }

    /// Simulate the backing medium becoming (un)available.
    pub fn set_loading(&self, loading: bool) {
        for (_, subscriber) in lock_unpoisoned(&self.cell.subscribers).iter() {
            subscriber.notify_loading(loading);
        }
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.cell.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.cell.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// The value currently in the slot.
    pub fn stored_value(&self) -> Option<T> {
        lock_unpoisoned(&self.cell.slot).clone()
    }

    pub fn load_count(&self) -> usize {
        self.cell.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.cell.saves.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.cell.subscribers).len()
    }
}

#[async_trait]
impl<T> Store<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> StoreId {
        self.cell.id.clone()
    }

    async fn load(&self, _reason: LoadReason) -> Result<Option<T>, StoreError> {
        self.cell.loads.fetch_add(1, Ordering::SeqCst);
        if self.cell.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated load failure".to_string()));
        }
        Ok(lock_unpoisoned(&self.cell.slot).clone())
    }

    async fn save(&self, value: &T, _reason: SaveReason) -> Result<(), StoreError> {
        self.cell.saves.fetch_add(1, Ordering::SeqCst);
        if self.cell.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io("simulated save failure".to_string()));
        }
        // Local writes do not echo through the change feed; subscribers
        // only hear about external ones.
        *lock_unpoisoned(&self.cell.slot) = Some(value.clone());
        Ok(())
    }

    fn subscribe(&self, subscriber: StoreSubscriber<T>) -> StoreSubscription {
        let id = self.cell.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.cell.subscribers).push((id, subscriber));
        let cell = self.cell.clone();
        StoreSubscription::new(move || {
            lock_unpoisoned(&cell.subscribers).retain(|(sub_id, _)| *sub_id != id);
        })
    }
}

impl<T> fmt::Debug for InMemoryStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("id", &self.cell.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_save_round_trip() {
        let store = InMemoryStore::new("mem:test");
        assert_eq!(store.load(LoadReason::Initial).await, Ok(None));

        store.save(&42, SaveReason::Explicit).await.unwrap();
        assert_eq!(store.load(LoadReason::Explicit).await, Ok(Some(42)));
        assert_eq!(store.load_count(), 2);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let store = InMemoryStore::with_value("mem:fail", 1);
        store.set_fail_loads(true);
        assert!(store.load(LoadReason::Explicit).await.is_err());

        store.set_fail_saves(true);
        assert!(store.save(&2, SaveReason::Mutation).await.is_err());
        // The failed save must not have touched the slot.
        assert_eq!(store.stored_value(), Some(1));
    }

    #[tokio::test]
    async fn external_writes_reach_subscribers_but_local_saves_do_not() {
        let store = InMemoryStore::new("mem:subs");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let subscription = store.subscribe(StoreSubscriber::values_only(move |value| {
            seen_in_cb.lock().unwrap().push(value);
        }));

        store.save(&1, SaveReason::Mutation).await.unwrap();
        store.write_external(2);
        store.clear_external();

        assert_eq!(*seen.lock().unwrap(), vec![Some(2), None]);

        drop(subscription);
        assert_eq!(store.subscriber_count(), 0);
        store.write_external(3);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
