//! Explicit ambient context threaded through reference constructors.
//!
//! The context replaces implicit global lookups with one object carrying
//! the registry of live keyed references, the snapshot table used by test
//! assertions, the assertion-mode flag, and the optional change tracker
//! whose bookkeeping runs on a dedicated coordination thread.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use crate::atom::Atom;
use crate::lock_unpoisoned;
use crate::reference::RefId;
use crate::registry::Registry;
use crate::store::Store;
use crate::stored::Stored;

/// External change-notification registrar.
///
/// `did_access` records that a reader depends on a value; `did_mutate`
/// records a committed mutation. Both are opaque side effects invoked on
/// the context's coordination thread — value correctness never depends on
/// them having run.
pub trait ChangeTracker: Send + Sync {
    fn did_access(&self, id: RefId);
    fn did_mutate(&self, id: RefId);
}

type Job = Box<dyn FnOnce() + Send>;

/// Single dedicated thread the tracker bookkeeping is affine to.
struct Coordinator {
    tx: Mutex<mpsc::Sender<Job>>,
}

impl Coordinator {
    fn spawn() -> Option<Coordinator> {
        let (tx, rx) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("sharedstate-coordination".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        match spawned {
            Ok(_) => Some(Coordinator { tx: Mutex::new(tx) }),
            Err(e) => {
                log::error!("failed to start coordination thread: {e}");
                None
            }
        }
    }

    fn dispatch(&self, job: Job) {
        if lock_unpoisoned(&self.tx).send(job).is_err() {
            log::warn!("coordination thread is gone; tracker call skipped");
        }
    }
}

struct SnapshotEntry {
    value: Box<dyn Any + Send>,
    location: &'static Location<'static>,
}

pub(crate) struct ContextInner {
    pub(crate) registry: Registry,
    snapshots: Mutex<HashMap<RefId, SnapshotEntry>>,
    asserting: AtomicUsize,
    tracker: Option<Arc<dyn ChangeTracker>>,
    coordinator: Option<Coordinator>,
}

impl ContextInner {
    pub(crate) fn is_asserting(&self) -> bool {
        self.asserting.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn track_access(&self, id: RefId) {
        if let Some(tracker) = &self.tracker {
            let tracker = tracker.clone();
            self.dispatch(Box::new(move || tracker.did_access(id)));
        }
    }

    pub(crate) fn track_mutation(&self, id: RefId) {
        if let Some(tracker) = &self.tracker {
            let tracker = tracker.clone();
            self.dispatch(Box::new(move || tracker.did_mutate(id)));
        }
    }

    fn dispatch(&self, job: Job) {
        match &self.coordinator {
            Some(coordinator) => coordinator.dispatch(job),
            // Coordination thread could not be started; run inline rather
            // than lose the bookkeeping entirely.
            None => job(),
        }
    }

    pub(crate) fn save_snapshot(
        &self,
        id: RefId,
        value: Box<dyn Any + Send>,
        location: &'static Location<'static>,
    ) {
        log::debug!("snapshot recorded for {id} at {location}");
        lock_unpoisoned(&self.snapshots).insert(id, SnapshotEntry { value, location });
    }

    pub(crate) fn snapshot_value<T>(&self, id: RefId) -> Option<T>
    where
        T: Clone + 'static,
    {
        let snapshots = lock_unpoisoned(&self.snapshots);
        snapshots
            .get(&id)
            .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
    }

    pub(crate) fn snapshot_location(&self, id: RefId) -> Option<&'static Location<'static>> {
        lock_unpoisoned(&self.snapshots)
            .get(&id)
            .map(|entry| entry.location)
    }
}

/// Handle to the shared ambient state. Cheap to clone; all references
/// built from the same context share one registry and snapshot table.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context with no change tracker.
    pub fn new() -> Self {
        Context::builder().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder { tracker: None }
    }

    /// An unkeyed in-memory shared cell (see [`Atom`]).
    pub fn atom<T>(&self, initial: T) -> Atom<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Atom::with_context(initial, self.inner.clone())
    }

    /// The live persistent reference for `store`'s key, constructing it
    /// (and starting its initial load) if none exists. Concurrent requests
    /// for the same key resolve to the same instance.
    ///
    /// Must be called within a Tokio runtime; loads and saves run on it.
    pub fn stored<T>(&self, store: Arc<dyn Store<T>>, default: T) -> Arc<Stored<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Registry::get_or_create(&self.inner, store, default, false)
    }

    /// Like [`Context::stored`], but skips the initial load: the reference
    /// starts Ready with `default` while still subscribing to the store's
    /// external-change feed.
    pub fn stored_without_load<T>(&self, store: Arc<dyn Store<T>>, default: T) -> Arc<Stored<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Registry::get_or_create(&self.inner, store, default, true)
    }

    /// Whether a snapshot assertion is active. While true, ordinary change
    /// publication is suppressed so simulated writes don't trigger real
    /// observers.
    pub fn is_asserting(&self) -> bool {
        self.inner.is_asserting()
    }

    /// Enter assertion mode until the returned guard is dropped. Guards
    /// nest.
    pub fn begin_asserting(&self) -> AssertingGuard {
        self.inner.asserting.fetch_add(1, Ordering::SeqCst);
        AssertingGuard {
            inner: self.inner.clone(),
        }
    }

    /// The snapshot recorded for `id`, if any.
    pub fn snapshot_of<T>(&self, id: RefId) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.inner.snapshot_value(id)
    }

    /// Source location of the call that recorded the snapshot for `id` —
    /// points a failing assertion back at the simulated write.
    pub fn snapshot_location_of(&self, id: RefId) -> Option<&'static Location<'static>> {
        self.inner.snapshot_location(id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("asserting", &self.is_asserting())
            .finish()
    }
}

pub struct ContextBuilder {
    tracker: Option<Arc<dyn ChangeTracker>>,
}

impl ContextBuilder {
    /// Install a change tracker; its calls are dispatched to the context's
    /// coordination thread.
    pub fn tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Context {
        let coordinator = self.tracker.as_ref().and_then(|_| Coordinator::spawn());
        Context {
            inner: Arc::new(ContextInner {
                registry: Registry::new(),
                snapshots: Mutex::new(HashMap::new()),
                asserting: AtomicUsize::new(0),
                tracker: self.tracker,
                coordinator,
            }),
        }
    }
}

/// RAII guard for assertion mode; see [`Context::begin_asserting`].
pub struct AssertingGuard {
    inner: Arc<ContextInner>,
}

impl Drop for AssertingGuard {
    fn drop(&mut self) {
        self.inner.asserting.fetch_sub(1, Ordering::SeqCst);
    }
}
