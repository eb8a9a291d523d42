//! Keyed reference backed by a persistence store.
//!
//! `Stored` orchestrates the full lifecycle around one persistence key:
//! initial load at construction, externally-triggered updates through the
//! store's change feed, save-on-mutation, sticky error capture, and
//! teardown (subscription cancel + registry eviction) when the last owner
//! releases it. Instances are only created through
//! [`Context::stored`](crate::Context::stored), which deduplicates them
//! per key.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::context::ContextInner;
use crate::error::SharedError;
use crate::lock_unpoisoned;
use crate::reference::{RefId, SharedRead, SharedWrite};
use crate::relay::{Relay, ValueStream};
use crate::store::{LoadReason, SaveReason, Store, StoreId, StoreSubscriber, StoreSubscription};

/// Shared reference bound to a persistence key.
///
/// Lives behind `Arc`: the registry holds only a non-owning handle, and
/// the instance tears itself down when the last `Arc` drops.
pub struct Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: RefId,
    store: Arc<dyn Store<T>>,
    state: Mutex<StoredState<T>>,
    relay: Relay<T>,
    ctx: Arc<ContextInner>,
    runtime: tokio::runtime::Handle,
    subscription: Mutex<Option<StoreSubscription>>,
    weak_self: Weak<Stored<T>>,
}

struct StoredState<T> {
    value: T,
    is_loading: bool,
    load_error: Option<SharedError>,
    save_error: Option<SharedError>,
}

impl<T> Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Construct, attach the store's change feed, and (unless skipped)
    /// start the initial load. Registry-only entry point.
    ///
    /// Captures the current Tokio runtime for background loads and saves,
    /// so it must run inside one.
    pub(crate) fn spawn(
        ctx: Arc<ContextInner>,
        store: Arc<dyn Store<T>>,
        default: T,
        skip_initial_load: bool,
    ) -> Arc<Self> {
        let runtime = tokio::runtime::Handle::current();
        let this = Arc::new_cyclic(|weak: &Weak<Stored<T>>| Stored {
            id: RefId::next(),
            store,
            state: Mutex::new(StoredState {
                value: default,
                is_loading: !skip_initial_load,
                load_error: None,
                save_error: None,
            }),
            relay: Relay::new(),
            ctx,
            runtime,
            subscription: Mutex::new(None),
            weak_self: weak.clone(),
        });

        // The change feed is attached even when the initial load is
        // skipped; external writes must always reach a live instance.
        let on_value = {
            let weak = this.weak_self.clone();
            move |value: Option<T>| {
                if let Some(this) = weak.upgrade() {
                    this.apply_external(value);
                }
            }
        };
        let on_loading = {
            let weak = this.weak_self.clone();
            move |loading: bool| {
                if let Some(this) = weak.upgrade() {
                    lock_unpoisoned(&this.state).is_loading = loading;
                }
            }
        };
        let subscription = this.store.subscribe(StoreSubscriber::new(on_value, on_loading));
        *lock_unpoisoned(&this.subscription) = Some(subscription);

        if skip_initial_load {
            log::debug!("{} ready without initial load (key {})", this.id, this.key());
        } else {
            let task = this.clone();
            this.runtime.spawn(async move {
                if let Err(e) = task.load_with(LoadReason::Initial).await {
                    report_background_failure(task.id, &e);
                }
            });
        }
        this
    }

    /// The persistence-key identity this reference is bound to.
    pub fn key(&self) -> StoreId {
        self.store.id()
    }

    fn publish(&self, value: T) {
        if !self.ctx.is_asserting() {
            self.relay.publish(value);
        }
    }

    /// An external write observed by the store. A present value replaces
    /// the in-memory one directly; an absent one keeps the current value
    /// (stale-but-available, same policy as a failed load).
    fn apply_external(&self, value: Option<T>) {
        match value {
            Some(value) => {
                {
                    let mut state = lock_unpoisoned(&self.state);
                    state.value = value.clone();
                    state.load_error = None;
                }
                log::debug!("{} updated from external change (key {})", self.id, self.key());
                self.publish(value);
            }
            None => {
                log::debug!("{} keeps current value: key {} absent externally", self.id, self.key());
            }
        }
    }

    async fn load_with(&self, reason: LoadReason) -> Result<(), SharedError> {
        lock_unpoisoned(&self.state).is_loading = true;
        let result = self.store.load(reason).await;

        let mut publish = None;
        let outcome = {
            let mut state = lock_unpoisoned(&self.state);
            state.is_loading = false;
            match result {
                Ok(Some(value)) => {
                    state.value = value.clone();
                    state.load_error = None;
                    publish = Some(value);
                    Ok(())
                }
                // Absent key: keep the default/previous value.
                Ok(None) => {
                    state.load_error = None;
                    Ok(())
                }
                Err(e) => {
                    let error = SharedError::Load(e);
                    state.load_error = Some(error.clone());
                    Err(error)
                }
            }
        };
        if let Some(value) = publish {
            self.publish(value);
        }
        outcome
    }

    /// Fire-and-forget save of the post-mutation value; the outcome only
    /// touches `save_error`.
    fn spawn_save(&self, value: T) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            match this.store.save(&value, SaveReason::Mutation).await {
                Ok(()) => {
                    lock_unpoisoned(&this.state).save_error = None;
                }
                Err(e) => {
                    let error = SharedError::Save(e);
                    report_background_failure(this.id, &error);
                    lock_unpoisoned(&this.state).save_error = Some(error);
                }
            }
        });
    }
}

/// Unawaited load/save failures land in the sticky fields; debug builds
/// escalate them to the developer as well.
fn report_background_failure(id: RefId, error: &SharedError) {
    if cfg!(debug_assertions) {
        log::error!("background operation failed for {id}: {error}");
    } else {
        log::warn!("background operation failed for {id}: {error}");
    }
}

#[async_trait]
impl<T> SharedRead<T> for Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RefId {
        self.id
    }

    fn get(&self) -> T {
        let value = lock_unpoisoned(&self.state).value.clone();
        self.ctx.track_access(self.id);
        value
    }

    fn is_loading(&self) -> bool {
        lock_unpoisoned(&self.state).is_loading
    }

    fn load_error(&self) -> Option<SharedError> {
        lock_unpoisoned(&self.state).load_error.clone()
    }

    fn changes(&self) -> ValueStream<T> {
        let (current, loading) = {
            let state = lock_unpoisoned(&self.state);
            (state.value.clone(), state.is_loading)
        };
        let stream = self.relay.subscribe();
        // While a load is in flight the current value is about to be
        // replaced; new subscribers only get future changes then.
        if loading {
            stream
        } else {
            ValueStream::seeded(current, stream)
        }
    }

    fn changes_with_demand(&self, demand: usize) -> ValueStream<T> {
        let (current, loading) = {
            let state = lock_unpoisoned(&self.state);
            (state.value.clone(), state.is_loading)
        };
        let stream = self.relay.subscribe_with_demand(demand);
        if loading {
            stream
        } else {
            ValueStream::seeded(current, stream)
        }
    }

    async fn load(&self) -> Result<(), SharedError> {
        self.load_with(LoadReason::Explicit).await
    }
}

#[async_trait]
impl<T> SharedWrite<T> for Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn save_error(&self) -> Option<SharedError> {
        lock_unpoisoned(&self.state).save_error.clone()
    }

    fn update_mut(&self, body: &mut dyn FnMut(&mut T)) {
        let new_value = {
            let mut state = lock_unpoisoned(&self.state);
            body(&mut state.value);
            state.value.clone()
        };
        // Publish outside the lock, then hand the save to the runtime;
        // the mutation itself never waits on persistence.
        self.publish(new_value.clone());
        self.ctx.track_mutation(self.id);
        self.spawn_save(new_value);
    }

    async fn save(&self) -> Result<(), SharedError> {
        let value = lock_unpoisoned(&self.state).value.clone();
        match self.store.save(&value, SaveReason::Explicit).await {
            Ok(()) => {
                let mut state = lock_unpoisoned(&self.state);
                state.save_error = None;
                state.load_error = None;
                Ok(())
            }
            Err(e) => {
                let error = SharedError::Save(e);
                lock_unpoisoned(&self.state).save_error = Some(error.clone());
                Err(error)
            }
        }
    }

    #[track_caller]
    fn take_snapshot(&self, value: T) {
        self.ctx
            .save_snapshot(self.id, Box::new(value), Location::caller());
    }

    fn snapshot(&self) -> Option<T> {
        self.ctx.snapshot_value(self.id)
    }
}

impl<T> Drop for Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Last strong owner released: cancel the change feed, then evict
        // the registry entry (guarded by this instance's identity).
        if let Some(mut subscription) = lock_unpoisoned(&self.subscription).take() {
            subscription.cancel();
        }
        self.ctx.registry.remove(&self.store.id(), self.id);
        log::debug!("{} torn down (key {})", self.id, self.store.id());
    }
}

impl<T> fmt::Debug for Stored<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("Stored")
            .field("id", &self.id)
            .field("key", &self.store.id())
            .field("is_loading", &state.is_loading)
            .field("load_error", &state.load_error)
            .field("save_error", &state.save_error)
            .finish()
    }
}
