//! Optional-unwrapping view with a last-present cache.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SharedError;
use crate::lock_unpoisoned;
use crate::reference::{RefId, SharedRead, SharedWrite};
use crate::relay::ValueStream;

/// View over a base reference holding `Option<T>` that never surfaces the
/// absent state to readers.
///
/// The last present value the base produced is cached behind the view's
/// own lock; while the base is absent, reads (and change deliveries)
/// serve the cache, and the cache is only ever written when the base
/// produces a present value. Before any present value has been seen the
/// cache holds the fallback supplied at construction.
pub struct Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    base: Arc<dyn SharedWrite<Option<T>>>,
    cache: Arc<Mutex<T>>,
}

impl<T> Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `base`, seeding the cache from its current value when present,
    /// else from `fallback`.
    pub fn new(base: Arc<dyn SharedWrite<Option<T>>>, fallback: T) -> Self {
        let seed = base.get().unwrap_or(fallback);
        Unwrapped {
            base,
            cache: Arc::new(Mutex::new(seed)),
        }
    }

    fn cached(&self) -> T {
        lock_unpoisoned(&self.cache).clone()
    }
}

impl<T> Clone for Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Unwrapped {
            base: self.base.clone(),
            cache: self.cache.clone(),
        }
    }
}

#[async_trait]
impl<T> SharedRead<T> for Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RefId {
        self.base.id()
    }

    fn get(&self) -> T {
        match self.base.get() {
            Some(value) => {
                *lock_unpoisoned(&self.cache) = value.clone();
                value
            }
            None => self.cached(),
        }
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn changes(&self) -> ValueStream<T> {
        let cache = self.cache.clone();
        self.base.changes().map_value(move |value| match value {
            Some(value) => {
                *lock_unpoisoned(&cache) = value.clone();
                value
            }
            None => lock_unpoisoned(&cache).clone(),
        })
    }

    fn changes_with_demand(&self, demand: usize) -> ValueStream<T> {
        let cache = self.cache.clone();
        self.base
            .changes_with_demand(demand)
            .map_value(move |value| match value {
                Some(value) => {
                    *lock_unpoisoned(&cache) = value.clone();
                    value
                }
                None => lock_unpoisoned(&cache).clone(),
            })
    }

    async fn load(&self) -> Result<(), SharedError> {
        self.base.load().await
    }
}

#[async_trait]
impl<T> SharedWrite<T> for Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn save_error(&self) -> Option<SharedError> {
        self.base.save_error()
    }

    /// Runs the body against the base's present value, or — if the base is
    /// absent at commit time — against a scratch copy of the cache whose
    /// result is discarded, so editing code never special-cases absence.
    fn update_mut(&self, body: &mut dyn FnMut(&mut T)) {
        let cache = &self.cache;
        self.base.update_mut(&mut |current| match current {
            Some(value) => {
                body(value);
                *lock_unpoisoned(cache) = value.clone();
            }
            None => {
                let mut scratch = lock_unpoisoned(cache).clone();
                body(&mut scratch);
            }
        });
    }

    async fn save(&self) -> Result<(), SharedError> {
        self.base.save().await
    }

    fn take_snapshot(&self, value: T) {
        self.base.take_snapshot(Some(value));
    }

    fn snapshot(&self) -> Option<T> {
        self.base.snapshot().flatten()
    }
}

impl<T> fmt::Debug for Unwrapped<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwrapped")
            .field("base", &self.base.id())
            .finish()
    }
}
