//! Unkeyed in-memory shared cell.
//!
//! `Atom` is the reference flavor with no persistence backing: a value
//! behind its own lock plus a relay for observers. Ownership is ordinary
//! shared ownership — clone it (or wrap it in `Arc` for dyn use) and drop
//! it like any other value; the registry is not involved.

use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::context::ContextInner;
use crate::error::SharedError;
use crate::lock_unpoisoned;
use crate::reference::{RefId, SharedRead, SharedWrite};
use crate::relay::{Relay, ValueStream};

/// In-memory shared cell with stable identity and observable changes.
///
/// # Examples
///
/// ```
/// use sharedstate::{Atom, SharedRead, SharedWriteExt};
///
/// let counter = Atom::new(0);
/// counter.set(5);
/// counter.update(|n| *n += 1);
/// assert_eq!(counter.get(), 6);
/// ```
pub struct Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<AtomInner<T>>,
}

struct AtomInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: RefId,
    value: Mutex<T>,
    relay: Relay<T>,
    ctx: Option<Arc<ContextInner>>,
}

impl<T> Clone for Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Atom {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A standalone cell. Without a [`Context`](crate::Context) it has no
    /// snapshot table: snapshots taken on it are discarded.
    pub fn new(initial: T) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id: RefId::next(),
                value: Mutex::new(initial),
                relay: Relay::new(),
                ctx: None,
            }),
        }
    }

    pub(crate) fn with_context(initial: T, ctx: Arc<ContextInner>) -> Self {
        Atom {
            inner: Arc::new(AtomInner {
                id: RefId::next(),
                value: Mutex::new(initial),
                relay: Relay::new(),
                ctx: Some(ctx),
            }),
        }
    }

    fn publish(&self, value: T) {
        let asserting = self
            .inner
            .ctx
            .as_ref()
            .is_some_and(|ctx| ctx.is_asserting());
        if !asserting {
            self.inner.relay.publish(value);
        }
    }
}

impl Atom<bool> {
    /// Flip the boolean in place.
    pub fn toggle(&self) {
        self.update_mut(&mut |value| *value = !*value);
    }
}

#[async_trait]
impl<T> SharedRead<T> for Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RefId {
        self.inner.id
    }

    fn get(&self) -> T {
        let value = lock_unpoisoned(&self.inner.value).clone();
        if let Some(ctx) = &self.inner.ctx {
            ctx.track_access(self.inner.id);
        }
        value
    }

    fn is_loading(&self) -> bool {
        false
    }

    fn load_error(&self) -> Option<SharedError> {
        None
    }

    fn changes(&self) -> ValueStream<T> {
        let current = lock_unpoisoned(&self.inner.value).clone();
        ValueStream::seeded(current, self.inner.relay.subscribe())
    }

    fn changes_with_demand(&self, demand: usize) -> ValueStream<T> {
        let current = lock_unpoisoned(&self.inner.value).clone();
        ValueStream::seeded(current, self.inner.relay.subscribe_with_demand(demand))
    }

    async fn load(&self) -> Result<(), SharedError> {
        Ok(())
    }
}

#[async_trait]
impl<T> SharedWrite<T> for Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn save_error(&self) -> Option<SharedError> {
        None
    }

    fn update_mut(&self, body: &mut dyn FnMut(&mut T)) {
        let new_value = {
            let mut value = lock_unpoisoned(&self.inner.value);
            body(&mut value);
            value.clone()
        };
        // Publish after the lock is released; observers reading back into
        // this cell cannot deadlock.
        self.publish(new_value);
        if let Some(ctx) = &self.inner.ctx {
            ctx.track_mutation(self.inner.id);
        }
    }

    async fn save(&self) -> Result<(), SharedError> {
        Ok(())
    }

    #[track_caller]
    fn take_snapshot(&self, value: T) {
        match &self.inner.ctx {
            Some(ctx) => ctx.save_snapshot(self.inner.id, Box::new(value), Location::caller()),
            None => log::debug!("snapshot for {} discarded: no context", self.inner.id),
        }
    }

    fn snapshot(&self) -> Option<T> {
        self.inner
            .ctx
            .as_ref()
            .and_then(|ctx| ctx.snapshot_value(self.inner.id))
    }
}

impl<T> Default for Atom<T>
where
    T: Clone + Send + Sync + Default + 'static,
{
    fn default() -> Self {
        Atom::new(T::default())
    }
}

impl<T> fmt::Debug for Atom<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.inner.id)
            .field("value", &*lock_unpoisoned(&self.inner.value))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::reference::SharedWriteExt;
    use futures::{FutureExt, StreamExt};

    #[tokio::test]
    async fn update_and_get_round_trip() {
        let cell = Atom::new(String::new());
        cell.set("initial".to_string());
        cell.update(|s| s.push_str("_test"));
        assert_eq!(cell.get(), "initial_test");
    }

    #[tokio::test]
    async fn replay_one_then_every_mutation_exactly_once() {
        let cell = Atom::new(0);
        cell.set(1);

        let mut updates = cell.changes();
        assert_eq!(updates.next().await, Some(1));

        cell.set(2);
        cell.set(3);
        cell.update(|n| *n += 10);

        assert_eq!(updates.next().await, Some(2));
        assert_eq!(updates.next().await, Some(3));
        assert_eq!(updates.next().await, Some(13));
        assert_eq!(updates.next().now_or_never(), None);
    }

    #[tokio::test]
    async fn clones_share_one_cell_and_identity() {
        let cell = Atom::new(7);
        let alias = cell.clone();
        assert_eq!(cell.id(), alias.id());

        alias.set(8);
        assert_eq!(cell.get(), 8);
    }

    #[tokio::test]
    async fn toggle_flips_boolean() {
        let flag = Atom::new(false);
        flag.toggle();
        assert!(flag.get());
        flag.toggle();
        assert!(!flag.get());
    }

    #[tokio::test]
    async fn snapshots_live_in_the_context_table() {
        let ctx = Context::new();
        let cell = ctx.atom(1);

        assert_eq!(cell.snapshot(), None);
        cell.take_snapshot(99);
        assert_eq!(cell.snapshot(), Some(99));
        assert_eq!(ctx.snapshot_of::<i32>(cell.id()), Some(99));
        let location = ctx.snapshot_location_of(cell.id()).unwrap();
        assert!(location.file().ends_with("atom.rs"));

        // The in-memory value is untouched by snapshots.
        assert_eq!(cell.get(), 1);
    }

    #[tokio::test]
    async fn asserting_suppresses_publication() {
        let ctx = Context::new();
        let cell = ctx.atom(0);
        let mut updates = cell.changes();
        assert_eq!(updates.next().await, Some(0));

        {
            let _guard = ctx.begin_asserting();
            cell.set(1);
        }
        assert_eq!(updates.next().now_or_never(), None);

        // The value itself still changed, and publication resumes.
        assert_eq!(cell.get(), 1);
        cell.set(2);
        assert_eq!(updates.next().await, Some(2));
    }

    #[tokio::test]
    async fn context_free_snapshot_is_discarded() {
        let cell = Atom::new(5);
        cell.take_snapshot(6);
        assert_eq!(cell.snapshot(), None);
    }
}
