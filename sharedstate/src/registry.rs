//! Deduplication of live persistent references by key identity.
//!
//! The registry maps each `StoreId` to a non-owning handle of the one
//! live `Stored` instance for that key. Entries are evicted from the
//! instance's own teardown, not by polling.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::context::ContextInner;
use crate::lock_unpoisoned;
use crate::reference::{RefId, SharedRead};
use crate::store::{Store, StoreId};
use crate::stored::Stored;

struct Entry {
    /// Identity of the instance that registered this entry. Eviction is
    /// guarded on it so a racing replacement is never removed.
    id: RefId,
    handle: Weak<dyn Any + Send + Sync>,
}

impl Entry {
    fn for_instance<T>(instance: &Arc<Stored<T>>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Entry {
            id: instance.id(),
            handle: Arc::downgrade(&(instance.clone() as Arc<dyn Any + Send + Sync>)),
        }
    }
}

pub(crate) struct Registry {
    entries: Mutex<IndexMap<StoreId, Entry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// The live instance for `store`'s key, or a freshly constructed one.
    ///
    /// Construction happens outside the registry lock (it may begin I/O),
    /// then the map is re-checked: if another caller registered an
    /// instance in the meantime, the fresh one is discarded and the
    /// winner returned. At most one instance per key ever becomes
    /// permanently registered.
    pub(crate) fn get_or_create<T>(
        ctx: &Arc<ContextInner>,
        store: Arc<dyn Store<T>>,
        default: T,
        skip_initial_load: bool,
    ) -> Arc<Stored<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = store.id();
        if let Some(existing) = ctx.registry.live_entry::<T>(&key) {
            return existing;
        }

        // Construct outside the registry lock; construction may begin I/O.
        let fresh = Stored::spawn(ctx.clone(), store, default, skip_initial_load);

        // Double-check under the lock: insert the fresh instance, or keep
        // the one a concurrent caller registered first. Arcs taken out of
        // the map are only dropped after the lock is released — a final
        // teardown re-enters the registry.
        let racing = {
            let mut entries = lock_unpoisoned(&ctx.registry.entries);
            let racing = entries.get(&key).and_then(|entry| entry.handle.upgrade());
            if racing.is_none() {
                entries.insert(key.clone(), Entry::for_instance(&fresh));
            }
            racing
        };

        match racing {
            None => fresh,
            Some(winner) => match winner.downcast::<Stored<T>>() {
                Ok(existing) => {
                    log::debug!("discarding racing construction for key {key}");
                    drop(fresh);
                    existing
                }
                Err(_) => {
                    // Same key registered under a different value type;
                    // pathological, but keep the registry usable.
                    log::warn!("key {key} was registered with a different value type; replacing");
                    let mut entries = lock_unpoisoned(&ctx.registry.entries);
                    entries.insert(key, Entry::for_instance(&fresh));
                    drop(entries);
                    fresh
                }
            },
        }
    }

    fn live_entry<T>(&self, key: &StoreId) -> Option<Arc<Stored<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let strong = {
            let entries = lock_unpoisoned(&self.entries);
            entries.get(key).and_then(|entry| entry.handle.upgrade())
        };
        strong.and_then(|any| any.downcast::<Stored<T>>().ok())
    }

    /// Evict `key` if it is still registered to the instance `id`;
    /// invoked from that instance's teardown.
    pub(crate) fn remove(&self, key: &StoreId, id: RefId) {
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.shift_remove(key);
            log::debug!("registry entry for key {key} evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::reference::SharedRead;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_resolve_to_one_instance() {
        let ctx = Context::new();
        let store = InMemoryStore::with_value("reg:concurrent", 1);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ctx = ctx.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                ctx.stored(Arc::new(store), 0).id()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn same_key_returns_same_instance_while_alive() {
        let ctx = Context::new();
        let store = InMemoryStore::with_value("reg:same", 1);

        let first = ctx.stored(Arc::new(store.clone()), 0);
        let second = ctx.stored(Arc::new(store.clone()), 0);
        assert_eq!(first.id(), second.id());
        assert!(Arc::ptr_eq(&first, &second));

        let other = ctx.stored(Arc::new(InMemoryStore::with_value("reg:other", 2)), 0);
        assert_ne!(first.id(), other.id());
    }

    #[tokio::test]
    async fn eviction_allows_a_fresh_instance_with_a_fresh_load() {
        let ctx = Context::new();
        let store = InMemoryStore::with_value("reg:evict", 1);

        let first = ctx.stored(Arc::new(store.clone()), 0);
        let first_id = first.id();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.load_count(), 1);
        assert_eq!(store.subscriber_count(), 1);

        drop(first);
        assert_eq!(store.subscriber_count(), 0);

        let second = ctx.stored(Arc::new(store.clone()), 0);
        assert_ne!(second.id(), first_id);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.load_count(), 2);
    }
}
