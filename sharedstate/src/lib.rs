//! Shared references with observable values and optional persistence.
//!
//! This crate is the synchronization and identity-management layer that
//! sits between persistence strategies and consumers: many independent
//! readers and writers observe and mutate a single logical piece of
//! state, optionally backed by an external store.
//!
//! # Core Components
//!
//! - **[`Relay`]** - Thread-safe, demand-aware broadcaster of change events
//! - **[`SharedRead`] / [`SharedWrite`]** - Reference contracts: stable
//!   identity, locked mutation, load/save semantics
//! - **[`Atom`]** - In-memory shared cell with no persistence backing
//! - **[`Stored`]** - Persistent reference bound to a [`Store`] key,
//!   deduplicated per key by the context's registry
//! - **[`Projection`] / [`Mapped`] / [`Unwrapped`]** - Derived references
//!   presenting transformed views while delegating to their base
//! - **[`Context`]** - Explicit ambient state: registry, snapshot table,
//!   assertion mode, change tracking
//!
//! # Architecture Principles
//!
//! 1. **One live instance per key** - concurrent requests for the same
//!    persistence key resolve to the same reference
//! 2. **Publish outside the lock** - observers are notified after a
//!    mutation's lock is released, and delivery only enqueues
//! 3. **Stale-but-available** - failed or absent loads keep the previous
//!    value; errors are sticky fields cleared by the next success
//! 4. **Derived references delegate** - identity, locking and persistence
//!    always belong to the base

pub mod atom;
pub mod context;
pub mod error;
pub mod mapped;
pub mod projection;
pub mod reference;
mod registry;
pub mod relay;
pub mod store;
pub mod stored;
pub mod unwrapped;

pub use atom::Atom;
pub use context::{AssertingGuard, ChangeTracker, Context, ContextBuilder};
pub use error::{SharedError, StoreError};
pub use mapped::Mapped;
pub use projection::Projection;
pub use reference::{RefId, SharedRead, SharedWrite, SharedWriteExt};
pub use relay::{Relay, SubscriptionHandle, ValueStream};
pub use store::{
    InMemoryStore, LoadReason, SaveReason, Store, StoreId, StoreSubscriber, StoreSubscription,
};
pub use stored::Stored;
pub use unwrapped::Unwrapped;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks ignoring poisoning: a panicking mutation body must not wedge
/// every later reader of the same cell.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
