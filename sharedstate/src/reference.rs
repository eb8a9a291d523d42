//! Reference contracts: stable identity plus observable, lockable values.
//!
//! `SharedRead` is the base capability set (identity, current value,
//! loading/error state, change stream); `SharedWrite` extends it with
//! locked mutation, save semantics and snapshot support. Both are
//! dyn-compatible so derived references can hold `Arc<dyn SharedWrite<_>>`
//! bases — a closed interface rather than open subclassing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::SharedError;
use crate::relay::ValueStream;

/// Opaque, process-wide unique identity of a reference.
///
/// Stable for the instance's lifetime; derived references report their
/// base's identity. A keyed reference constructed after its predecessor
/// was evicted gets a fresh identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u64);

impl RefId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RefId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Read side of a reference: stable identity wrapping an observable value.
#[async_trait]
pub trait SharedRead<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Identity, stable for this instance's lifetime.
    fn id(&self) -> RefId;

    /// Current value: lock, clone, release. Reading registers an access
    /// with the context's change tracker when one is configured.
    fn get(&self) -> T;

    /// Whether a load is in flight.
    fn is_loading(&self) -> bool;

    /// The most recent load failure, cleared by the next successful load.
    fn load_error(&self) -> Option<SharedError>;

    /// Change stream with unlimited demand. The value current at
    /// subscription time is delivered first (replay-one), unless a load
    /// is in flight.
    fn changes(&self) -> ValueStream<T>;

    /// Change stream holding at most `demand` undelivered values; the
    /// replayed current value does not count against the demand.
    fn changes_with_demand(&self, demand: usize) -> ValueStream<T>;

    /// Reload from the backing store, if any. Failure sets `load_error`
    /// and leaves the previous value intact. Concurrent loads all run;
    /// the last writer wins.
    async fn load(&self) -> Result<(), SharedError>;
}

/// Write side of a reference: locked in-place mutation plus persistence.
#[async_trait]
pub trait SharedWrite<T>: SharedRead<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The most recent save failure, cleared by the next successful save.
    fn save_error(&self) -> Option<SharedError>;

    /// Mutate the value while holding its lock. The change event is
    /// published right after the lock is released, and for persistent
    /// references the post-mutation value is saved in the background
    /// (outcome observable via [`SharedWrite::save_error`]).
    ///
    /// [`SharedWriteExt::update`] is the ergonomic closure form.
    fn update_mut(&self, body: &mut dyn FnMut(&mut T));

    /// Persist the current value and wait for the outcome. Success clears
    /// both `save_error` and `load_error`; failure sets `save_error` and
    /// returns the error.
    async fn save(&self) -> Result<(), SharedError>;

    /// Record `value` in the context's snapshot table under this
    /// reference's identity, for test assertions about what would have
    /// been persisted.
    #[track_caller]
    fn take_snapshot(&self, value: T);

    /// Read back the snapshot recorded for this reference, if any.
    fn snapshot(&self) -> Option<T>;
}

/// Ergonomic helpers layered over [`SharedWrite::update_mut`].
pub trait SharedWriteExt<T>: SharedWrite<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Locked mutation with a result value.
    fn update<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let mut body = Some(body);
        let mut out = None;
        self.update_mut(&mut |value| {
            if let Some(body) = body.take() {
                out = Some(body(value));
            }
        });
        out.expect("update body runs exactly once")
    }

    /// Replace the value wholesale.
    fn set(&self, value: T) {
        let mut value = Some(value);
        self.update_mut(&mut |current| {
            if let Some(value) = value.take() {
                *current = value;
            }
        });
    }
}

impl<T, S> SharedWriteExt<T> for S
where
    T: Clone + Send + Sync + 'static,
    S: SharedWrite<T> + ?Sized,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = RefId::next();
        let b = RefId::next();
        assert_ne!(a, b);
        assert!(a < b);
        assert!(a.to_string().starts_with("ref#"));
    }
}
