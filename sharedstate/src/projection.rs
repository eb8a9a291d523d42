//! Field projection over a mutable base reference.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SharedError;
use crate::reference::{RefId, SharedRead, SharedWrite};
use crate::relay::ValueStream;

/// Writable view of one field of a base reference's value.
///
/// The projection owns no value of its own: identity, locking, loading,
/// saving and snapshots all delegate to the base, so every consumer of
/// the base (and of sibling projections) observes a single source of
/// truth. Mutations rewrite only the projected field in place, inside the
/// base's lock.
pub struct Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    base: Arc<dyn SharedWrite<B>>,
    get: Arc<dyn Fn(&B) -> T + Send + Sync>,
    set: Arc<dyn Fn(&mut B, T) + Send + Sync>,
}

impl<B, T> Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Project the field read by `get` and written by `set`.
    pub fn new(
        base: Arc<dyn SharedWrite<B>>,
        get: impl Fn(&B) -> T + Send + Sync + 'static,
        set: impl Fn(&mut B, T) + Send + Sync + 'static,
    ) -> Self {
        Projection {
            base,
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }
}

impl<B, T> Clone for Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Projection {
            base: self.base.clone(),
            get: self.get.clone(),
            set: self.set.clone(),
        }
    }
}

#[async_trait]
impl<B, T> SharedRead<T> for Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RefId {
        self.base.id()
    }

    fn get(&self) -> T {
        (self.get)(&self.base.get())
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn changes(&self) -> ValueStream<T> {
        let get = self.get.clone();
        self.base.changes().map_value(move |base| get(&base))
    }

    fn changes_with_demand(&self, demand: usize) -> ValueStream<T> {
        let get = self.get.clone();
        self.base
            .changes_with_demand(demand)
            .map_value(move |base| get(&base))
    }

    async fn load(&self) -> Result<(), SharedError> {
        self.base.load().await
    }
}

#[async_trait]
impl<B, T> SharedWrite<T> for Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn save_error(&self) -> Option<SharedError> {
        self.base.save_error()
    }

    fn update_mut(&self, body: &mut dyn FnMut(&mut T)) {
        let get = &self.get;
        let set = &self.set;
        self.base.update_mut(&mut |base| {
            let mut field = get(base);
            body(&mut field);
            set(base, field);
        });
    }

    async fn save(&self) -> Result<(), SharedError> {
        self.base.save().await
    }

    /// Snapshots are keyed by the base's identity, so the whole structure
    /// is rebuilt — existing snapshot (else current value) with the
    /// projected field replaced — and resubmitted to the base.
    fn take_snapshot(&self, value: T) {
        let mut whole = self.base.snapshot().unwrap_or_else(|| self.base.get());
        (self.set)(&mut whole, value);
        self.base.take_snapshot(whole);
    }

    fn snapshot(&self) -> Option<T> {
        self.base.snapshot().map(|whole| (self.get)(&whole))
    }
}

impl<B, T> fmt::Debug for Projection<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("base", &self.base.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::atom::Atom;
    use crate::reference::SharedWriteExt;
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    fn settings() -> Settings {
        Settings {
            theme: "dark".to_string(),
            font_size: 14,
        }
    }

    fn font_size_of(base: &Arc<Atom<Settings>>) -> Projection<Settings, u32> {
        Projection::new(
            base.clone() as Arc<dyn SharedWrite<Settings>>,
            |s: &Settings| s.font_size,
            |s: &mut Settings, size| s.font_size = size,
        )
    }

    #[tokio::test]
    async fn writes_touch_only_the_projected_field() {
        let base = Arc::new(Atom::new(settings()));
        let font_size = font_size_of(&base);

        font_size.set(18);

        assert_eq!(font_size.get(), 18);
        let whole = base.get();
        assert_eq!(whole.font_size, 18);
        assert_eq!(whole.theme, "dark");
    }

    #[tokio::test]
    async fn identity_and_changes_follow_the_base() {
        let base = Arc::new(Atom::new(settings()));
        let font_size = font_size_of(&base);
        assert_eq!(font_size.id(), base.id());

        let mut updates = font_size.changes();
        assert_eq!(updates.next().await, Some(14));

        // Mutating through the base is visible through the projection.
        base.update(|s| s.font_size = 20);
        assert_eq!(updates.next().await, Some(20));
    }

    #[tokio::test]
    async fn snapshot_rebuilds_the_whole_structure() {
        let ctx = Context::new();
        let base = Arc::new(ctx.atom(settings()));
        let font_size = font_size_of(&base);

        font_size.take_snapshot(99);

        let whole = base.snapshot().unwrap();
        assert_eq!(whole.font_size, 99);
        assert_eq!(whole.theme, "dark");
        assert_eq!(font_size.snapshot(), Some(99));

        // A second projected snapshot layers onto the existing one.
        let theme = Projection::new(
            base.clone() as Arc<dyn SharedWrite<Settings>>,
            |s: &Settings| s.theme.clone(),
            |s: &mut Settings, theme| s.theme = theme,
        );
        theme.take_snapshot("light".to_string());
        let whole = base.snapshot().unwrap();
        assert_eq!(whole.font_size, 99);
        assert_eq!(whole.theme, "light");
    }
}
