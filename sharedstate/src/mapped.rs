//! Read-only transformed view of a base reference.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SharedError;
use crate::reference::{RefId, SharedRead};
use crate::relay::ValueStream;

/// Read-only view applying a pure transform to a base reference's value.
///
/// Loading, error state and reloads delegate to the base. The transform
/// need not be injective, so a `Mapped` offers no identity comparison of
/// its own — `id()` reports the base's identity for bookkeeping only.
pub struct Mapped<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    base: Arc<dyn SharedRead<B>>,
    map: Arc<dyn Fn(&B) -> T + Send + Sync>,
}

impl<B, T> Mapped<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(base: Arc<dyn SharedRead<B>>, map: impl Fn(&B) -> T + Send + Sync + 'static) -> Self {
        Mapped {
            base,
            map: Arc::new(map),
        }
    }
}

impl<B, T> Clone for Mapped<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Mapped {
            base: self.base.clone(),
            map: self.map.clone(),
        }
    }
}

#[async_trait]
impl<B, T> SharedRead<T> for Mapped<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> RefId {
        self.base.id()
    }

    fn get(&self) -> T {
        (self.map)(&self.base.get())
    }

    fn is_loading(&self) -> bool {
        self.base.is_loading()
    }

    fn load_error(&self) -> Option<SharedError> {
        self.base.load_error()
    }

    fn changes(&self) -> ValueStream<T> {
        let map = self.map.clone();
        self.base.changes().map_value(move |base| map(&base))
    }

    fn changes_with_demand(&self, demand: usize) -> ValueStream<T> {
        let map = self.map.clone();
        self.base
            .changes_with_demand(demand)
            .map_value(move |base| map(&base))
    }

    async fn load(&self) -> Result<(), SharedError> {
        self.base.load().await
    }
}

impl<B, T> fmt::Debug for Mapped<B, T>
where
    B: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapped").field("base", &self.base.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::reference::SharedWriteExt;
    use futures::StreamExt;

    #[tokio::test]
    async fn reads_and_changes_are_transformed() {
        let base = Arc::new(Atom::new("hello".to_string()));
        let length = Mapped::new(base.clone() as Arc<dyn SharedRead<String>>, |s: &String| {
            s.len()
        });

        assert_eq!(length.get(), 5);

        let mut updates = length.changes();
        assert_eq!(updates.next().await, Some(5));

        base.set("hello world".to_string());
        assert_eq!(updates.next().await, Some(11));
    }
}
