//! TOML-file persistence strategy for `sharedstate` references.
//!
//! `FileStore` persists one value as pretty-printed TOML at a path and
//! implements the [`Store`] interface: a missing file loads as absent,
//! saves write the whole document, and a filesystem watcher feeds
//! external edits back through the store subscription. The reference
//! subsystem itself never sees paths or bytes.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sharedstate::{
    LoadReason, SaveReason, Store, StoreError, StoreId, StoreSubscriber, StoreSubscription,
};

const FILE_HEADER: &str = "# Managed by filestore; external edits are picked up automatically.\n\n";

/// Persists a single TOML document at `path`.
///
/// Clones share the same path and self-write bookkeeping, so one store
/// can be handed to the subsystem while a test keeps another handle.
pub struct FileStore<T> {
    path: PathBuf,
    /// Saves announce themselves here so the watcher can swallow the echo
    /// of this process's own writes. Best effort: platforms that emit
    /// several events per write still cause one redundant (identical)
    /// reload.
    pending_self_events: Arc<AtomicUsize>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for FileStore<T> {
    fn clone(&self) -> Self {
        FileStore {
            path: self.path.clone(),
            pending_self_events: self.pending_self_events.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> FileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore {
            path: path.into(),
            pending_self_events: Arc::new(AtomicUsize::new(0)),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[async_trait]
impl<T> Store<T> for FileStore<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn id(&self) -> StoreId {
        StoreId::new(format!("file:{}", self.path.display()))
    }

    async fn load(&self, _reason: LoadReason) -> Result<Option<T>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => toml::from_str::<T>(&content)
                .map(Some)
                .map_err(|e| StoreError::Codec(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn save(&self, value: &T, _reason: SaveReason) -> Result<(), StoreError> {
        let body =
            toml::to_string_pretty(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }
        self.pending_self_events.fetch_add(1, Ordering::SeqCst);
        let written = tokio::fs::write(&self.path, format!("{FILE_HEADER}{body}")).await;
        if let Err(e) = written {
            // Nothing hit the disk; take the announcement back.
            let _ = self.pending_self_events.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| n.checked_sub(1),
            );
            return Err(StoreError::Io(e.to_string()));
        }
        log::debug!("saved {}", self.path.display());
        Ok(())
    }

    fn subscribe(&self, subscriber: StoreSubscriber<T>) -> StoreSubscription {
        let watch_dir = self.watch_dir();
        let file_name = self.path.file_name().map(|name| name.to_os_string());
        let pending = self.pending_self_events.clone();
        let path = self.path.clone();

        let callback = move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("watch error on {}: {e}", path.display());
                    return;
                }
            };
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
            if !relevant {
                return;
            }
            let own_write = pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if own_write {
                return;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str::<T>(&content) {
                    Ok(value) => subscriber.notify_value(Some(value)),
                    Err(e) => {
                        // Half-written or hand-mangled file; keep the last
                        // good value until the next parsable state.
                        log::warn!("ignoring unparsable update to {}: {e}", path.display())
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => subscriber.notify_value(None),
                Err(e) => log::warn!("failed to re-read {}: {e}", path.display()),
            }
        };

        let mut watcher = match notify::recommended_watcher(callback) {
            Ok(watcher) => watcher,
            Err(e) => {
                log::warn!("cannot create watcher for {}: {e}", watch_dir.display());
                return StoreSubscription::detached();
            }
        };
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            log::warn!("cannot watch {}: {e}", watch_dir.display());
            return StoreSubscription::detached();
        }
        StoreSubscription::new(move || drop(watcher))
    }
}

impl<T> std::fmt::Debug for FileStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sharedstate::{Context, SharedRead, SharedWriteExt};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        font_size: u32,
    }

    fn prefs() -> Prefs {
        Prefs {
            theme: "dark".to_string(),
            font_size: 14,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Prefs>::new(dir.path().join("prefs.toml"));

        assert_eq!(store.load(LoadReason::Initial).await.unwrap(), None);

        store.save(&prefs(), SaveReason::Explicit).await.unwrap();
        let loaded = store.load(LoadReason::Explicit).await.unwrap();
        assert_eq!(loaded, Some(prefs()));

        // The header comment is valid TOML and survives parsing.
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with("# Managed by filestore"));
        assert!(content.contains("font_size = 14"));
    }

    #[tokio::test]
    async fn unparsable_content_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "not [valid toml").unwrap();

        let store = FileStore::<Prefs>::new(path);
        match store.load(LoadReason::Initial).await {
            Err(StoreError::Codec(_)) => {}
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn external_writes_reach_the_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.toml");
        let store = FileStore::<Prefs>::new(&path);

        let seen: Arc<Mutex<Vec<Option<Prefs>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let _subscription = store.subscribe(StoreSubscriber::values_only(move |value| {
            seen_in_cb.lock().unwrap().push(value);
        }));

        // Simulate another process writing the file.
        let external = Prefs {
            theme: "light".to_string(),
            font_size: 11,
        };
        std::fs::write(&path, toml::to_string_pretty(&external).unwrap()).unwrap();

        let expected = external.clone();
        wait_for(|| {
            seen.lock()
                .unwrap()
                .iter()
                .any(|value| value.as_ref() == Some(&expected))
        })
        .await;
    }

    #[tokio::test]
    async fn own_saves_do_not_echo_a_different_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Prefs>::new(dir.path().join("echo.toml"));

        let seen: Arc<Mutex<Vec<Option<Prefs>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = seen.clone();
        let _subscription = store.subscribe(StoreSubscriber::values_only(move |value| {
            seen_in_cb.lock().unwrap().push(value);
        }));

        store.save(&prefs(), SaveReason::Mutation).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Echo suppression is best effort; anything that does come
        // through must be the value we just wrote.
        for value in seen.lock().unwrap().iter() {
            assert_eq!(value.as_ref(), Some(&prefs()));
        }
    }

    #[tokio::test]
    async fn stored_reference_persists_and_follows_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stored.toml");
        let store = FileStore::<Prefs>::new(&path);

        let ctx = Context::new();
        let stored = ctx.stored(Arc::new(store.clone()), prefs());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A mutation ends up on disk without an explicit save.
        stored.update(|p| p.font_size = 20);
        wait_for(|| {
            std::fs::read_to_string(&path)
                .map(|content| content.contains("font_size = 20"))
                .unwrap_or(false)
        })
        .await;

        // An external rewrite flows back into the reference.
        let external = Prefs {
            theme: "solarized".to_string(),
            font_size: 9,
        };
        std::fs::write(&path, toml::to_string_pretty(&external).unwrap()).unwrap();
        wait_for(|| stored.get() == external).await;
        assert_eq!(stored.load_error(), None);
    }
}
