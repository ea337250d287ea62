//! Local file producer: a polling watcher over registered files.
//!
//! A file served through `get` is cached and registered for watching; while
//! the watch guarantees validity, repeated gets never stat the file. Each
//! poll tick compares filesystem mtimes against the cached ones, re-reads
//! changed files (`set` + publish `put`) and deletes vanished ones (`del` +
//! publish `delete`), which is what pushes invalidation into every resource
//! rendered from the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::bus::message::ChangeMessage;
use crate::store::error::StoreError;
use crate::store::lock::mutex_lock;
use crate::store::resource::Resource;
use crate::store::ResourceStore;

const SOURCE: &str = "proxy::local";

/// Builder tag recorded on resources this watcher creates.
pub const LOCAL_BUILDER: &str = "local";

struct WatcherInner {
    store: ResourceStore,
    /// Registered files and the filesystem mtime last folded into the store.
    watched: Mutex<HashMap<PathBuf, i64>>,
}

/// Polling filesystem watcher feeding the store.
#[derive(Clone)]
pub struct FileWatcher {
    inner: Arc<WatcherInner>,
}

impl FileWatcher {
    pub fn new(store: ResourceStore) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                store,
                watched: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start the background poll loop.
    pub fn spawn_poller(&self, interval: Duration) {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                watcher.poll_once().await;
            }
        });
    }

    /// Serve a file's cached payload, loading and registering it on miss.
    pub async fn get(&self, path: &Path) -> Result<Option<Bytes>, StoreError> {
        let key = key_for(path);
        match self.inner.store.get(&key).await {
            Ok(Some(res)) if res.valid && self.is_watched(path) => {
                // watched and valid: no stat needed
                return Ok(res.data);
            }
            Ok(_) => {}
            Err(err) => warn!(key, error = %err, "store read failed; reloading file"),
        }
        self.load(path).await
    }

    /// Register a file without reading it yet.
    pub fn watch(&self, path: &Path) {
        mutex_lock(&self.inner.watched, SOURCE, "watch")
            .entry(path.to_path_buf())
            .or_insert(0);
    }

    fn is_watched(&self, path: &Path) -> bool {
        mutex_lock(&self.inner.watched, SOURCE, "is_watched").contains_key(path)
    }

    async fn load(&self, path: &Path) -> Result<Option<Bytes>, StoreError> {
        let key = key_for(path);
        match tokio::fs::read(path).await {
            Ok(contents) => {
                let mtime = fs_mtime(path).await.unwrap_or(0);
                let data = Bytes::from(contents);
                let mut res = Resource::new(&key)
                    .with_data(data.clone())
                    .with_builder(LOCAL_BUILDER);
                res.mtime = mtime;
                if let Some(mime) = mime_guess::from_path(path).first() {
                    res.headers
                        .insert("content-type".to_string(), mime.essence_str().to_string());
                }
                self.inner.store.set(&key, res).await?;
                mutex_lock(&self.inner.watched, SOURCE, "load")
                    .insert(path.to_path_buf(), mtime);
                Ok(Some(data))
            }
            Err(err) => {
                debug!(key, error = %err, "file unreadable; dropping resource");
                self.inner.store.del(&key).await?;
                Err(StoreError::transient(err.to_string()))
            }
        }
    }

    /// One poll pass over every registered file.
    pub async fn poll_once(&self) {
        let snapshot: Vec<(PathBuf, i64)> = mutex_lock(&self.inner.watched, SOURCE, "poll")
            .iter()
            .map(|(path, mtime)| (path.clone(), *mtime))
            .collect();

        for (path, last) in snapshot {
            let key = key_for(&path);
            match fs_mtime(&path).await {
                Some(mtime) if mtime > last => {
                    debug!(key, "watched file changed");
                    match self.load(&path).await {
                        Ok(_) => self
                            .inner
                            .store
                            .publisher()
                            .send(ChangeMessage::put(&key).with_mtime(mtime)),
                        Err(err) => warn!(key, error = %err, "reload after change failed"),
                    }
                }
                Some(_) => {}
                None => {
                    debug!(key, "watched file vanished");
                    if let Err(err) = self.inner.store.del(&key).await {
                        warn!(key, error = %err, "delete after unlink failed");
                    }
                    self.inner
                        .store
                        .publisher()
                        .send(ChangeMessage::delete(&key));
                    mutex_lock(&self.inner.watched, SOURCE, "unlink").remove(&path);
                }
            }
        }
    }
}

fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn fs_mtime(path: &Path) -> Option<i64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::bus::client::Publisher;
    use crate::store::durable::DurableTier;
    use crate::store::StoreOptions;

    use super::*;

    async fn watcher() -> (FileWatcher, mpsc::UnboundedReceiver<ChangeMessage>) {
        let durable = DurableTier::connect("sqlite::memory:", 1)
            .await
            .expect("durable");
        let (publisher, rx) = Publisher::channel();
        let store = ResourceStore::new(durable, publisher, StoreOptions::default());
        (FileWatcher::new(store), rx)
    }

    #[tokio::test]
    async fn get_loads_and_caches_file() {
        let (watcher, _rx) = watcher().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>one</p>").expect("write");

        let data = watcher.get(&path).await.expect("get").expect("data");
        assert_eq!(&data[..], b"<p>one</p>");
        assert!(watcher.is_watched(&path));

        let key = key_for(&path);
        let cached = watcher
            .inner
            .store
            .get(&key)
            .await
            .expect("get")
            .expect("resource");
        assert_eq!(
            cached.headers.get("content-type").map(String::as_str),
            Some("text/html")
        );
        assert_eq!(cached.builder.as_deref(), Some(LOCAL_BUILDER));
    }

    #[tokio::test]
    async fn poll_detects_change_and_publishes() {
        let (watcher, mut rx) = watcher().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>one</p>").expect("write");

        watcher.get(&path).await.expect("get");

        // ensure the filesystem mtime moves forward
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&path, "<p>two</p>").expect("rewrite");

        watcher.poll_once().await;

        let msg = rx.try_recv().expect("published");
        assert_eq!(msg.key, key_for(&path));
        assert_eq!(msg.method, crate::bus::message::Method::Put);

        let data = watcher.get(&path).await.expect("get").expect("data");
        assert_eq!(&data[..], b"<p>two</p>");
    }

    #[tokio::test]
    async fn poll_detects_unlink_and_deletes() {
        let (watcher, mut rx) = watcher().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<p>one</p>").expect("write");

        watcher.get(&path).await.expect("get");
        std::fs::remove_file(&path).expect("unlink");

        watcher.poll_once().await;

        let msg = rx.try_recv().expect("published");
        assert_eq!(msg.method, crate::bus::message::Method::Delete);
        assert!(!watcher.is_watched(&path));

        let key = key_for(&path);
        assert!(watcher.inner.store.get(&key).await.expect("get").is_none());
    }
}
