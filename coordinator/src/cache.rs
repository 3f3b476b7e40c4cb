use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::thread::Builder;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use failure::ResultExt;
use slog::Logger;

use super::store::Store;
use super::ErrorKind;
use super::Result;

/// Locally maintained snapshot of a coordination store subtree.
///
/// A background thread re-reads the subtree on an interval and swaps the
/// snapshot atomically; readers never touch the store. The snapshot is
/// eventually consistent: admin flows that must observe their own writes
/// call `refresh()` after committing.
pub struct Cache {
    handle: Option<JoinHandle<()>>,
    logger: Logger,
    root: String,
    shutdown: Option<Sender<()>>,
    snapshot: Arc<RwLock<Snapshot>>,
    store: Arc<dyn Store>,
}

#[derive(Default)]
struct Snapshot {
    data: HashMap<String, Vec<u8>>,
    children: HashMap<String, Vec<String>>,
}

impl Cache {
    pub fn new(
        store: Arc<dyn Store>,
        root: String,
        refresh: Duration,
        logger: Logger,
    ) -> Result<Cache> {
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let (sender, receiver) = bounded(0);
        let thread = {
            let logger = logger.clone();
            let root = root.clone();
            let snapshot = Arc::clone(&snapshot);
            let store = Arc::clone(&store);
            Builder::new()
                .name("n:coordinator:cache".into())
                .spawn(move || {
                    loop {
                        match load_snapshot(store.as_ref(), &root) {
                            Ok(fresh) => {
                                let mut snapshot =
                                    snapshot.write().expect("cache snapshot lock poisoned");
                                *snapshot = fresh;
                            }
                            Err(error) => {
                                // Keep serving the previous snapshot.
                                warn!(
                                    logger, "Cache refresh failed";
                                    "root" => &root, "error" => %error,
                                );
                            }
                        };
                        match receiver.recv_timeout(refresh) {
                            Ok(()) => return,
                            Err(RecvTimeoutError::Disconnected) => return,
                            Err(RecvTimeoutError::Timeout) => (),
                        };
                    }
                })
                .context(ErrorKind::SpawnThread("coordinator cache"))?
        };
        Ok(Cache {
            handle: Some(thread),
            logger,
            root,
            shutdown: Some(sender),
            snapshot,
            store,
        })
    }

    /// Cached payload of a znode, if the snapshot has one.
    pub fn get_data(&self, path: &str) -> Option<Vec<u8>> {
        let snapshot = self.snapshot.read().expect("cache snapshot lock poisoned");
        snapshot.data.get(path).cloned()
    }

    /// Cached children names of a znode, or `default` when absent.
    pub fn get_children(&self, path: &str, default: Vec<String>) -> Vec<String> {
        let snapshot = self.snapshot.read().expect("cache snapshot lock poisoned");
        snapshot.children.get(path).cloned().unwrap_or(default)
    }

    /// Synchronously reload the snapshot from the store.
    pub fn refresh(&self) -> Result<()> {
        let fresh = load_snapshot(self.store.as_ref(), &self.root)?;
        let mut snapshot = self.snapshot.write().expect("cache snapshot lock poisoned");
        *snapshot = fresh;
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            drop(shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(self.logger, "Coordinator cache thread panicked");
            }
        }
    }
}

fn load_snapshot(store: &dyn Store, root: &str) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    if !store.exists(root)? {
        return Ok(snapshot);
    }
    let mut queue = vec![root.to_string()];
    while let Some(path) = queue.pop() {
        if let Some(data) = store.get(&path)? {
            if !data.is_empty() {
                snapshot.data.insert(path.clone(), data);
            }
        }
        let children = store.children(&path)?;
        for child in &children {
            queue.push(format!("{}/{}", path, child));
        }
        snapshot.children.insert(path, children);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use slog::Discard;
    use slog::Logger;

    use super::super::store::MemoryStore;
    use super::super::store::Store;
    use super::Cache;

    fn cache(store: &Arc<MemoryStore>) -> Cache {
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        Cache::new(
            store,
            "/needlestack".into(),
            Duration::from_secs(3600),
            Logger::root(Discard, o!()),
        )
        .unwrap()
    }

    #[test]
    fn serves_snapshot_after_refresh() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_path("/needlestack/c1/live_nodes").unwrap();
        store
            .create("/needlestack/c1/live_nodes/n1:50051", b"", true)
            .unwrap();
        let cache = cache(&store);
        cache.refresh().unwrap();
        assert_eq!(
            cache.get_children("/needlestack/c1/live_nodes", Vec::new()),
            vec!["n1:50051"]
        );
    }

    #[test]
    fn default_children_for_unknown_path() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store);
        cache.refresh().unwrap();
        let default = vec!["fallback".to_string()];
        assert_eq!(cache.get_children("/ghost", default.clone()), default);
    }

    #[test]
    fn stale_until_refreshed() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_path("/needlestack/node").unwrap();
        store.set("/needlestack/node", b"v1").unwrap();
        let cache = cache(&store);
        cache.refresh().unwrap();
        store.set("/needlestack/node", b"v2").unwrap();
        assert_eq!(cache.get_data("/needlestack/node").unwrap(), b"v1");
        cache.refresh().unwrap();
        assert_eq!(cache.get_data("/needlestack/node").unwrap(), b"v2");
    }
}
