use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::RwLock;

use failure::ResultExt;
use slog::Logger;

use needlestack_coordinator::ClusterManager;
use needlestack_index::Fetchers;
use needlestack_models as models;
use needlestack_models::ReplicaState;

use super::collection::Collection;
use super::ErrorKind;
use super::Result;

/// Outcome counts of one reconcile pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconcileStats {
    pub added: usize,
    pub dropped: usize,
    pub modified: usize,
    pub refreshed: usize,
    pub failed: usize,
}

impl ReconcileStats {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    fn changed(&self) -> usize {
        self.added + self.dropped + self.modified + self.refreshed
    }
}

/// A registered collection: the descriptor it was built from plus the
/// loaded engine.
pub struct CollectionEntry {
    pub descriptor: models::Collection,
    pub collection: Collection,
}

/// In-memory registry of the collections this searcher owns.
///
/// `reconcile` drives the registry towards the desired state read from the
/// coordinator; entries are built and loaded aside, then swapped in whole,
/// so concurrent readers never observe a half-loaded collection.
pub struct LocalCollectionManager {
    cluster: Arc<ClusterManager>,
    collections: RwLock<BTreeMap<String, Arc<CollectionEntry>>>,
    fetchers: Fetchers,
    logger: Logger,
}

impl LocalCollectionManager {
    pub fn new(
        cluster: Arc<ClusterManager>,
        fetchers: Fetchers,
        logger: Logger,
    ) -> LocalCollectionManager {
        LocalCollectionManager {
            cluster,
            collections: RwLock::new(BTreeMap::new()),
            fetchers,
            logger,
        }
    }

    /// Snapshot handle to a loaded collection.
    pub fn get(&self, name: &str) -> Option<Arc<CollectionEntry>> {
        let collections = self.collections.read().expect("collections lock poisoned");
        collections.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> Vec<String> {
        let collections = self.collections.read().expect("collections lock poisoned");
        collections.keys().cloned().collect()
    }

    /// Reconcile the in-memory registry against the coordination store.
    ///
    /// Partitions desired against current into add / drop / modify, reloads
    /// unchanged collections whose data source published an update, and
    /// drives the owned replicas BOOTING -> ACTIVE / DOWN around each load.
    /// Running it twice with the same desired state is a no-op the second
    /// time.
    pub fn reconcile(&self) -> Result<ReconcileStats> {
        let desired = self
            .cluster
            .list_local_collections(false)
            .with_context(|_| ErrorKind::DesiredState)?;
        let desired: BTreeMap<String, models::Collection> = desired
            .into_iter()
            .map(|collection| (collection.name.clone(), normalize(collection)))
            .collect();

        let current: BTreeMap<String, models::Collection> = {
            let collections = self.collections.read().expect("collections lock poisoned");
            collections
                .iter()
                .map(|(name, entry)| (name.clone(), entry.descriptor.clone()))
                .collect()
        };

        let mut stats = ReconcileStats::default();
        // Drop: known locally, gone from the store. No state write; the
        // replica znodes are already deleted.
        for name in current.keys() {
            if !desired.contains_key(name) {
                self.remove(name);
                info!(self.logger, "Dropped collection"; "collection" => name);
                stats.dropped += 1;
            }
        }

        for (name, descriptor) in &desired {
            match current.get(name) {
                None => {
                    stats.added += 1;
                    self.load_and_swap(descriptor, &mut stats, "add");
                }
                Some(previous) if previous != descriptor => {
                    stats.modified += 1;
                    let changed = changed_shards(previous, descriptor);
                    for shard in &changed {
                        let _ = self.set_shard_state(name, shard, ReplicaState::Booting);
                    }
                    self.load_and_swap(descriptor, &mut stats, "modify");
                }
                Some(_) => {
                    let update = self
                        .get(name)
                        .map(|entry| entry.collection.update_available())
                        .unwrap_or(false);
                    if update {
                        stats.refreshed += 1;
                        self.load_and_swap(descriptor, &mut stats, "refresh");
                    }
                }
            };
        }

        if stats.changed() > 0 || stats.failed > 0 {
            info!(
                self.logger, "Reconciled local collections";
                "added" => stats.added,
                "dropped" => stats.dropped,
                "modified" => stats.modified,
                "refreshed" => stats.refreshed,
                "failed" => stats.failed,
            );
        }
        Ok(stats)
    }

    /// Mark every owned replica DOWN; used on shutdown.
    pub fn down(&self) {
        if let Err(error) = self.cluster.set_local_state(ReplicaState::Down, None, None) {
            warn!(self.logger, "Failed to mark local replicas down"; "error" => %error);
        }
    }

    fn remove(&self, name: &str) {
        let mut collections = self.collections.write().expect("collections lock poisoned");
        collections.remove(name);
    }

    /// Build and load a fresh engine for the descriptor, then swap it in.
    ///
    /// The owned replicas go BOOTING first; ACTIVE on success, DOWN on
    /// failure (a failed collection is also removed from the registry so
    /// queries fail fast rather than serve a stale copy).
    fn load_and_swap(
        &self,
        descriptor: &models::Collection,
        stats: &mut ReconcileStats,
        reason: &'static str,
    ) {
        let name = descriptor.name.clone();
        let _ = self.set_collection_state(&name, ReplicaState::Booting);
        let mut collection = Collection::from_descriptor(descriptor, &self.fetchers);
        match collection.load() {
            Ok(()) => {
                let entry = Arc::new(CollectionEntry {
                    descriptor: descriptor.clone(),
                    collection,
                });
                let mut collections =
                    self.collections.write().expect("collections lock poisoned");
                collections.insert(name.clone(), entry);
                drop(collections);
                let _ = self.set_collection_state(&name, ReplicaState::Active);
                info!(
                    self.logger, "Loaded collection";
                    "collection" => &name, "reason" => reason,
                );
            }
            Err(error) => {
                stats.failed += 1;
                self.remove(&name);
                let _ = self.set_collection_state(&name, ReplicaState::Down);
                error!(
                    self.logger, "Failed to load collection";
                    "collection" => &name, "reason" => reason, "error" => %error,
                );
            }
        };
    }

    fn set_collection_state(&self, name: &str, state: ReplicaState) -> Result<bool> {
        let result = self
            .cluster
            .set_local_state(state, Some(name), None)
            .with_context(|_| ErrorKind::DesiredState)?;
        Ok(result)
    }

    fn set_shard_state(&self, name: &str, shard: &str, state: ReplicaState) -> Result<bool> {
        let result = self
            .cluster
            .set_local_state(state, Some(name), Some(shard))
            .with_context(|_| ErrorKind::DesiredState)?;
        Ok(result)
    }
}

/// Strip replica lists so descriptors compare on identity, not placement.
fn normalize(mut collection: models::Collection) -> models::Collection {
    for shard in &mut collection.shards {
        shard.replicas.clear();
    }
    collection
}

/// Shards added or replaced between two descriptors, by name.
fn changed_shards(previous: &models::Collection, next: &models::Collection) -> Vec<String> {
    let known: BTreeMap<&str, &models::Shard> = previous
        .shards
        .iter()
        .map(|shard| (shard.name.as_str(), shard))
        .collect();
    let mut changed = BTreeSet::new();
    for shard in &next.shards {
        match known.get(shard.name.as_str()) {
            Some(previous) if *previous == shard => (),
            _ => {
                changed.insert(shard.name.clone());
            }
        };
    }
    changed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use slog::Discard;
    use slog::Logger;

    use needlestack_coordinator::store::MemoryStore;
    use needlestack_coordinator::store::Store;
    use needlestack_coordinator::ClusterManager;
    use needlestack_index::Fetchers;
    use needlestack_index::FlatIndex;
    use needlestack_models::Collection;
    use needlestack_models::DataSource;
    use needlestack_models::IndexDescriptor;
    use needlestack_models::Metadata;
    use needlestack_models::Replica;
    use needlestack_models::ReplicaState;
    use needlestack_models::Shard;

    use super::LocalCollectionManager;

    const HOSTPORT: &str = "n1:50051";

    fn cluster(store: &Arc<MemoryStore>) -> Arc<ClusterManager> {
        let config = needlestack_coordinator::Config {
            backend: needlestack_coordinator::BackendConfig::Memory,
            cache_refresh_ms: 3_600_000,
            ..needlestack_coordinator::Config::default()
        };
        let manager = ClusterManager::with_store(
            Arc::clone(store) as Arc<dyn Store>,
            config,
            "testing",
            HOSTPORT,
            Logger::root(Discard, o!()),
        );
        manager.startup().unwrap();
        Arc::new(manager)
    }

    fn write_shard(dir: &std::path::Path, name: &str, vectors: Vec<f32>) -> String {
        let metadatas = (0..vectors.len() / 2)
            .map(|row| Metadata::new(format!("{}-{}", name, row), Vec::new()))
            .collect();
        let bytes = FlatIndex::artifact_bytes(vectors, 2, metadatas).unwrap();
        let path = dir.join(format!("{}.json", name));
        fs::write(&path, bytes).unwrap();
        path.display().to_string()
    }

    fn descriptor(name: &str, shard_paths: Vec<(&str, String)>) -> Collection {
        let shards = shard_paths
            .into_iter()
            .map(|(shard_name, path)| {
                let mut shard = Shard::new(
                    shard_name,
                    1.0,
                    IndexDescriptor::Flat(DataSource::LocalFile { path }),
                );
                shard.replicas = vec![Replica::new(HOSTPORT, ReplicaState::Booting)];
                shard
            })
            .collect();
        Collection::new(name, 1, shards)
    }

    fn replica_state(store: &MemoryStore, cname: &str, sname: &str) -> ReplicaState {
        let path = format!(
            "/needlestack/testing/collections/{}/shards/{}/replicas/{}",
            cname, sname, HOSTPORT
        );
        let data = store.get(&path).unwrap().unwrap();
        let replica: Replica = serde_json::from_slice(&data).unwrap();
        replica.state.unwrap()
    }

    #[test]
    fn add_loads_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        let path = write_shard(dir.path(), "s1", vec![0.0, 0.0, 1.0, 1.0]);
        cluster
            .add_collections(&[descriptor("c1", vec![("s1", path)])])
            .unwrap();

        let manager = LocalCollectionManager::new(
            Arc::clone(&cluster),
            Fetchers::filesystem(dir.path()),
            Logger::root(Discard, o!()),
        );
        let stats = manager.reconcile().unwrap();
        assert_eq!(stats.added, 1);
        assert!(stats.success());
        assert!(manager.get("c1").is_some());
        assert_eq!(replica_state(&store, "c1", "s1"), ReplicaState::Active);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        let path = write_shard(dir.path(), "s1", vec![0.0, 0.0, 1.0, 1.0]);
        cluster
            .add_collections(&[descriptor("c1", vec![("s1", path)])])
            .unwrap();

        let manager = LocalCollectionManager::new(
            Arc::clone(&cluster),
            Fetchers::filesystem(dir.path()),
            Logger::root(Discard, o!()),
        );
        manager.reconcile().unwrap();
        let first = manager.get("c1").unwrap();
        let stats = manager.reconcile().unwrap();
        assert_eq!(stats, super::ReconcileStats::default());
        // Same engine instance: nothing was reloaded.
        assert!(Arc::ptr_eq(&first, &manager.get("c1").unwrap()));
        assert_eq!(replica_state(&store, "c1", "s1"), ReplicaState::Active);
    }

    #[test]
    fn drop_removes_from_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        let path = write_shard(dir.path(), "s1", vec![0.0, 0.0, 1.0, 1.0]);
        cluster
            .add_collections(&[descriptor("c1", vec![("s1", path)])])
            .unwrap();

        let manager = LocalCollectionManager::new(
            Arc::clone(&cluster),
            Fetchers::filesystem(dir.path()),
            Logger::root(Discard, o!()),
        );
        manager.reconcile().unwrap();
        cluster.delete_collections(&["c1".to_string()]).unwrap();
        let stats = manager.reconcile().unwrap();
        assert_eq!(stats.dropped, 1);
        assert!(manager.get("c1").is_none());
    }

    #[test]
    fn load_failure_marks_replicas_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        cluster
            .add_collections(&[descriptor(
                "c1",
                vec![("s1", "/nonexistent/shard.json".to_string())],
            )])
            .unwrap();

        let manager = LocalCollectionManager::new(
            Arc::clone(&cluster),
            Fetchers::filesystem(dir.path()),
            Logger::root(Discard, o!()),
        );
        let stats = manager.reconcile().unwrap();
        assert_eq!(stats.failed, 1);
        assert!(!stats.success());
        assert!(manager.get("c1").is_none());
        assert_eq!(replica_state(&store, "c1", "s1"), ReplicaState::Down);
    }

    #[test]
    fn modify_reloads_changed_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        let path = write_shard(dir.path(), "s1", vec![0.0, 0.0, 1.0, 1.0]);
        cluster
            .add_collections(&[descriptor("c1", vec![("s1", path)])])
            .unwrap();

        let manager = LocalCollectionManager::new(
            Arc::clone(&cluster),
            Fetchers::filesystem(dir.path()),
            Logger::root(Discard, o!()),
        );
        manager.reconcile().unwrap();

        // Republish the collection with an extra shard.
        cluster.delete_collections(&["c1".to_string()]).unwrap();
        let path1 = write_shard(dir.path(), "s1", vec![0.0, 0.0, 1.0, 1.0]);
        let path2 = write_shard(dir.path(), "s2", vec![5.0, 5.0]);
        cluster
            .add_collections(&[descriptor("c1", vec![("s1", path1), ("s2", path2)])])
            .unwrap();
        let stats = manager.reconcile().unwrap();
        assert_eq!(stats.modified, 1);
        let entry = manager.get("c1").unwrap();
        assert_eq!(entry.collection.shard_names(), vec!["s1", "s2"]);
    }
}
