use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::thread;
use std::thread::Builder;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use crossbeam_channel::select;
use crossbeam_channel::Sender;
use failure::ResultExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json;
use slog::Logger;

use needlestack_models::Collection;
use needlestack_models::Node;
use needlestack_models::Replica;
use needlestack_models::ReplicaState;
use needlestack_models::Shard;

use super::cache::Cache;
use super::metrics::SESSION_EVENTS_COUNT;
use super::store;
use super::store::SessionEvent;
use super::store::Store;
use super::store::Transaction;
use super::Config;
use super::ErrorKind;
use super::Result;

const REGISTER_ATTEMPTS: u32 = 3;

/// Source of truth for cluster topology and replica state.
///
/// Maintains the znode layout below and serves searcher discovery from a
/// locally cached snapshot of it:
///
/// ```text
/// <root>/<cluster>/live_nodes/<hostport>                 (ephemeral, empty)
/// <root>/<cluster>/collections/<cname>                   (collection descriptor)
/// <root>/<cluster>/collections/<cname>/shards/<sname>    (shard descriptor)
/// <root>/<cluster>/collections/<cname>/shards/<sname>/replicas/<hostport>
/// ```
pub struct ClusterManager {
    cache: RwLock<Option<Cache>>,
    cluster_name: String,
    config: Config,
    hostport: String,
    logger: Logger,
    session_thread: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    store: Arc<dyn Store>,
}

impl ClusterManager {
    /// Connect the configured store backend and wrap a manager around it.
    pub fn new<S1, S2>(config: Config, cluster_name: S1, hostport: S2, logger: Logger) -> Result<ClusterManager>
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let store = store::connect(&config, logger.clone())?;
        Ok(ClusterManager::with_store(
            store,
            config,
            cluster_name,
            hostport,
            logger,
        ))
    }

    /// Wrap a manager around an already connected store.
    pub fn with_store<S1, S2>(
        store: Arc<dyn Store>,
        config: Config,
        cluster_name: S1,
        hostport: S2,
        logger: Logger,
    ) -> ClusterManager
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        ClusterManager {
            cache: RwLock::new(None),
            cluster_name: cluster_name.into(),
            config,
            hostport: hostport.into(),
            logger,
            session_thread: Mutex::new(None),
            store,
        }
    }

    pub fn hostport(&self) -> &str {
        &self.hostport
    }

    /// Ensure base paths exist, start the cache and the session consumer.
    pub fn startup(&self) -> Result<()> {
        self.store.ensure_path(&self.live_nodes_znode())?;
        self.store.ensure_path(&self.collections_znode())?;
        let cache = Cache::new(
            Arc::clone(&self.store),
            self.base_znode(),
            Duration::from_millis(self.config.cache_refresh_ms),
            self.logger.clone(),
        )?;
        cache.refresh()?;
        *self.cache.write().expect("cluster manager cache lock poisoned") = Some(cache);
        self.start_session_thread()?;
        info!(
            self.logger, "Cluster manager started";
            "cluster" => &self.cluster_name, "hostport" => &self.hostport,
        );
        Ok(())
    }

    /// Stop background threads and close the store session.
    pub fn shutdown(&self) {
        let cache = self
            .cache
            .write()
            .expect("cluster manager cache lock poisoned")
            .take();
        drop(cache);
        let session = self
            .session_thread
            .lock()
            .expect("cluster manager session lock poisoned")
            .take();
        if let Some((shutdown, handle)) = session {
            drop(shutdown);
            if handle.join().is_err() {
                error!(self.logger, "Session consumer thread panicked");
            }
        }
        self.store.close();
        info!(self.logger, "Cluster manager stopped"; "cluster" => &self.cluster_name);
    }

    /// Create this node's ephemeral live-node marker.
    ///
    /// A collision means a previous session for this hostport has not yet
    /// expired; retry a few times before giving up.
    pub fn register_searcher(&self) -> Result<()> {
        let path = self.this_node_znode();
        let mut delay = Duration::from_millis(self.config.retry.base_delay_ms);
        for _ in 0..REGISTER_ATTEMPTS {
            match self.store.create(&path, b"", true) {
                Ok(()) => {
                    info!(self.logger, "Registered live node"; "znode" => &path);
                    return Ok(());
                }
                Err(ref error) if error.kind().is_already_exists() => {
                    warn!(
                        self.logger, "Live node znode already exists, waiting for stale session";
                        "znode" => &path,
                    );
                    thread::sleep(delay);
                    delay *= 2;
                }
                Err(error) => return Err(error),
            };
        }
        error!(self.logger, "Could not register live node"; "znode" => &path);
        Err(ErrorKind::RetryExhausted("register_searcher", REGISTER_ATTEMPTS).into())
    }

    /// Mergers do not join the routing set.
    pub fn register_merger(&self) -> Result<()> {
        Ok(())
    }

    /// Transactionally persist collections, shards and replicas.
    ///
    /// Initial replica state is BOOTING. If the transaction rolls back an
    /// empty list is returned and nothing was written.
    pub fn add_collections(&self, collections: &[Collection]) -> Result<Vec<Collection>> {
        let mut tx = Transaction::new(self.store.as_ref());
        for collection in collections {
            let descriptor = encode("collection descriptor", &collection.descriptor())?;
            tx.create(self.collection_znode(&collection.name), descriptor);
            tx.create(self.shards_znode(&collection.name), Vec::new());
            for shard in &collection.shards {
                let descriptor = encode("shard descriptor", &shard.descriptor())?;
                tx.create(self.shard_znode(&collection.name, &shard.name), descriptor);
                tx.create(self.replicas_znode(&collection.name, &shard.name), Vec::new());
                for replica in &shard.replicas {
                    let payload = Replica::new(replica.node.hostport.clone(), ReplicaState::Booting);
                    let payload = encode("replica", &payload)?;
                    tx.create(
                        self.replica_znode(&collection.name, &shard.name, &replica.node.hostport),
                        payload,
                    );
                }
            }
        }
        match tx.commit() {
            Ok(()) => {
                self.refresh_cache();
                Ok(collections.to_vec())
            }
            Err(error) => {
                warn!(self.logger, "Adding collections rolled back"; "error" => %error);
                Ok(Vec::new())
            }
        }
    }

    /// Transactionally delete whole collection subtrees.
    ///
    /// Returns the names that existed and were deleted; unknown names are
    /// skipped.
    pub fn delete_collections(&self, names: &[String]) -> Result<Vec<String>> {
        let mut tx = Transaction::new(self.store.as_ref());
        let mut deleted = Vec::new();
        for name in names {
            let paths = store::walk(self.store.as_ref(), &self.collection_znode(name))?;
            if paths.is_empty() {
                continue;
            }
            for path in paths.iter().rev() {
                tx.delete(path.clone());
            }
            deleted.push(name.clone());
        }
        if deleted.is_empty() {
            return Ok(deleted);
        }
        tx.commit()?;
        self.refresh_cache();
        Ok(deleted)
    }

    /// Nodes currently present in the live-nodes set.
    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self
            .store
            .children(&self.live_nodes_znode())?
            .into_iter()
            .map(Node::new)
            .collect();
        Ok(nodes)
    }

    /// Rehydrate collections from the store subtree.
    ///
    /// With `include_state` unset replica payloads are not fetched and the
    /// returned replicas carry no state.
    pub fn list_collections(
        &self,
        names: Option<&[String]>,
        include_state: bool,
    ) -> Result<Vec<Collection>> {
        let names: Vec<String> = match names {
            Some(names) => names.to_vec(),
            None => self.store.children(&self.collections_znode())?,
        };
        let mut collections = Vec::new();
        for name in names {
            let data = match self.store.get(&self.collection_znode(&name))? {
                Some(data) => data,
                None => continue,
            };
            let mut collection: Collection = decode(&self.collection_znode(&name), &data)?;
            for shard_name in self.store.children(&self.shards_znode(&name))? {
                let data = match self.store.get(&self.shard_znode(&name, &shard_name))? {
                    Some(data) => data,
                    None => continue,
                };
                let mut shard: Shard = decode(&self.shard_znode(&name, &shard_name), &data)?;
                for hostport in self
                    .store
                    .children(&self.replicas_znode(&name, &shard_name))?
                {
                    let replica = if include_state {
                        let path = self.replica_znode(&name, &shard_name, &hostport);
                        match self.store.get(&path)? {
                            Some(data) => decode(&path, &data)?,
                            None => Replica::stateless(hostport),
                        }
                    } else {
                        Replica::stateless(hostport)
                    };
                    shard.replicas.push(replica);
                }
                collection.shards.push(shard);
            }
            collections.push(collection);
        }
        Ok(collections)
    }

    /// Collections filtered down to the shards this node owns a replica of.
    pub fn list_local_collections(&self, include_state: bool) -> Result<Vec<Collection>> {
        let mut collections = self.list_collections(None, include_state)?;
        for collection in &mut collections {
            collection.shards.retain(|shard| {
                shard
                    .replicas
                    .iter()
                    .any(|replica| replica.node.hostport == self.hostport)
            });
        }
        collections.retain(|collection| !collection.shards.is_empty());
        Ok(collections)
    }

    /// Transactionally set the state of every matching replica.
    ///
    /// Returns false when nothing matched the filters.
    pub fn set_state(
        &self,
        state: ReplicaState,
        cname: Option<&str>,
        sname: Option<&str>,
        hostport: Option<&str>,
    ) -> Result<bool> {
        let mut tx = Transaction::new(self.store.as_ref());
        let mut matched = false;
        let cnames = match cname {
            Some(cname) => vec![cname.to_string()],
            None => self.store.children(&self.collections_znode())?,
        };
        for cname in &cnames {
            let snames = match sname {
                Some(sname) => vec![sname.to_string()],
                None => self.store.children(&self.shards_znode(cname))?,
            };
            for sname in &snames {
                for replica in self.store.children(&self.replicas_znode(cname, sname))? {
                    if let Some(hostport) = hostport {
                        if replica != hostport {
                            continue;
                        }
                    }
                    let payload = Replica::new(replica.clone(), state);
                    let payload = encode("replica", &payload)?;
                    tx.set(self.replica_znode(cname, sname, &replica), payload);
                    matched = true;
                }
            }
        }
        if !matched {
            return Ok(false);
        }
        tx.commit()?;
        self.refresh_cache();
        debug!(
            self.logger, "Replica states updated";
            "state" => ?state,
            "collection" => cname.unwrap_or("*"),
            "shard" => sname.unwrap_or("*"),
            "hostport" => hostport.unwrap_or("*"),
        );
        Ok(true)
    }

    /// Set the state of replicas owned by this node.
    pub fn set_local_state(
        &self,
        state: ReplicaState,
        cname: Option<&str>,
        sname: Option<&str>,
    ) -> Result<bool> {
        let hostport = self.hostport.clone();
        self.set_state(state, cname, sname, Some(&hostport))
    }

    /// Delete every replica znode owned by this node.
    pub fn clean_local(&self) -> Result<()> {
        let mut tx = Transaction::new(self.store.as_ref());
        for cname in self.store.children(&self.collections_znode())? {
            for sname in self.store.children(&self.shards_znode(&cname))? {
                for hostport in self.store.children(&self.replicas_znode(&cname, &sname))? {
                    if hostport == self.hostport {
                        tx.delete(self.replica_znode(&cname, &sname, &hostport));
                    }
                }
            }
        }
        if tx.is_empty() {
            return Ok(());
        }
        tx.commit()?;
        self.refresh_cache();
        Ok(())
    }

    /// Active replica hostports for each requested shard, cache-served.
    ///
    /// A replica whose cached payload is missing or unreadable counts as not
    /// active. Shards left with no active replica are omitted and logged.
    pub fn get_searchers(
        &self,
        cname: &str,
        snames: Option<&[String]>,
    ) -> Result<Vec<(String, Vec<String>)>> {
        let cache = self.cache.read().expect("cluster manager cache lock poisoned");
        let cache = cache
            .as_ref()
            .ok_or_else(|| ErrorKind::Backend("get_searchers before startup"))?;
        let snames: Vec<String> = match snames {
            Some(snames) => snames.to_vec(),
            None => cache.get_children(&self.shards_znode(cname), Vec::new()),
        };
        let mut pairs = Vec::new();
        for sname in snames {
            let replicas = cache.get_children(&self.replicas_znode(cname, &sname), Vec::new());
            let mut active = Vec::new();
            for hostport in replicas {
                let path = self.replica_znode(cname, &sname, &hostport);
                let state = cache
                    .get_data(&path)
                    .and_then(|data| serde_json::from_slice::<Replica>(&data).ok())
                    .and_then(|replica| replica.state);
                if state == Some(ReplicaState::Active) {
                    active.push(hostport);
                }
            }
            if active.is_empty() {
                error!(
                    self.logger, "No active replica for shard";
                    "collection" => cname, "shard" => &sname,
                );
            } else {
                pairs.push((sname, active));
            }
        }
        Ok(pairs)
    }
}

impl ClusterManager {
    fn base_znode(&self) -> String {
        format!("{}/{}", self.config.root, self.cluster_name)
    }

    fn live_nodes_znode(&self) -> String {
        format!("{}/live_nodes", self.base_znode())
    }

    fn this_node_znode(&self) -> String {
        format!("{}/{}", self.live_nodes_znode(), self.hostport)
    }

    fn collections_znode(&self) -> String {
        format!("{}/collections", self.base_znode())
    }

    fn collection_znode(&self, cname: &str) -> String {
        format!("{}/{}", self.collections_znode(), cname)
    }

    fn shards_znode(&self, cname: &str) -> String {
        format!("{}/shards", self.collection_znode(cname))
    }

    fn shard_znode(&self, cname: &str, sname: &str) -> String {
        format!("{}/{}", self.shards_znode(cname), sname)
    }

    fn replicas_znode(&self, cname: &str, sname: &str) -> String {
        format!("{}/replicas", self.shard_znode(cname, sname))
    }

    fn replica_znode(&self, cname: &str, sname: &str, hostport: &str) -> String {
        format!("{}/{}", self.replicas_znode(cname, sname), hostport)
    }

    /// Force the cache to observe a mutation committed elsewhere.
    ///
    /// Admin flows call this after a broadcast so discovery reads see the
    /// replica states the broadcast produced instead of waiting out the
    /// refresh interval.
    pub fn refresh_cache(&self) {
        let cache = self.cache.read().expect("cluster manager cache lock poisoned");
        if let Some(ref cache) = *cache {
            if let Err(error) = cache.refresh() {
                warn!(self.logger, "Cache refresh after commit failed"; "error" => %error);
            }
        }
    }

    /// Consume session events away from the store's callback thread.
    fn start_session_thread(&self) -> Result<()> {
        let events = self.store.events();
        let logger = self.logger.clone();
        let (sender, shutdown) = bounded::<()>(0);
        let handle = Builder::new()
            .name("n:coordinator:session".into())
            .spawn(move || loop {
                select! {
                    recv(events) -> event => match event {
                        Ok(event) => {
                            SESSION_EVENTS_COUNT
                                .with_label_values(&[event.as_str()])
                                .inc();
                            match event {
                                SessionEvent::Connected => {
                                    info!(logger, "Coordination session established")
                                }
                                SessionEvent::Suspended => {
                                    warn!(logger, "Coordination session suspended")
                                }
                                SessionEvent::Lost => {
                                    // Cached reads keep serving the last
                                    // snapshot until the session returns.
                                    warn!(logger, "Coordination session lost")
                                }
                            };
                        }
                        Err(_) => break,
                    },
                    recv(shutdown) -> _ => break,
                }
            })
            .context(ErrorKind::SpawnThread("session consumer"))?;
        let mut session = self
            .session_thread
            .lock()
            .expect("cluster manager session lock poisoned");
        *session = Some((sender, handle));
        Ok(())
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        let started = {
            let session = self
                .session_thread
                .lock()
                .expect("cluster manager session lock poisoned");
            session.is_some()
        };
        if started {
            self.shutdown();
        }
    }
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(value).with_context(|_| ErrorKind::Encode(what))?;
    Ok(data)
}

fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    let value = serde_json::from_slice(data)
        .with_context(|_| ErrorKind::Decode(path.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slog::Discard;
    use slog::Logger;

    use needlestack_models::Collection;
    use needlestack_models::DataSource;
    use needlestack_models::IndexDescriptor;
    use needlestack_models::Replica;
    use needlestack_models::ReplicaState;
    use needlestack_models::Shard;

    use super::super::store::MemoryStore;
    use super::super::store::Store;
    use super::super::BackendConfig;
    use super::super::Config;
    use super::ClusterManager;

    fn manager(store: &Arc<MemoryStore>, hostport: &str) -> ClusterManager {
        let config = Config {
            backend: BackendConfig::Memory,
            retry: super::super::RetryConfig {
                attempts: 2,
                base_delay_ms: 1,
            },
            cache_refresh_ms: 3_600_000,
            ..Config::default()
        };
        let manager = ClusterManager::with_store(
            Arc::clone(store) as Arc<dyn Store>,
            config,
            "testing",
            hostport,
            Logger::root(Discard, o!()),
        );
        manager.startup().unwrap();
        manager
    }

    fn collection(name: &str, hostports: &[&str]) -> Collection {
        let source = DataSource::LocalFile {
            path: format!("/data/{}.json", name),
        };
        let mut shard = Shard::new("s1", 1.0, IndexDescriptor::Flat(source));
        shard.replicas = hostports
            .iter()
            .map(|hostport| Replica::new(*hostport, ReplicaState::Booting))
            .collect();
        Collection::new(name, 1, vec![shard])
    }

    #[test]
    fn register_and_list_nodes() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager.register_searcher().unwrap();
        let nodes = manager.list_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostport, "n1:50051");
        // The marker is ephemeral: it vanishes with the session.
        store.session_drop();
        assert!(manager.list_nodes().unwrap().is_empty());
    }

    #[test]
    fn register_retries_on_stale_session() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        store
            .create("/needlestack/testing/live_nodes/n1:50051", b"", false)
            .unwrap();
        assert!(manager.register_searcher().is_err());
    }

    #[test]
    fn add_collections_persists_booting_replicas() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        let added = manager
            .add_collections(&[collection("c1", &["n1:50051", "n2:50051"])])
            .unwrap();
        assert_eq!(added.len(), 1);
        let listed = manager.list_collections(None, true).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].shards.len(), 1);
        let replicas = &listed[0].shards[0].replicas;
        assert_eq!(replicas.len(), 2);
        for replica in replicas {
            assert_eq!(replica.state, Some(ReplicaState::Booting));
        }
    }

    #[test]
    fn add_collections_rolls_back_to_empty() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        // Pre-existing collection znode makes the transaction collide.
        store
            .create("/needlestack/testing/collections/c1", b"{}", false)
            .unwrap();
        let added = manager
            .add_collections(&[collection("c1", &["n1:50051"])])
            .unwrap();
        assert!(added.is_empty());
        assert!(!store
            .exists("/needlestack/testing/collections/c1/shards")
            .unwrap());
    }

    #[test]
    fn delete_collections_skips_unknown_names() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager
            .add_collections(&[collection("c1", &["n1:50051"])])
            .unwrap();
        let deleted = manager
            .delete_collections(&["c1".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(deleted, vec!["c1"]);
        assert!(manager.list_collections(None, false).unwrap().is_empty());
    }

    #[test]
    fn list_local_collections_filters_shards() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        let mut remote = collection("c1", &["n2:50051"]);
        remote.shards.push({
            let source = DataSource::LocalFile {
                path: "/data/c1-s2.json".into(),
            };
            let mut shard = Shard::new("s2", 1.0, IndexDescriptor::Flat(source));
            shard.replicas = vec![Replica::new("n1:50051", ReplicaState::Booting)];
            shard
        });
        manager.add_collections(&[remote]).unwrap();
        let local = manager.list_local_collections(false).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].shards.len(), 1);
        assert_eq!(local[0].shards[0].name, "s2");
    }

    #[test]
    fn get_searchers_only_returns_active_replicas() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager
            .add_collections(&[collection("c1", &["n1:50051", "n2:50051"])])
            .unwrap();
        // All replicas are BOOTING: the shard is omitted entirely.
        assert!(manager.get_searchers("c1", None).unwrap().is_empty());

        manager
            .set_state(ReplicaState::Active, Some("c1"), None, Some("n1:50051"))
            .unwrap();
        let pairs = manager.get_searchers("c1", None).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "s1");
        assert_eq!(pairs[0].1, vec!["n1:50051"]);
    }

    #[test]
    fn get_searchers_ignores_payload_free_replicas() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager
            .add_collections(&[collection("c1", &["n1:50051"])])
            .unwrap();
        // Clobber the replica payload: no cached state means not active.
        store
            .set(
                "/needlestack/testing/collections/c1/shards/s1/replicas/n1:50051",
                b"",
            )
            .unwrap();
        manager.refresh_cache();
        assert!(manager.get_searchers("c1", None).unwrap().is_empty());
    }

    #[test]
    fn set_local_state_touches_only_this_node() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager
            .add_collections(&[collection("c1", &["n1:50051", "n2:50051"])])
            .unwrap();
        assert!(manager
            .set_local_state(ReplicaState::Active, None, None)
            .unwrap());
        let listed = manager.list_collections(None, true).unwrap();
        for replica in &listed[0].shards[0].replicas {
            let expected = if replica.node.hostport == "n1:50051" {
                ReplicaState::Active
            } else {
                ReplicaState::Booting
            };
            assert_eq!(replica.state, Some(expected));
        }
    }

    #[test]
    fn clean_local_removes_owned_replicas() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, "n1:50051");
        manager
            .add_collections(&[collection("c1", &["n1:50051", "n2:50051"])])
            .unwrap();
        manager.clean_local().unwrap();
        let listed = manager.list_collections(None, true).unwrap();
        let replicas = &listed[0].shards[0].replicas;
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].node.hostport, "n2:50051");
    }
}
