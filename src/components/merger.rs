use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::Builder;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::bounded;
use failure::ResultExt;
use rand::Rng;
use slog::Logger;

use needlestack_balancers::plan_add;
use needlestack_balancers::Greedy;
use needlestack_client::Credentials;
use needlestack_client::SearcherClient;
use needlestack_client::SearcherPool;
use needlestack_coordinator::ClusterManager;
use needlestack_models::api::merge_result_lists;
use needlestack_models::api::CollectionsAddRequest;
use needlestack_models::api::CollectionsAddResponse;
use needlestack_models::api::CollectionsDeleteRequest;
use needlestack_models::api::CollectionsDeleteResponse;
use needlestack_models::api::CollectionsListRequest;
use needlestack_models::api::CollectionsListResponse;
use needlestack_models::api::CollectionsLoadRequest;
use needlestack_models::api::CollectionsLoadResponse;
use needlestack_models::api::HealthResponse;
use needlestack_models::api::HealthStatus;
use needlestack_models::api::RetrieveRequest;
use needlestack_models::api::RetrieveResponse;
use needlestack_models::api::SearchRequest;
use needlestack_models::api::SearchResponse;

use super::super::error;
use super::super::interfaces::api::json_endpoint;
use super::super::interfaces::api::json_get_endpoint;
use super::super::interfaces::API;
use super::super::metrics::SHARDS_WITHOUT_REPLICAS_COUNT;
use super::super::ErrorKind;
use super::super::Result;

/// Extra wait beyond the per-request client timeout before a fan-out is
/// abandoned.
const COLLECT_GRACE: Duration = Duration::from_secs(1);

/// Stateless query coordinator: fans out to searchers, merges by distance.
pub struct Merger {
    cluster: Arc<ClusterManager>,
    credentials: Credentials,
    logger: Logger,
    pool: Arc<SearcherPool>,
    timeout: Duration,
}

impl Merger {
    pub fn new(
        cluster: Arc<ClusterManager>,
        pool: Arc<SearcherPool>,
        credentials: Credentials,
        timeout: Duration,
        logger: Logger,
    ) -> Result<Merger> {
        cluster.register_merger().map_err(error::from_coordinator)?;
        Ok(Merger {
            cluster,
            credentials,
            logger,
            pool,
            timeout,
        })
    }

    pub fn health(&self) -> Result<HealthResponse> {
        Ok(HealthResponse {
            status: HealthStatus::Serving,
        })
    }

    /// Globally best `k` items for a query vector.
    ///
    /// One replica is chosen per shard, shards are grouped by the chosen
    /// node, and one RPC per node is issued concurrently.
    pub fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let groups = self.route(&request.collection_name, &request.shard_names)?;
        let vector = request.vector.clone();
        let count = request.count;
        let collection_name = request.collection_name.clone();
        let (responses, expected) = self.scatter(groups, move |client, shards| {
            client.search(&SearchRequest {
                vector: vector.clone(),
                count,
                collection_name: collection_name.clone(),
                shard_names: shards.to_vec(),
            })
        })?;
        if responses.len() < expected {
            return Err(ErrorKind::Unavailable(
                "timed out waiting for searcher responses".into(),
            )
            .into());
        }

        let mut lists = Vec::with_capacity(responses.len());
        for (hostport, result) in responses {
            let response = result.map_err(|error| {
                warn!(
                    self.logger, "Searcher search failed";
                    "hostport" => &hostport, "error" => %error,
                );
                error::from_client(error)
            })?;
            lists.push(response.items);
        }
        if lists.is_empty() {
            return Err(ErrorKind::Unknown("Empty responses from Search".into()).into());
        }
        if lists.len() == 1 {
            let items = lists.pop().expect("one sub-response must be present");
            return Ok(SearchResponse { items });
        }
        let items = merge_result_lists(lists, request.count);
        Ok(SearchResponse { items })
    }

    /// First item carrying the id across the collection's shards.
    pub fn retrieve(&self, request: RetrieveRequest) -> Result<RetrieveResponse> {
        let groups = self.route(&request.collection_name, &request.shard_names)?;
        let id = request.id.clone();
        let collection_name = request.collection_name.clone();
        let (responses, expected) = self.scatter(groups, move |client, shards| {
            client.retrieve(&RetrieveRequest {
                id: id.clone(),
                collection_name: collection_name.clone(),
                shard_names: shards.to_vec(),
            })
        })?;
        if responses.len() < expected {
            return Err(ErrorKind::Unavailable(
                "timed out waiting for searcher responses".into(),
            )
            .into());
        }

        for (hostport, result) in responses {
            let response = result.map_err(|error| {
                warn!(
                    self.logger, "Searcher retrieve failed";
                    "hostport" => &hostport, "error" => %error,
                );
                error::from_client(error)
            })?;
            if let Some(item) = response.item {
                if !item.metadata.id.is_empty() {
                    return Ok(RetrieveResponse { item: Some(item) });
                }
            }
        }
        Err(ErrorKind::NotFound("ID not found in collection".into()).into())
    }

    /// Validate, place and persist new collections, then broadcast a load.
    pub fn collections_add(&self, request: CollectionsAddRequest) -> Result<CollectionsAddResponse> {
        let current = self
            .cluster
            .list_collections(None, false)
            .map_err(error::from_coordinator)?;
        let current_names: BTreeSet<&str> =
            current.iter().map(|collection| collection.name.as_str()).collect();
        let overlap: Vec<&str> = request
            .collections
            .iter()
            .map(|collection| collection.name.as_str())
            .filter(|name| current_names.contains(name))
            .collect();
        if !overlap.is_empty() {
            return Err(ErrorKind::AlreadyExists(format!(
                "collections {} already exist; no new collections added",
                overlap.join(", ")
            ))
            .into());
        }

        let nodes = self.cluster.list_nodes().map_err(error::from_coordinator)?;
        let placed = plan_add(
            &self.logger,
            &nodes,
            &current,
            &request.collections,
            &Greedy,
        )
        .map_err(error::from_balancers)?;

        let mut success = true;
        if !request.noop {
            let added = self
                .cluster
                .add_collections(&placed)
                .map_err(error::from_coordinator)?;
            success = !added.is_empty() && self.broadcast_load()?;
        }
        Ok(CollectionsAddResponse {
            collections: placed,
            success,
        })
    }

    /// Validate and delete collections, then broadcast a load.
    pub fn collections_delete(
        &self,
        request: CollectionsDeleteRequest,
    ) -> Result<CollectionsDeleteResponse> {
        let current = self
            .cluster
            .list_collections(None, false)
            .map_err(error::from_coordinator)?;
        let current_names: BTreeSet<&str> =
            current.iter().map(|collection| collection.name.as_str()).collect();
        let missing: Vec<&str> = request
            .names
            .iter()
            .map(String::as_str)
            .filter(|name| !current_names.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(ErrorKind::NotFound(format!(
                "collections {} do not exist",
                missing.join(", ")
            ))
            .into());
        }

        let mut success = true;
        if !request.noop {
            self.cluster
                .delete_collections(&request.names)
                .map_err(error::from_coordinator)?;
            success = self.broadcast_load()?;
        }
        Ok(CollectionsDeleteResponse {
            names: request.names,
            success,
        })
    }

    /// Ask every live node to reconcile; fold per-node successes.
    pub fn collections_load(&self, _: CollectionsLoadRequest) -> Result<CollectionsLoadResponse> {
        let success = self.broadcast_load()?;
        Ok(CollectionsLoadResponse { success })
    }

    /// Pass-through to the cluster state.
    pub fn collections_list(
        &self,
        request: CollectionsListRequest,
    ) -> Result<CollectionsListResponse> {
        let names = if request.names.is_empty() {
            None
        } else {
            Some(request.names.as_slice())
        };
        let collections = self
            .cluster
            .list_collections(names, true)
            .map_err(error::from_coordinator)?;
        Ok(CollectionsListResponse { collections })
    }

    fn broadcast_load(&self) -> Result<bool> {
        let nodes = self.cluster.list_nodes().map_err(error::from_coordinator)?;
        let groups = nodes
            .into_iter()
            .map(|node| (node.hostport, Vec::new()))
            .collect::<Vec<_>>();
        if groups.is_empty() {
            return Ok(true);
        }
        let (responses, expected) =
            self.scatter(groups, move |client, _| {
                client.collections_load(&CollectionsLoadRequest {})
            })?;
        let mut success = responses.len() == expected;
        for (hostport, result) in responses {
            match result {
                Ok(response) => success = success && response.success,
                Err(error) => {
                    success = false;
                    error!(
                        self.logger, "Searcher failed collections load";
                        "hostport" => &hostport, "error" => %error,
                    );
                }
            };
        }
        // Pick up the replica states the searchers just wrote.
        self.cluster.refresh_cache();
        Ok(success)
    }

    /// Pick one active replica per shard and group shards by chosen node.
    fn route(
        &self,
        collection_name: &str,
        shard_names: &[String],
    ) -> Result<Vec<(String, Vec<String>)>> {
        let shard_names = if shard_names.is_empty() {
            None
        } else {
            Some(shard_names)
        };
        let pairs = self
            .cluster
            .get_searchers(collection_name, shard_names)
            .map_err(error::from_coordinator)?;
        let mut rng = rand::thread_rng();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (shard, hostports) in pairs {
            if hostports.is_empty() {
                SHARDS_WITHOUT_REPLICAS_COUNT
                    .with_label_values(&[collection_name])
                    .inc();
                continue;
            }
            let choice = hostports[rng.gen_range(0..hostports.len())].clone();
            groups.entry(choice).or_insert_with(Vec::new).push(shard);
        }
        Ok(groups.into_iter().collect())
    }

    /// Issue one concurrent RPC per target node and collect the responses.
    ///
    /// Returns the responses that arrived in time along with how many were
    /// expected. Targets that miss the collection deadline are dropped, not
    /// awaited; their threads die with the per-request client timeout.
    fn scatter<R, F>(
        &self,
        groups: Vec<(String, Vec<String>)>,
        call: F,
    ) -> Result<(Vec<(String, needlestack_client::Result<R>)>, usize)>
    where
        R: Send + 'static,
        F: Fn(&dyn SearcherClient, &[String]) -> needlestack_client::Result<R>
            + Send
            + Sync
            + 'static,
    {
        let call = Arc::new(call);
        let (sender, receiver) = bounded(groups.len());
        let mut expected = 0;
        for (hostport, shards) in groups {
            let client = self
                .pool
                .get(&hostport, &self.credentials)
                .map_err(error::from_client)?;
            let call = Arc::clone(&call);
            let sender = sender.clone();
            let thread_hostport = hostport.clone();
            Builder::new()
                .name(format!("n:merger:rpc:{}", hostport))
                .spawn(move || {
                    let result = call(client.as_ref(), &shards);
                    let _ = sender.send((thread_hostport, result));
                })
                .context(ErrorKind::SpawnThread("merger fan-out"))?;
            expected += 1;
        }
        drop(sender);

        let deadline = Instant::now() + self.timeout + COLLECT_GRACE;
        let mut responses = Vec::with_capacity(expected);
        for _ in 0..expected {
            match receiver.recv_deadline(deadline) {
                Ok(response) => responses.push(response),
                Err(_) => {
                    warn!(
                        self.logger, "Abandoning slow searcher responses";
                        "received" => responses.len(), "expected" => expected,
                    );
                    break;
                }
            };
        }
        Ok((responses, expected))
    }

    /// Register the merger service endpoints.
    pub fn attach(this: &Arc<Merger>, api: &mut API, logger: &Logger) {
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/search",
            json_endpoint("/api/v1/search", logger.clone(), move |request| {
                merger.search(request)
            }),
            "search",
        );
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/retrieve",
            json_endpoint("/api/v1/retrieve", logger.clone(), move |request| {
                merger.retrieve(request)
            }),
            "retrieve",
        );
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/collections/add",
            json_endpoint("/api/v1/collections/add", logger.clone(), move |request| {
                merger.collections_add(request)
            }),
            "collections_add",
        );
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/collections/delete",
            json_endpoint(
                "/api/v1/collections/delete",
                logger.clone(),
                move |request| merger.collections_delete(request),
            ),
            "collections_delete",
        );
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/collections/load",
            json_endpoint("/api/v1/collections/load", logger.clone(), move |request| {
                merger.collections_load(request)
            }),
            "collections_load",
        );
        let merger = Arc::clone(this);
        api.router().post(
            "/api/v1/collections/list",
            json_endpoint("/api/v1/collections/list", logger.clone(), move |request| {
                merger.collections_list(request)
            }),
            "collections_list",
        );
        let merger = Arc::clone(this);
        api.router().get(
            "/api/v1/health",
            json_get_endpoint("/api/v1/health", logger.clone(), move || merger.health()),
            "health",
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use slog::Discard;
    use slog::Logger;

    use needlestack_client::mock::MockSearcherClient;
    use needlestack_client::ClientPool;
    use needlestack_client::Credentials;
    use needlestack_client::SearcherClient;
    use needlestack_client::SearcherPool;
    use needlestack_coordinator::store::MemoryStore;
    use needlestack_coordinator::store::Store;
    use needlestack_coordinator::ClusterManager;
    use needlestack_models::api::CollectionsLoadRequest;
    use needlestack_models::api::SearchRequest;
    use needlestack_models::api::SearchResultItem;
    use needlestack_models::Collection;
    use needlestack_models::DataSource;
    use needlestack_models::IndexDescriptor;
    use needlestack_models::Metadata;
    use needlestack_models::NDArray;
    use needlestack_models::Replica;
    use needlestack_models::ReplicaState;
    use needlestack_models::Shard;

    use super::Merger;

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

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
            "merger:50050",
            logger(),
        );
        manager.startup().unwrap();
        Arc::new(manager)
    }

    fn merger(
        cluster: &Arc<ClusterManager>,
        clients: BTreeMap<String, Arc<MockSearcherClient>>,
    ) -> Merger {
        let pool: SearcherPool = ClientPool::new(Box::new(move |hostport, _| {
            let client = clients
                .get(hostport)
                .expect("test pool asked for an unknown hostport");
            Ok(Arc::clone(client) as Arc<dyn SearcherClient>)
        }));
        Merger::new(
            Arc::clone(cluster),
            Arc::new(pool),
            Credentials::default(),
            Duration::from_secs(1),
            logger(),
        )
        .unwrap()
    }

    fn register_node(store: &MemoryStore, hostport: &str) {
        store
            .create(
                &format!("/needlestack/testing/live_nodes/{}", hostport),
                b"",
                true,
            )
            .unwrap();
    }

    fn active_collection(cluster: &ClusterManager, hostport: &str) {
        let source = DataSource::LocalFile {
            path: "/data/c1-s1.json".into(),
        };
        let mut shard = Shard::new("s1", 1.0, IndexDescriptor::Flat(source));
        shard.replicas = vec![Replica::new(hostport, ReplicaState::Booting)];
        cluster
            .add_collections(&[Collection::new("c1", 1, vec![shard])])
            .unwrap();
        cluster
            .set_state(ReplicaState::Active, Some("c1"), None, None)
            .unwrap();
    }

    #[test]
    fn broadcast_load_folds_failures() {
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        register_node(&store, "n1:50051");
        register_node(&store, "n2:50051");

        let healthy = Arc::new(MockSearcherClient::answering(Vec::new()));
        let broken = Arc::new(MockSearcherClient {
            fail_with: Some(("UNAVAILABLE", "searcher rebooting".into())),
            ..MockSearcherClient::default()
        });
        let mut clients = BTreeMap::new();
        clients.insert("n1:50051".to_string(), Arc::clone(&healthy));
        clients.insert("n2:50051".to_string(), Arc::clone(&broken));

        let merger = merger(&cluster, clients);
        let response = merger.collections_load(CollectionsLoadRequest {}).unwrap();
        assert!(!response.success);
        assert_eq!(
            healthy.load_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn single_sub_response_returned_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let cluster = cluster(&store);
        register_node(&store, "n1:50051");
        active_collection(&cluster, "n1:50051");

        // More items than `count`: a lone sub-response is not truncated.
        let items: Vec<_> = (0..5)
            .map(|i| {
                SearchResultItem::from_f32(i as f32, Metadata::new(format!("v{}", i), Vec::new()))
            })
            .collect();
        let mock = Arc::new(MockSearcherClient::answering(items));
        let mut clients = BTreeMap::new();
        clients.insert("n1:50051".to_string(), Arc::clone(&mock));

        let merger = merger(&cluster, clients);
        let response = merger
            .search(SearchRequest {
                vector: NDArray::from_f32(vec![0.0, 0.0], vec![2]).unwrap(),
                count: 2,
                collection_name: "c1".into(),
                shard_names: Vec::new(),
            })
            .unwrap();
        assert_eq!(response.items.len(), 5);
        let requests = mock.search_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].shard_names, vec!["s1"]);
    }
}
