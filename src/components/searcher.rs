use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use slog::Logger;

use needlestack_collections::LocalCollectionManager;
use needlestack_coordinator::ClusterManager;
use needlestack_index::Fetchers;
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
use super::super::ErrorKind;
use super::super::Result;

/// Stateful leaf serving kNN queries over the replicas this node owns.
pub struct Searcher {
    cluster: Arc<ClusterManager>,
    collections: LocalCollectionManager,
    logger: Logger,
    serving: AtomicBool,
}

impl Searcher {
    pub fn new(cluster: Arc<ClusterManager>, fetchers: Fetchers, logger: Logger) -> Searcher {
        let collections = LocalCollectionManager::new(
            Arc::clone(&cluster),
            fetchers,
            logger.clone(),
        );
        Searcher {
            cluster,
            collections,
            logger,
            serving: AtomicBool::new(false),
        }
    }

    /// Join the routing set and load the collections this node owns.
    pub fn startup(&self) -> Result<()> {
        self.cluster.register_searcher().map_err(error::from_coordinator)?;
        self.collections
            .reconcile()
            .map_err(error::from_collections)?;
        self.serving.store(true, Ordering::Relaxed);
        info!(self.logger, "Searcher ready"; "hostport" => self.cluster.hostport());
        Ok(())
    }

    pub fn health(&self) -> Result<HealthResponse> {
        let status = if self.serving.load(Ordering::Relaxed) {
            HealthStatus::Serving
        } else {
            HealthStatus::NotServing
        };
        Ok(HealthResponse { status })
    }

    /// Top-`k` across the locally owned shards of one collection.
    pub fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let entry = self.collections.get(&request.collection_name).ok_or_else(|| {
            ErrorKind::NotFound(format!(
                "collection {} is not loaded on this node",
                request.collection_name
            ))
        })?;
        let (_, _, columns) = request
            .vector
            .as_f32_matrix()
            .map_err(|error| ErrorKind::InvalidArgument(error.to_string()))?;
        let dimension = entry.collection.dimension();
        if columns != dimension {
            return Err(ErrorKind::InvalidArgument(format!(
                "collection {} expects vectors of dimension {}, got {}",
                request.collection_name, dimension, columns
            ))
            .into());
        }
        let items = entry
            .collection
            .query(&request.vector, request.count, &request.shard_names)
            .map_err(error::from_collections)?;
        Ok(SearchResponse { items })
    }

    /// Scan the requested shards for an id.
    ///
    /// An empty response (no item) means no local shard knows the id; the
    /// merger decides whether that is NOT_FOUND overall.
    pub fn retrieve(&self, request: RetrieveRequest) -> Result<RetrieveResponse> {
        let entry = self.collections.get(&request.collection_name).ok_or_else(|| {
            ErrorKind::NotFound(format!(
                "collection {} is not loaded on this node",
                request.collection_name
            ))
        })?;
        let item = entry
            .collection
            .retrieve(&request.id, &request.shard_names)
            .map_err(error::from_collections)?;
        Ok(RetrieveResponse { item })
    }

    /// Reconcile the local registry against the coordination store.
    pub fn collections_load(&self, _: CollectionsLoadRequest) -> Result<CollectionsLoadResponse> {
        let stats = self
            .collections
            .reconcile()
            .map_err(error::from_collections)?;
        Ok(CollectionsLoadResponse {
            success: stats.success(),
        })
    }

    /// Register the searcher service endpoints.
    pub fn attach(this: &Arc<Searcher>, api: &mut API, logger: &Logger) {
        let searcher = Arc::clone(this);
        api.router().post(
            "/api/v1/search",
            json_endpoint("/api/v1/search", logger.clone(), move |request| {
                searcher.search(request)
            }),
            "search",
        );
        let searcher = Arc::clone(this);
        api.router().post(
            "/api/v1/retrieve",
            json_endpoint("/api/v1/retrieve", logger.clone(), move |request| {
                searcher.retrieve(request)
            }),
            "retrieve",
        );
        let searcher = Arc::clone(this);
        api.router().post(
            "/api/v1/collections/load",
            json_endpoint("/api/v1/collections/load", logger.clone(), move |request| {
                searcher.collections_load(request)
            }),
            "collections_load",
        );
        let searcher = Arc::clone(this);
        api.router().get(
            "/api/v1/health",
            json_get_endpoint("/api/v1/health", logger.clone(), move || searcher.health()),
            "health",
        );
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        if self.serving.swap(false, Ordering::Relaxed) {
            info!(self.logger, "Searcher stopping, marking replicas down");
            self.collections.down();
        }
    }
}
