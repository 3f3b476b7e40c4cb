extern crate failure;
extern crate failure_derive;
#[macro_use]
extern crate lazy_static;
extern crate prometheus;
extern crate reqwest;
extern crate serde;
extern crate slog;

extern crate needlestack_models;

use needlestack_models::api::CollectionsAddRequest;
use needlestack_models::api::CollectionsAddResponse;
use needlestack_models::api::CollectionsDeleteRequest;
use needlestack_models::api::CollectionsDeleteResponse;
use needlestack_models::api::CollectionsListRequest;
use needlestack_models::api::CollectionsListResponse;
use needlestack_models::api::CollectionsLoadRequest;
use needlestack_models::api::CollectionsLoadResponse;
use needlestack_models::api::HealthResponse;
use needlestack_models::api::RetrieveRequest;
use needlestack_models::api::RetrieveResponse;
use needlestack_models::api::SearchRequest;
use needlestack_models::api::SearchResponse;

mod error;
mod http;
mod metrics;
mod pool;

#[cfg(debug_assertions)]
pub mod mock;

pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::http::Credentials;
pub use self::http::HttpMergerClient;
pub use self::http::HttpSearcherClient;
pub use self::metrics::register_metrics;
pub use self::pool::ClientPool;
pub use self::pool::SearcherPool;

/// Interface to the health service of any node.
pub trait HealthClient: Send + Sync {
    fn check(&self) -> Result<HealthResponse>;
}

/// Interface to interact with a (remote) searcher.
///
/// Users should use the `HttpSearcherClient`; the `mock` module is useful
/// for tests.
pub trait SearcherClient: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;

    fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse>;

    fn collections_load(&self, request: &CollectionsLoadRequest)
        -> Result<CollectionsLoadResponse>;
}

/// Interface to interact with a (remote) merger.
pub trait MergerClient: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;

    fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse>;

    fn collections_add(&self, request: &CollectionsAddRequest) -> Result<CollectionsAddResponse>;

    fn collections_delete(
        &self,
        request: &CollectionsDeleteRequest,
    ) -> Result<CollectionsDeleteResponse>;

    fn collections_load(&self, request: &CollectionsLoadRequest)
        -> Result<CollectionsLoadResponse>;

    fn collections_list(&self, request: &CollectionsListRequest)
        -> Result<CollectionsListResponse>;
}
