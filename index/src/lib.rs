extern crate base64;
extern crate chrono;
extern crate failure;
extern crate failure_derive;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

extern crate needlestack_models;

use needlestack_models::api::RetrievalResultItem;
use needlestack_models::api::SearchResultItem;
use needlestack_models::IndexDescriptor;
use needlestack_models::Metadata;
use needlestack_models::NDArray;

mod artifact;
mod error;
mod flat;
mod source;

pub use self::artifact::IndexArtifact;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::flat::FlatIndex;
pub use self::source::BlobStore;
pub use self::source::Fetchers;
pub use self::source::FsBlobStore;
pub use self::source::SourceHandle;

/// Distances and row indices for a batch of queries.
#[derive(Clone, Debug, PartialEq)]
pub struct KnnResult {
    pub distances: Vec<Vec<f32>>,
    pub indices: Vec<Vec<usize>>,
}

/// Contract between the collection engine and any kNN index implementation.
///
/// `dimension` and `count` are only valid once `load` has succeeded.
/// Backends that cannot mutate default `add_vectors`/`set_vectors` to an
/// unsupported-operation error.
pub trait IndexBackend: Send + Sync {
    fn dimension(&self) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    /// Whether the data source has published something newer than what is
    /// in memory.
    fn update_available(&self) -> Result<bool>;

    /// Fetch and deserialize the data source if an update is available.
    ///
    /// Returns true when a (re)load actually happened.
    fn load(&mut self) -> Result<bool>;

    /// Top-`min(k, count)` rows per query, distances ascending.
    fn knn_search(&self, queries: &NDArray, k: usize) -> Result<KnnResult>;

    /// `knn_search` plus metadata lookup, one result list per query row.
    fn query(&self, queries: &NDArray, k: usize) -> Result<Vec<Vec<SearchResultItem>>>;

    /// The original vector and metadata for an id, or None if unknown.
    fn retrieve(&self, id: &str) -> Result<Option<RetrievalResultItem>>;

    fn add_vectors(&mut self, _vectors: &NDArray, _metadatas: Vec<Metadata>) -> Result<()> {
        Err(ErrorKind::UnsupportedOperation("add_vectors").into())
    }

    fn set_vectors(&mut self, _vectors: &NDArray, _metadatas: Vec<Metadata>) -> Result<()> {
        Err(ErrorKind::UnsupportedOperation("set_vectors").into())
    }
}

/// Build the backend named by a shard's index descriptor.
pub fn from_descriptor(
    descriptor: &IndexDescriptor,
    fetchers: &Fetchers,
    enable_id_to_vector: bool,
) -> Box<dyn IndexBackend> {
    match descriptor {
        IndexDescriptor::Flat(source) => {
            Box::new(FlatIndex::new(fetchers.open(source), enable_id_to_vector))
        }
    }
}
