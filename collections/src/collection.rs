use std::collections::BTreeMap;

use failure::Fail;
use failure::ResultExt;

use needlestack_index as index;
use needlestack_index::Fetchers;
use needlestack_index::IndexBackend;
use needlestack_models as models;
use needlestack_models::api::merge_result_lists;
use needlestack_models::api::RetrievalResultItem;
use needlestack_models::api::SearchResultItem;
use needlestack_models::NDArray;

use super::ErrorKind;
use super::Result;

/// A shard's in-memory form: the descriptor plus its loaded index backend.
pub struct Shard {
    pub name: String,
    pub weight: f64,
    index: Box<dyn IndexBackend>,
}

impl Shard {
    fn from_descriptor(
        descriptor: &models::Shard,
        fetchers: &Fetchers,
        enable_id_to_vector: bool,
    ) -> Shard {
        Shard {
            name: descriptor.name.clone(),
            weight: descriptor.weight,
            index: index::from_descriptor(&descriptor.index, fetchers, enable_id_to_vector),
        }
    }

    fn query(&self, queries: &NDArray, k: usize) -> index::Result<Vec<SearchResultItem>> {
        let mut batches = self.index.query(queries, k)?;
        // One query vector per request; further batch rows are not routed.
        let result = batches.drain(..).next().unwrap_or_else(Vec::new);
        Ok(result)
    }
}

/// A collection's in-memory form on a searcher: loaded shards plus the
/// dimension they agreed on.
pub struct Collection {
    name: String,
    enable_id_to_vector: bool,
    dimension: usize,
    shards: BTreeMap<String, Shard>,
}

impl Collection {
    /// Build an unloaded collection from its cluster descriptor.
    pub fn from_descriptor(descriptor: &models::Collection, fetchers: &Fetchers) -> Collection {
        let shards = descriptor
            .shards
            .iter()
            .map(|shard| {
                (
                    shard.name.clone(),
                    Shard::from_descriptor(shard, fetchers, descriptor.enable_id_to_vector),
                )
            })
            .collect();
        Collection {
            name: descriptor.name.clone(),
            enable_id_to_vector: descriptor.enable_id_to_vector,
            dimension: 0,
            shards,
        }
    }

    /// Load every shard and validate they agree on dimension.
    pub fn load(&mut self) -> Result<()> {
        let name = self.name.clone();
        for shard in self.shards.values_mut() {
            shard
                .index
                .load()
                .with_context(|_| ErrorKind::ShardLoad(name.clone(), shard.name.clone()))?;
        }
        let mut dimensions = BTreeMap::new();
        for shard in self.shards.values() {
            let dimension = shard
                .index
                .dimension()
                .with_context(|_| ErrorKind::ShardLoad(name.clone(), shard.name.clone()))?;
            dimensions.insert(dimension, shard.name.clone());
        }
        if dimensions.len() > 1 {
            return Err(ErrorKind::DimensionMismatch(name).into());
        }
        self.dimension = dimensions.keys().next().cloned().unwrap_or(0);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Common dimension of every shard; valid after `load`.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn enable_id_to_vector(&self) -> bool {
        self.enable_id_to_vector
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    /// Whether any shard's data source published an update.
    pub fn update_available(&self) -> bool {
        self.shards
            .values()
            .any(|shard| shard.index.update_available().unwrap_or(false))
    }

    /// Merge per-shard top-`k` lists into this collection's top-`k`.
    ///
    /// An empty `shard_names` queries every shard.
    pub fn query(
        &self,
        queries: &NDArray,
        k: usize,
        shard_names: &[String],
    ) -> Result<Vec<SearchResultItem>> {
        let shards = self.select_shards(shard_names)?;
        let mut lists = Vec::with_capacity(shards.len());
        for shard in shards {
            let items = shard
                .query(queries, k)
                .with_context(|_| ErrorKind::ShardLoad(self.name.clone(), shard.name.clone()))?;
            lists.push(items);
        }
        Ok(merge_result_lists(lists, k))
    }

    /// First shard that knows the id wins; None when no shard does.
    pub fn retrieve(
        &self,
        id: &str,
        shard_names: &[String],
    ) -> Result<Option<RetrievalResultItem>> {
        for shard in self.select_shards(shard_names)? {
            let item = match shard.index.retrieve(id) {
                Ok(item) => item,
                Err(error) => {
                    let kind = match error.kind() {
                        index::ErrorKind::UnsupportedOperation(what) => {
                            ErrorKind::Unsupported(self.name.clone(), what)
                        }
                        _ => ErrorKind::ShardLoad(self.name.clone(), shard.name.clone()),
                    };
                    return Err(error.context(kind).into());
                }
            };
            if item.is_some() {
                return Ok(item);
            }
        }
        Ok(None)
    }

    fn select_shards(&self, shard_names: &[String]) -> Result<Vec<&Shard>> {
        if shard_names.is_empty() {
            return Ok(self.shards.values().collect());
        }
        let mut shards = Vec::with_capacity(shard_names.len());
        for name in shard_names {
            let shard = self.shards.get(name).ok_or_else(|| {
                ErrorKind::UnknownShard(self.name.clone(), name.clone())
            })?;
            shards.push(shard);
        }
        Ok(shards)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use needlestack_index::Fetchers;
    use needlestack_index::FlatIndex;
    use needlestack_models as models;
    use needlestack_models::DataSource;
    use needlestack_models::IndexDescriptor;
    use needlestack_models::Metadata;
    use needlestack_models::NDArray;

    use super::super::ErrorKind;
    use super::Collection;

    pub fn write_flat_shard(dir: &Path, name: &str, vectors: Vec<f32>, dimension: usize) -> String {
        let rows = vectors.len() / dimension;
        let metadatas = (0..rows)
            .map(|row| Metadata::new(format!("{}-{}", name, row), Vec::new()))
            .collect();
        let bytes = FlatIndex::artifact_bytes(vectors, dimension, metadatas).unwrap();
        let path = dir.join(format!("{}.json", name));
        fs::write(&path, bytes).unwrap();
        path.display().to_string()
    }

    pub fn descriptor(name: &str, shards: Vec<(String, String)>) -> models::Collection {
        let shards = shards
            .into_iter()
            .map(|(shard_name, path)| {
                models::Shard::new(
                    shard_name,
                    1.0,
                    IndexDescriptor::Flat(DataSource::LocalFile { path }),
                )
            })
            .collect();
        models::Collection::new(name, 1, shards)
    }

    #[test]
    fn load_discovers_common_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_flat_shard(dir.path(), "a", vec![0.0, 0.0, 1.0, 1.0], 2);
        let b = write_flat_shard(dir.path(), "b", vec![5.0, 5.0], 2);
        let descriptor = descriptor("c1", vec![("a".into(), a), ("b".into(), b)]);
        let mut collection = Collection::from_descriptor(&descriptor, &Fetchers::filesystem("/tmp"));
        collection.load().unwrap();
        assert_eq!(collection.dimension(), 2);
    }

    #[test]
    fn load_rejects_mixed_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_flat_shard(dir.path(), "a", vec![0.0, 0.0], 2);
        let b = write_flat_shard(dir.path(), "b", vec![1.0, 1.0, 1.0], 3);
        let descriptor = descriptor("c1", vec![("a".into(), a), ("b".into(), b)]);
        let mut collection = Collection::from_descriptor(&descriptor, &Fetchers::filesystem("/tmp"));
        match collection.load() {
            Err(error) => match error.kind() {
                ErrorKind::DimensionMismatch(name) => assert_eq!(name, "c1"),
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(()) => panic!("expected load to fail"),
        };
    }

    #[test]
    fn query_merges_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_flat_shard(dir.path(), "a", vec![0.0, 0.0, 4.0, 0.0], 2);
        let b = write_flat_shard(dir.path(), "b", vec![1.0, 0.0, 9.0, 0.0], 2);
        let descriptor = descriptor("c1", vec![("a".into(), a), ("b".into(), b)]);
        let mut collection = Collection::from_descriptor(&descriptor, &Fetchers::filesystem("/tmp"));
        collection.load().unwrap();
        let query = NDArray::from_f32(vec![0.0, 0.0], vec![2]).unwrap();
        let items = collection.query(&query, 3, &[]).unwrap();
        let ids: Vec<_> = items.iter().map(|item| item.metadata.id.clone()).collect();
        assert_eq!(ids, vec!["a-0", "b-0", "a-1"]);
    }

    #[test]
    fn query_unknown_shard_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_flat_shard(dir.path(), "a", vec![0.0, 0.0], 2);
        let descriptor = descriptor("c1", vec![("a".into(), a)]);
        let mut collection = Collection::from_descriptor(&descriptor, &Fetchers::filesystem("/tmp"));
        collection.load().unwrap();
        let query = NDArray::from_f32(vec![0.0, 0.0], vec![2]).unwrap();
        assert!(collection.query(&query, 1, &["ghost".to_string()]).is_err());
    }
}
