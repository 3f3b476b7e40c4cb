use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;

use needlestack_models::Metadata;
use needlestack_models::NDArray;

use super::artifact::IndexArtifact;
use super::source::SourceHandle;
use super::ErrorKind;
use super::IndexBackend;
use super::KnnResult;
use super::Result;
use needlestack_models::api::RetrievalResultItem;
use needlestack_models::api::SearchResultItem;

/// Exact kNN over squared L2 distance, scanning every row.
///
/// The reference backend: rows live in memory as a dense f32 matrix loaded
/// from the shard's published artifact.
pub struct FlatIndex {
    source: SourceHandle,
    enable_id_to_vector: bool,
    loaded: Option<Loaded>,
}

struct Loaded {
    dimension: usize,
    vectors: Vec<f32>,
    metadatas: Vec<Metadata>,
    id_to_row: Option<HashMap<String, usize>>,
    modified_time: Option<DateTime<Utc>>,
}

impl FlatIndex {
    pub fn new(source: SourceHandle, enable_id_to_vector: bool) -> FlatIndex {
        FlatIndex {
            source,
            enable_id_to_vector,
            loaded: None,
        }
    }

    /// Build the published artifact bytes for a flat shard.
    ///
    /// The index blob is the dense row matrix; metadata records follow in
    /// row order.
    pub fn artifact_bytes(
        vectors: Vec<f32>,
        dimension: usize,
        metadatas: Vec<Metadata>,
    ) -> Result<Vec<u8>> {
        if dimension == 0 || vectors.len() % dimension != 0 {
            return Err(ErrorKind::Artifact(format!(
                "{} values do not form rows of dimension {}",
                vectors.len(),
                dimension
            ))
            .into());
        }
        let rows = vectors.len() / dimension;
        if rows != metadatas.len() {
            return Err(ErrorKind::Artifact(format!(
                "{} rows but {} metadata records",
                rows,
                metadatas.len()
            ))
            .into());
        }
        let matrix = NDArray::from_f32(vectors, vec![rows, dimension])
            .map_err(|error| ErrorKind::Artifact(error.to_string()))?;
        let blob = serde_json::to_vec(&matrix)
            .map_err(|error| ErrorKind::Artifact(error.to_string()))?;
        IndexArtifact {
            index: blob,
            metadatas,
        }
        .to_bytes()
    }

    fn state(&self) -> Result<&Loaded> {
        self.loaded.as_ref().ok_or_else(|| ErrorKind::NotLoaded.into())
    }

    fn row(&self, index: usize) -> Result<&[f32]> {
        let state = self.state()?;
        let start = index * state.dimension;
        Ok(&state.vectors[start..start + state.dimension])
    }
}

impl IndexBackend for FlatIndex {
    fn dimension(&self) -> Result<usize> {
        Ok(self.state()?.dimension)
    }

    fn count(&self) -> Result<usize> {
        let state = self.state()?;
        Ok(state.metadatas.len())
    }

    fn update_available(&self) -> Result<bool> {
        let loaded_at = match self.loaded {
            None => return Ok(true),
            Some(ref state) => state.modified_time,
        };
        match (loaded_at, self.source.last_modified()?) {
            (None, _) => Ok(true),
            (Some(_), None) => Ok(false),
            (Some(loaded_at), Some(published)) => Ok(loaded_at < published),
        }
    }

    fn load(&mut self) -> Result<bool> {
        if !self.update_available()? {
            return Ok(false);
        }
        let bytes = self.source.fetch()?;
        let artifact = IndexArtifact::from_bytes(&bytes)?;
        let matrix: NDArray = serde_json::from_slice(&artifact.index)
            .map_err(|error| ErrorKind::Artifact(error.to_string()))?;
        let (vectors, rows, dimension) = matrix
            .as_f32_matrix()
            .map_err(|error| ErrorKind::Artifact(error.to_string()))?;
        if rows != artifact.metadatas.len() {
            return Err(ErrorKind::Artifact(format!(
                "{} rows but {} metadata records",
                rows,
                artifact.metadatas.len()
            ))
            .into());
        }
        let id_to_row = if self.enable_id_to_vector {
            Some(
                artifact
                    .metadatas
                    .iter()
                    .enumerate()
                    .map(|(row, metadata)| (metadata.id.clone(), row))
                    .collect(),
            )
        } else {
            None
        };
        self.loaded = Some(Loaded {
            dimension,
            vectors,
            metadatas: artifact.metadatas,
            id_to_row,
            modified_time: self.source.last_modified()?,
        });
        Ok(true)
    }

    fn knn_search(&self, queries: &NDArray, k: usize) -> Result<KnnResult> {
        let state = self.state()?;
        let (data, rows, cols) = queries
            .as_f32_matrix()
            .map_err(|error| ErrorKind::ShapeMismatch(error.to_string()))?;
        if cols != state.dimension {
            return Err(ErrorKind::ShapeMismatch(format!(
                "query dimension {} against index dimension {}",
                cols, state.dimension
            ))
            .into());
        }
        let count = state.metadatas.len();
        let k = k.min(count);
        let mut distances = Vec::with_capacity(rows);
        let mut indices = Vec::with_capacity(rows);
        for row in 0..rows {
            let query = &data[row * cols..(row + 1) * cols];
            let mut scored: Vec<(f32, usize)> = (0..count)
                .map(|candidate| {
                    let start = candidate * state.dimension;
                    let vector = &state.vectors[start..start + state.dimension];
                    let distance = query
                        .iter()
                        .zip(vector.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>();
                    (distance, candidate)
                })
                .collect();
            scored.sort_unstable_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });
            scored.truncate(k);
            distances.push(scored.iter().map(|(distance, _)| *distance).collect());
            indices.push(scored.into_iter().map(|(_, row)| row).collect());
        }
        Ok(KnnResult { distances, indices })
    }

    fn query(&self, queries: &NDArray, k: usize) -> Result<Vec<Vec<SearchResultItem>>> {
        let result = self.knn_search(queries, k)?;
        let state = self.state()?;
        let mut batches = Vec::with_capacity(result.distances.len());
        for (distances, indices) in result.distances.iter().zip(result.indices.iter()) {
            let items = distances
                .iter()
                .zip(indices.iter())
                .map(|(distance, row)| {
                    SearchResultItem::from_f32(*distance, state.metadatas[*row].clone())
                })
                .collect();
            batches.push(items);
        }
        Ok(batches)
    }

    fn retrieve(&self, id: &str) -> Result<Option<RetrievalResultItem>> {
        let state = self.state()?;
        let id_to_row = state
            .id_to_row
            .as_ref()
            .ok_or_else(|| ErrorKind::UnsupportedOperation("id_to_vector"))?;
        let row = match id_to_row.get(id) {
            Some(row) => *row,
            None => return Ok(None),
        };
        let vector = self.row(row)?.to_vec();
        let dimension = state.dimension;
        let vector = NDArray::from_f32(vector, vec![dimension])
            .map_err(|error| ErrorKind::Artifact(error.to_string()))?;
        Ok(Some(RetrievalResultItem {
            vector: Some(vector),
            metadata: state.metadatas[row].clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use needlestack_models::api::SearchResultItem;
    use needlestack_models::DataSource;
    use needlestack_models::FieldValue;
    use needlestack_models::Metadata;
    use needlestack_models::MetadataField;
    use needlestack_models::NDArray;

    use super::super::source::Fetchers;
    use super::super::ErrorKind;
    use super::super::IndexBackend;
    use super::FlatIndex;

    fn metadata(id: &str) -> Metadata {
        Metadata::new(
            id,
            vec![MetadataField::named("label", FieldValue::String(id.into()))],
        )
    }

    fn write_shard(dir: &std::path::Path, name: &str) -> String {
        // Four unit-ish vectors on a line so distances are predictable.
        let vectors = vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0];
        let metadatas = vec![
            metadata("vec-0"),
            metadata("vec-1"),
            metadata("vec-2"),
            metadata("vec-3"),
        ];
        let bytes = FlatIndex::artifact_bytes(vectors, 2, metadatas).unwrap();
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path.display().to_string()
    }

    fn open(path: String, enable_id_to_vector: bool) -> FlatIndex {
        let fetchers = Fetchers::filesystem("/tmp");
        let handle = fetchers.open(&DataSource::LocalFile { path });
        FlatIndex::new(handle, enable_id_to_vector)
    }

    #[test]
    fn load_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, false);
        assert!(index.load().unwrap());
        assert_eq!(index.dimension().unwrap(), 2);
        assert_eq!(index.count().unwrap(), 4);

        let query = NDArray::from_f32(vec![0.9, 0.0], vec![2]).unwrap();
        let batches = index.query(&query, 2).unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<_> = batches[0]
            .iter()
            .map(|item| item.metadata.id.clone())
            .collect();
        assert_eq!(ids, vec!["vec-1", "vec-0"]);
        let distances: Vec<_> = batches[0]
            .iter()
            .map(SearchResultItem::distance)
            .collect();
        assert!(distances[0] < distances[1]);
    }

    #[test]
    fn k_capped_at_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, false);
        index.load().unwrap();
        let query = NDArray::from_f32(vec![0.0, 0.0], vec![2]).unwrap();
        let batches = index.query(&query, 100).unwrap();
        assert_eq!(batches[0].len(), 4);
    }

    #[test]
    fn second_load_is_noop_until_source_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path.clone(), false);
        assert!(index.load().unwrap());
        assert!(!index.load().unwrap());

        // Republish with a newer mtime; the artifact becomes loadable again.
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
        file.set_modified(future).unwrap();
        assert!(index.update_available().unwrap());
        assert!(index.load().unwrap());
    }

    #[test]
    fn retrieve_requires_id_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, false);
        index.load().unwrap();
        match index.retrieve("vec-1") {
            Err(error) => match error.kind() {
                ErrorKind::UnsupportedOperation(op) => assert_eq!(*op, "id_to_vector"),
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("expected retrieve to fail"),
        };
    }

    #[test]
    fn retrieve_returns_vector_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, true);
        index.load().unwrap();
        let item = index.retrieve("vec-2").unwrap().unwrap();
        assert_eq!(item.metadata.id, "vec-2");
        let (vector, _, cols) = item.vector.unwrap().as_f32_matrix().unwrap();
        assert_eq!(cols, 2);
        assert_eq!(vector, vec![2.0, 0.0]);
        assert!(index.retrieve("ghost").unwrap().is_none());
    }

    #[test]
    fn query_dimension_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, false);
        index.load().unwrap();
        let query = NDArray::from_f32(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        assert!(index.knn_search(&query, 1).is_err());
    }

    #[test]
    fn add_vectors_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "shard.json");
        let mut index = open(path, false);
        index.load().unwrap();
        let vectors = NDArray::from_f32(vec![1.0, 1.0], vec![1, 2]).unwrap();
        assert!(index.add_vectors(&vectors, vec![metadata("new")]).is_err());
    }
}
