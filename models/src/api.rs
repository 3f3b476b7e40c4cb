//! Wire messages for the Health, Merger and Searcher services.
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::Collection;
use super::Metadata;
use super::NDArray;

/// Status codes attached to RPC error envelopes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    NotFound,
    Unavailable,
    Unknown,
}

impl RpcCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::Unknown => "UNKNOWN",
        }
    }
}

/// JSON body attached to failed RPCs.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: RpcCode,
    pub error: String,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
    NotServing,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub vector: NDArray,
    pub count: usize,
    pub collection_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_names: Vec<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SearchResultItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_distance: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_distance: Option<f64>,

    pub metadata: Metadata,
}

impl SearchResultItem {
    pub fn from_f32(distance: f32, metadata: Metadata) -> SearchResultItem {
        SearchResultItem {
            float_distance: Some(distance),
            double_distance: None,
            metadata,
        }
    }

    pub fn from_f64(distance: f64, metadata: Metadata) -> SearchResultItem {
        SearchResultItem {
            float_distance: None,
            double_distance: Some(distance),
            metadata,
        }
    }

    /// Sort key: the float distance when set, the double distance otherwise.
    pub fn distance(&self) -> f64 {
        self.float_distance
            .map(f64::from)
            .or(self.double_distance)
            .unwrap_or(0.0)
    }
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<SearchResultItem>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub id: String,
    pub collection_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_names: Vec<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RetrievalResultItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<NDArray>,

    pub metadata: Metadata,
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct RetrieveResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<RetrievalResultItem>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct CollectionsAddRequest {
    pub collections: Vec<Collection>,

    #[serde(default)]
    pub noop: bool,
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsAddResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Collection>,
    pub success: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CollectionsDeleteRequest {
    pub names: Vec<String>,

    #[serde(default)]
    pub noop: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsDeleteResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    pub success: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsLoadRequest {}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsLoadResponse {
    pub success: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsListRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
}

#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CollectionsListResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<Collection>,
}

/// Streaming k-way merge of per-shard result lists.
///
/// Every input list must already be sorted by ascending distance; the output
/// is the globally sorted prefix of length `min(k, total items)`. Ties keep
/// the order of the input lists.
pub fn merge_result_lists(lists: Vec<Vec<SearchResultItem>>, k: usize) -> Vec<SearchResultItem> {
    let mut heap = BinaryHeap::with_capacity(lists.len());
    let mut lists: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    for (index, list) in lists.iter_mut().enumerate() {
        if let Some(item) = list.next() {
            heap.push(HeapEntry { item, index });
        }
    }
    let mut merged = Vec::with_capacity(k);
    while merged.len() < k {
        let entry = match heap.pop() {
            Some(entry) => entry,
            None => break,
        };
        if let Some(item) = lists[entry.index].next() {
            heap.push(HeapEntry {
                item,
                index: entry.index,
            });
        }
        merged.push(entry.item);
    }
    merged
}

/// Min-heap entry ordered by (distance, source list index).
struct HeapEntry {
    item: SearchResultItem,
    index: usize,
}

impl HeapEntry {
    fn key(&self) -> (f64, usize) {
        (self.item.distance(), self.index)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest distance first.
        let (dist, index) = self.key();
        let (other_dist, other_index) = other.key();
        other_dist
            .partial_cmp(&dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other_index.cmp(&index))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Metadata;
    use super::merge_result_lists;
    use super::SearchResultItem;

    fn item(distance: f32, id: &str) -> SearchResultItem {
        SearchResultItem::from_f32(distance, Metadata::new(id, Vec::new()))
    }

    fn distances(items: &[SearchResultItem]) -> Vec<f64> {
        items.iter().map(SearchResultItem::distance).collect()
    }

    #[test]
    fn merge_is_globally_sorted_prefix() {
        let lists = vec![
            vec![item(0.1, "a"), item(0.4, "b"), item(0.9, "c")],
            vec![item(0.2, "d"), item(0.3, "e")],
            vec![item(0.05, "f")],
        ];
        let merged = merge_result_lists(lists, 4);
        assert_eq!(distances(&merged), vec![0.05, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn merge_shorter_than_k() {
        let lists = vec![vec![item(0.7, "a")], vec![item(0.2, "b")]];
        let merged = merge_result_lists(lists, 10);
        assert_eq!(distances(&merged), vec![0.2, 0.7]);
    }

    #[test]
    fn merge_empty_inputs() {
        assert!(merge_result_lists(Vec::new(), 3).is_empty());
        assert!(merge_result_lists(vec![Vec::new(), Vec::new()], 3).is_empty());
    }

    #[test]
    fn merge_random_lists_matches_global_sort() {
        // Deterministic pseudo-random inputs; each list is sorted before the
        // merge, the reference result is a full sort of the union.
        let mut seed = 42u64;
        let mut next = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((seed >> 33) as f64) / f64::from(u32::max_value())
        };
        for round in 0..20 {
            let mut lists = Vec::new();
            let mut all = Vec::new();
            for _ in 0..(1 + round % 5) {
                let mut list: Vec<f64> = (0..(round % 7)).map(|_| next()).collect();
                list.sort_by(|a, b| a.partial_cmp(b).unwrap());
                all.extend(list.iter().cloned());
                lists.push(
                    list.into_iter()
                        .map(|d| SearchResultItem::from_f64(d, Metadata::new("x", Vec::new())))
                        .collect(),
                );
            }
            let k = 5;
            let merged = merge_result_lists(lists, k);
            all.sort_by(|a, b| a.partial_cmp(b).unwrap());
            all.truncate(k);
            assert_eq!(distances(&merged), all);
        }
    }

    #[test]
    fn merge_mixed_distance_kinds() {
        let lists = vec![
            vec![SearchResultItem::from_f64(0.25, Metadata::new("a", Vec::new()))],
            vec![item(0.5, "b")],
        ];
        let merged = merge_result_lists(lists, 2);
        assert_eq!(distances(&merged), vec![0.25, 0.5]);
    }
}
