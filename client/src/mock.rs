//! Canned clients for tests.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use needlestack_models::api::CollectionsLoadRequest;
use needlestack_models::api::CollectionsLoadResponse;
use needlestack_models::api::RetrievalResultItem;
use needlestack_models::api::RetrieveRequest;
use needlestack_models::api::RetrieveResponse;
use needlestack_models::api::SearchRequest;
use needlestack_models::api::SearchResponse;
use needlestack_models::api::SearchResultItem;

use super::ErrorKind;
use super::Result;
use super::SearcherClient;

/// Searcher client returning scripted responses and recording requests.
#[derive(Default)]
pub struct MockSearcherClient {
    /// Items returned from every search, already sorted by distance.
    pub items: Vec<SearchResultItem>,

    /// Item returned from every retrieve.
    pub retrieve_item: Option<RetrievalResultItem>,

    /// Success flag of collections_load responses.
    pub load_success: bool,

    /// When set, every call fails with this remote (code, message).
    pub fail_with: Option<(&'static str, String)>,

    /// Search requests seen, in order.
    pub search_requests: Mutex<Vec<SearchRequest>>,

    pub load_calls: AtomicUsize,
}

impl MockSearcherClient {
    pub fn answering(items: Vec<SearchResultItem>) -> MockSearcherClient {
        MockSearcherClient {
            items,
            load_success: true,
            ..MockSearcherClient::default()
        }
    }

    fn fail(&self) -> Option<super::Error> {
        self.fail_with
            .as_ref()
            .map(|(code, message)| ErrorKind::Remote(*code, message.clone()).into())
    }
}

impl SearcherClient for MockSearcherClient {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if let Some(error) = self.fail() {
            return Err(error);
        }
        self.search_requests
            .lock()
            .expect("mock requests lock poisoned")
            .push(request.clone());
        Ok(SearchResponse {
            items: self.items.clone(),
        })
    }

    fn retrieve(&self, _: &RetrieveRequest) -> Result<RetrieveResponse> {
        if let Some(error) = self.fail() {
            return Err(error);
        }
        Ok(RetrieveResponse {
            item: self.retrieve_item.clone(),
        })
    }

    fn collections_load(&self, _: &CollectionsLoadRequest) -> Result<CollectionsLoadResponse> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail() {
            return Err(error);
        }
        Ok(CollectionsLoadResponse {
            success: self.load_success,
        })
    }
}
