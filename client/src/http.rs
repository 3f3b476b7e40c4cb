use std::fs;
use std::time::Duration;

use failure::ResultExt;
use reqwest::blocking::Client as ReqwestClient;
use reqwest::Certificate;
use serde::de::DeserializeOwned;
use serde::Serialize;

use needlestack_models::api::CollectionsAddRequest;
use needlestack_models::api::CollectionsAddResponse;
use needlestack_models::api::CollectionsDeleteRequest;
use needlestack_models::api::CollectionsDeleteResponse;
use needlestack_models::api::CollectionsListRequest;
use needlestack_models::api::CollectionsListResponse;
use needlestack_models::api::CollectionsLoadRequest;
use needlestack_models::api::CollectionsLoadResponse;
use needlestack_models::api::ErrorEnvelope;
use needlestack_models::api::HealthResponse;
use needlestack_models::api::RetrieveRequest;
use needlestack_models::api::RetrieveResponse;
use needlestack_models::api::SearchRequest;
use needlestack_models::api::SearchResponse;

use super::metrics::CLIENT_OPS_COUNT;
use super::metrics::CLIENT_OPS_DURATION;
use super::metrics::CLIENT_OP_ERRORS_COUNT;
use super::ErrorKind;
use super::HealthClient;
use super::MergerClient;
use super::Result;
use super::SearcherClient;

/// Client-side TLS material for talking to a node.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Credentials {
    /// PEM file with the CA certificate the server's chain is checked
    /// against; plain HTTP when unset.
    pub ca_cert_file: Option<String>,
}

impl Credentials {
    /// Stable key fragment for client pools.
    pub fn cache_key(&self) -> &str {
        self.ca_cert_file.as_ref().map(String::as_str).unwrap_or("")
    }

    fn scheme(&self) -> &'static str {
        match self.ca_cert_file {
            Some(_) => "https",
            None => "http",
        }
    }
}

/// Shared HTTP plumbing for the typed service clients.
struct HttpTransport {
    client: ReqwestClient,
    hostport: String,
    root_url: String,
}

impl HttpTransport {
    fn new(hostport: &str, credentials: &Credentials, timeout: Duration) -> Result<HttpTransport> {
        let mut builder = ReqwestClient::builder().timeout(timeout);
        if let Some(ref ca_cert_file) = credentials.ca_cert_file {
            let pem = fs::read(ca_cert_file)
                .with_context(|_| ErrorKind::Credentials(ca_cert_file.clone()))?;
            let certificate = Certificate::from_pem(&pem)
                .with_context(|_| ErrorKind::Credentials(ca_cert_file.clone()))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .with_context(|_| ErrorKind::Transport(hostport.to_string()))?;
        Ok(HttpTransport {
            client,
            hostport: hostport.to_string(),
            root_url: format!("{}://{}", credentials.scheme(), hostport),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.root_url, path.trim_start_matches('/'))
    }

    fn post<Req, Resp>(&self, path: &'static str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        CLIENT_OPS_COUNT.with_label_values(&[path]).inc();
        let _timer = CLIENT_OPS_DURATION.with_label_values(&[path]).start_timer();
        let response = self
            .client
            .post(self.endpoint(path))
            .json(request)
            .send()
            .map_err(|error| {
                CLIENT_OP_ERRORS_COUNT.with_label_values(&[path]).inc();
                error
            })
            .with_context(|_| ErrorKind::Transport(self.hostport.clone()))?;
        self.decode(path, response)
    }

    fn get<Resp: DeserializeOwned>(&self, path: &'static str) -> Result<Resp> {
        CLIENT_OPS_COUNT.with_label_values(&[path]).inc();
        let _timer = CLIENT_OPS_DURATION.with_label_values(&[path]).start_timer();
        let response = self
            .client
            .get(self.endpoint(path))
            .send()
            .map_err(|error| {
                CLIENT_OP_ERRORS_COUNT.with_label_values(&[path]).inc();
                error
            })
            .with_context(|_| ErrorKind::Transport(self.hostport.clone()))?;
        self.decode(path, response)
    }

    /// Parse a success body, or map an error envelope back to its status.
    fn decode<Resp: DeserializeOwned>(
        &self,
        path: &'static str,
        response: reqwest::blocking::Response,
    ) -> Result<Resp> {
        let status = response.status();
        if status.is_success() {
            let body = response
                .json()
                .with_context(|_| ErrorKind::Decode(self.endpoint(path)))?;
            return Ok(body);
        }
        CLIENT_OP_ERRORS_COUNT.with_label_values(&[path]).inc();
        match response.json::<ErrorEnvelope>() {
            Ok(envelope) => Err(ErrorKind::remote(envelope.code, envelope.error).into()),
            Err(_) => Err(ErrorKind::Remote(
                "UNKNOWN",
                format!("{} replied with HTTP {}", self.hostport, status.as_u16()),
            )
            .into()),
        }
    }
}

/// Interface to interact with a (remote) searcher over HTTP.
pub struct HttpSearcherClient {
    transport: HttpTransport,
}

impl HttpSearcherClient {
    pub fn new(
        hostport: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<HttpSearcherClient> {
        let transport = HttpTransport::new(hostport, credentials, timeout)?;
        Ok(HttpSearcherClient { transport })
    }
}

impl SearcherClient for HttpSearcherClient {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.transport.post("/api/v1/search", request)
    }

    fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        self.transport.post("/api/v1/retrieve", request)
    }

    fn collections_load(
        &self,
        request: &CollectionsLoadRequest,
    ) -> Result<CollectionsLoadResponse> {
        self.transport.post("/api/v1/collections/load", request)
    }
}

impl HealthClient for HttpSearcherClient {
    fn check(&self) -> Result<HealthResponse> {
        self.transport.get("/api/v1/health")
    }
}

/// Interface to interact with a (remote) merger over HTTP.
pub struct HttpMergerClient {
    transport: HttpTransport,
}

impl HttpMergerClient {
    pub fn new(
        hostport: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<HttpMergerClient> {
        let transport = HttpTransport::new(hostport, credentials, timeout)?;
        Ok(HttpMergerClient { transport })
    }
}

impl MergerClient for HttpMergerClient {
    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.transport.post("/api/v1/search", request)
    }

    fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrieveResponse> {
        self.transport.post("/api/v1/retrieve", request)
    }

    fn collections_add(&self, request: &CollectionsAddRequest) -> Result<CollectionsAddResponse> {
        self.transport.post("/api/v1/collections/add", request)
    }

    fn collections_delete(
        &self,
        request: &CollectionsDeleteRequest,
    ) -> Result<CollectionsDeleteResponse> {
        self.transport.post("/api/v1/collections/delete", request)
    }

    fn collections_load(
        &self,
        request: &CollectionsLoadRequest,
    ) -> Result<CollectionsLoadResponse> {
        self.transport.post("/api/v1/collections/load", request)
    }

    fn collections_list(
        &self,
        request: &CollectionsListRequest,
    ) -> Result<CollectionsListResponse> {
        self.transport.post("/api/v1/collections/list", request)
    }
}

impl HealthClient for HttpMergerClient {
    fn check(&self) -> Result<HealthResponse> {
        self.transport.get("/api/v1/health")
    }
}
