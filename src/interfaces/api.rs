//! HTTP API interface exposing the Health, Merger and Searcher services.
//!
//! This interface is a wrapper around the [`iron`] framework: other
//! interfaces and components register their endpoints on the router before
//! the server thread starts.
use std::thread;
use std::thread::JoinHandle;

use bodyparser;
use iron::headers::ContentType;
use iron::method;
use iron::status;
use iron::Chain;
use iron::Handler;
use iron::Iron;
use iron::IronResult;
use iron::Plugin;
use iron::Request;
use iron::Response;
use router::Router;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json;
use slog::Logger;

use needlestack_models::api::ErrorEnvelope;
use needlestack_models::api::RpcCode;

use super::super::config::APIConfig;
use super::super::logging::failure_info;
use super::super::metrics::RPC_REQUESTS_COUNT;
use super::super::metrics::RPC_REQUEST_DURATION;
use super::super::Error;
use super::super::ErrorKind;
use super::super::Result;

/// The needlestack HTTP API interface.
pub struct API {
    bind: String,
    handle: Option<JoinHandle<()>>,
    logger: Logger,
    router: Option<RouterBuilder>,
    threads: usize,
}

impl API {
    /// Creates a new API interface; `bind` falls back to all interfaces on
    /// the node port.
    pub fn new(config: &APIConfig, port: u16, logger: Logger) -> API {
        let bind = config
            .bind
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", port));
        let mut router = RouterBuilder::new();
        router.get("/", root_index, "index");
        API {
            bind,
            handle: None,
            logger,
            router: Some(router),
            threads: config.threads,
        }
    }

    /// Register endpoints before the server starts.
    pub fn router(&mut self) -> &mut RouterBuilder {
        self.router
            .as_mut()
            .expect("router is only taken when the API server starts")
    }

    /// Creates an Iron server and spawns a thread to serve it.
    pub fn run(&mut self) -> Result<()> {
        let bind = self.bind.clone();
        let chain = self
            .router
            .take()
            .ok_or(ErrorKind::InterfaceInit("api"))?
            .build();
        let logger = self.logger.clone();
        let threads = self.threads;
        self.handle = Some(thread::spawn(move || {
            info!(logger, "Starting API server"; "bind" => bind.clone(), "threads" => threads);
            let mut server = Iron::new(chain);
            server.threads = threads;
            server.http(bind).expect("Unable to start API server");
        }));
        Ok(())
    }

    /// Wait for the server thread to stop.
    pub fn wait(&mut self) -> Result<()> {
        info!(self.logger, "Waiting for API server to stop");
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Root index (`/`) handler.
fn root_index(_: &mut Request) -> IronResult<Response> {
    Ok(Response::with((status::Ok, "Needlestack API server")))
}

/// A builder object for an `iron-router` [`Router`].
pub struct RouterBuilder {
    router: Router,
}

impl RouterBuilder {
    pub fn new() -> RouterBuilder {
        let router = Router::new();
        RouterBuilder { router }
    }

    /// Converts this builder into an iron [`Chain`].
    pub fn build(self) -> Chain {
        Chain::new(self.router)
    }

    /// Wrapper for [`Router::route`].
    pub fn route<S: AsRef<str>, H: Handler, I: AsRef<str>>(
        &mut self,
        method: method::Method,
        glob: S,
        handler: H,
        route_id: I,
    ) -> &mut RouterBuilder {
        self.router.route(method, glob, handler, route_id);
        self
    }

    /// Like route, but specialized to the `Get` method.
    pub fn get<S: AsRef<str>, H: Handler, I: AsRef<str>>(
        &mut self,
        glob: S,
        handler: H,
        route_id: I,
    ) -> &mut RouterBuilder {
        self.route(method::Get, glob, handler, route_id)
    }

    /// Like route, but specialized to the `Post` method.
    pub fn post<S: AsRef<str>, H: Handler, I: AsRef<str>>(
        &mut self,
        glob: S,
        handler: H,
        route_id: I,
    ) -> &mut RouterBuilder {
        self.route(method::Post, glob, handler, route_id)
    }
}

/// Serialize a payload into a JSON response.
pub fn json_response<T: Serialize>(code: status::Status, payload: &T) -> Response {
    let body = serde_json::to_string(payload).expect("Unable to encode response payload");
    let mut response = Response::with((code, body));
    response.headers.set(ContentType::json());
    response
}

/// Build the error envelope and HTTP status for a failed RPC.
fn error_response(endpoint: &'static str, logger: &Logger, error: &Error) -> Response {
    let code = error.rpc_code();
    let (display, causes) = failure_info(error);
    error!(
        logger, "RPC handler failed";
        "endpoint" => endpoint,
        "code" => code.as_str(),
        "error" => display,
        "causes" => causes,
    );
    let envelope = ErrorEnvelope {
        code,
        error: error.to_string(),
    };
    let code = match code {
        RpcCode::AlreadyExists => status::Conflict,
        RpcCode::FailedPrecondition => status::PreconditionFailed,
        RpcCode::InvalidArgument => status::BadRequest,
        RpcCode::NotFound => status::NotFound,
        RpcCode::Unavailable => status::ServiceUnavailable,
        RpcCode::Unknown => status::InternalServerError,
    };
    json_response(code, &envelope)
}

/// Wrap a POST service method into a JSON-in/JSON-out handler.
///
/// Any error coming out of the method is logged with its failure chain and
/// translated to an RPC status envelope.
pub fn json_endpoint<Req, Resp, F>(
    endpoint: &'static str,
    logger: Logger,
    method: F,
) -> impl Handler
where
    Req: 'static + Clone + DeserializeOwned + Send,
    Resp: Serialize,
    F: 'static + Fn(Req) -> Result<Resp> + Send + Sync,
{
    move |request: &mut Request| -> IronResult<Response> {
        let _timer = RPC_REQUEST_DURATION
            .with_label_values(&[endpoint])
            .start_timer();
        let body = match request.get::<bodyparser::Struct<Req>>() {
            Ok(Some(body)) => body,
            Ok(None) => {
                let error: Error = ErrorKind::InvalidArgument("missing request body".into()).into();
                RPC_REQUESTS_COUNT
                    .with_label_values(&[endpoint, "INVALID_ARGUMENT"])
                    .inc();
                return Ok(error_response(endpoint, &logger, &error));
            }
            Err(parse) => {
                let error: Error =
                    ErrorKind::InvalidArgument(format!("invalid request body: {}", parse)).into();
                RPC_REQUESTS_COUNT
                    .with_label_values(&[endpoint, "INVALID_ARGUMENT"])
                    .inc();
                return Ok(error_response(endpoint, &logger, &error));
            }
        };
        match method(body) {
            Ok(response) => {
                RPC_REQUESTS_COUNT.with_label_values(&[endpoint, "OK"]).inc();
                Ok(json_response(status::Ok, &response))
            }
            Err(error) => {
                RPC_REQUESTS_COUNT
                    .with_label_values(&[endpoint, error.rpc_code().as_str()])
                    .inc();
                Ok(error_response(endpoint, &logger, &error))
            }
        }
    }
}

/// Wrap a GET service method into a JSON-out handler.
pub fn json_get_endpoint<Resp, F>(
    endpoint: &'static str,
    logger: Logger,
    method: F,
) -> impl Handler
where
    Resp: Serialize,
    F: 'static + Fn() -> Result<Resp> + Send + Sync,
{
    move |_: &mut Request| -> IronResult<Response> {
        let _timer = RPC_REQUEST_DURATION
            .with_label_values(&[endpoint])
            .start_timer();
        match method() {
            Ok(response) => {
                RPC_REQUESTS_COUNT.with_label_values(&[endpoint, "OK"]).inc();
                Ok(json_response(status::Ok, &response))
            }
            Err(error) => {
                RPC_REQUESTS_COUNT
                    .with_label_values(&[endpoint, error.rpc_code().as_str()])
                    .inc();
                Ok(error_response(endpoint, &logger, &error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use iron::status;
    use iron::Headers;
    use iron_test::request;
    use iron_test::response;
    use slog::Discard;
    use slog::Logger;

    use needlestack_models::api::HealthResponse;
    use needlestack_models::api::HealthStatus;

    use super::super::super::ErrorKind;
    use super::json_endpoint;
    use super::json_get_endpoint;

    #[test]
    fn get_endpoint_serializes_payload() {
        let handler = json_get_endpoint("/api/v1/health", Logger::root(Discard, o!()), || {
            Ok(HealthResponse {
                status: HealthStatus::Serving,
            })
        });
        let response = request::get("http://host:16016/api/v1/health", Headers::new(), &handler)
            .unwrap();
        assert_eq!(response.status, Some(status::Ok));
        let body = response::extract_body_to_string(response);
        assert_eq!(body, r#"{"status":"SERVING"}"#);
    }

    #[test]
    fn errors_become_envelopes() {
        let handler = json_get_endpoint::<HealthResponse, _>(
            "/api/v1/health",
            Logger::root(Discard, o!()),
            || Err(ErrorKind::NotFound("no such thing".into()).into()),
        );
        let response = request::get("http://host:16016/api/v1/health", Headers::new(), &handler)
            .unwrap();
        assert_eq!(response.status, Some(status::NotFound));
        let body = response::extract_body_to_string(response);
        assert_eq!(body, r#"{"code":"NOT_FOUND","error":"no such thing"}"#);
    }

    #[test]
    fn post_endpoint_rejects_garbage() {
        let handler = json_endpoint(
            "/api/v1/search",
            Logger::root(Discard, o!()),
            |_: needlestack_models::api::CollectionsListRequest| {
                Ok(needlestack_models::api::CollectionsListResponse::default())
            },
        );
        let response = request::post(
            "http://host:16016/api/v1/search",
            Headers::new(),
            "not json",
            &handler,
        )
        .unwrap();
        assert_eq!(response.status, Some(status::BadRequest));
    }
}
