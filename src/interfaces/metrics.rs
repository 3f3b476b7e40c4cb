use iron::headers::ContentType;
use iron::status;
use iron::IronResult;
use iron::Request;
use iron::Response;

use prometheus::Encoder;
use prometheus::Registry;
use prometheus::TextEncoder;

use super::super::Result;

/// Interface for metrics collection.
///
/// This interface provides access to the [`Registry`] and serves the
/// text-format scrape endpoint. Other interfaces and components register
/// their metrics during initialisation.
pub struct Metrics {
    registry: Registry,
}

impl Metrics {
    /// Creates a new `Metrics` interface.
    pub fn new() -> Metrics {
        let registry = Registry::new();
        Metrics { registry }
    }

    /// Access the metrics registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handler serving the scrape endpoint.
    pub fn handler(&self) -> impl iron::Handler {
        let registry = self.registry.clone();
        move |_: &mut Request| -> IronResult<Response> {
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();
            let families = registry.gather();
            if encoder.encode(&families, &mut buffer).is_err() {
                return Ok(Response::with((
                    status::InternalServerError,
                    "Unable to encode metrics",
                )));
            }
            let mut response = Response::with((status::Ok, buffer));
            response.headers.set(ContentType::plaintext());
            Ok(response)
        }
    }

    /// Noop method for standard interface.
    pub fn run(&self) -> Result<()> {
        Ok(())
    }

    /// Noop method for standard interface.
    pub fn wait(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use iron::status;
    use iron::Headers;
    use iron_test::request;

    use super::Metrics;

    #[test]
    fn scrape_endpoint_responds() {
        let metrics = Metrics::new();
        let handler = metrics.handler();
        let response =
            request::get("http://host:16016/metrics", Headers::new(), &handler).unwrap();
        assert_eq!(response.status, Some(status::Ok));
    }
}
