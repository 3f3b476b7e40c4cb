use prometheus::CounterVec;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::Opts;
use prometheus::Registry;

use slog::Logger;

lazy_static! {
    /// Number of RPC requests handled, by endpoint and status code.
    pub static ref RPC_REQUESTS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_rpc_requests",
            "Number of RPC requests handled"
        ),
        &["endpoint", "code"]
    ).expect("Failed to create needlestack_rpc_requests counter");

    /// Duration of RPC request handling.
    pub static ref RPC_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "needlestack_rpc_request_duration",
            "Duration (in seconds) of RPC request handling"
        ),
        &["endpoint"]
    ).expect("Failed to create RPC_REQUEST_DURATION histogram");

    /// Number of shards dropped from merges for having no active replica.
    pub static ref SHARDS_WITHOUT_REPLICAS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_shards_without_replicas",
            "Number of shard lookups that found no active replica"
        ),
        &["collection"]
    ).expect("Failed to create needlestack_shards_without_replicas counter");
}

/// Attempts to register metrics with the Registry.
///
/// Metrics that fail to register are logged and ignored.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(RPC_REQUESTS_COUNT.clone())) {
        debug!(logger, "Failed to register RPC_REQUESTS_COUNT"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(RPC_REQUEST_DURATION.clone())) {
        debug!(logger, "Failed to register RPC_REQUEST_DURATION"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(SHARDS_WITHOUT_REPLICAS_COUNT.clone())) {
        debug!(logger, "Failed to register SHARDS_WITHOUT_REPLICAS_COUNT"; "error" => ?err);
    }
}
