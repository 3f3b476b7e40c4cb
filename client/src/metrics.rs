use prometheus::CounterVec;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::Opts;
use prometheus::Registry;

use slog::Logger;

lazy_static! {
    /// Counter for client operations.
    pub static ref CLIENT_OPS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_client_operations",
            "Number of client operations issued"
        ),
        &["endpoint"]
    ).expect("Failed to create needlestack_client_operations counter");

    /// Counter for client operation errors.
    pub static ref CLIENT_OP_ERRORS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_client_operation_errors",
            "Number of client operations failed"
        ),
        &["endpoint"]
    ).expect("Failed to create needlestack_client_operation_errors counter");

    /// Observe duration of client operations.
    pub static ref CLIENT_OPS_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "needlestack_client_operations_duration",
            "Duration (in seconds) of client operations"
        ),
        &["endpoint"]
    ).expect("Failed to create CLIENT_OPS_DURATION histogram");
}

/// Attempts to register metrics with the Registry.
///
/// Metrics that fail to register are logged and ignored.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(CLIENT_OPS_COUNT.clone())) {
        slog::debug!(logger, "Failed to register CLIENT_OPS_COUNT"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(CLIENT_OP_ERRORS_COUNT.clone())) {
        slog::debug!(logger, "Failed to register CLIENT_OP_ERRORS_COUNT"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(CLIENT_OPS_DURATION.clone())) {
        slog::debug!(logger, "Failed to register CLIENT_OPS_DURATION"; "error" => ?err);
    }
}
