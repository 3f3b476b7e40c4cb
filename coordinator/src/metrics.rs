use prometheus::CounterVec;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::Opts;
use prometheus::Registry;

use slog::Logger;

lazy_static! {
    /// Duration of coordination store operations.
    pub static ref STORE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "needlestack_coordinator_op_duration",
            "Duration (in seconds) of coordination store operations"
        ),
        &["op"]
    ).expect("Failed to create STORE_OP_DURATION histogram");

    /// Number of coordination store operations that failed.
    pub static ref STORE_OP_ERRORS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_coordinator_op_errors",
            "Number of coordination store operations that failed"
        ),
        &["op"]
    ).expect("Failed to create STORE_OP_ERRORS_COUNT counter");

    /// Number of times a transaction was rolled back.
    pub static ref STORE_TX_ROLLBACK_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_coordinator_tx_rollbacks",
            "Number of coordination store transactions rolled back"
        ),
        &["op"]
    ).expect("Failed to create STORE_TX_ROLLBACK_COUNT counter");

    /// Number of session events observed, by kind.
    pub static ref SESSION_EVENTS_COUNT: CounterVec = CounterVec::new(
        Opts::new(
            "needlestack_coordinator_session_events",
            "Number of coordination session events observed"
        ),
        &["event"]
    ).expect("Failed to create SESSION_EVENTS_COUNT counter");
}

/// Attempts to register metrics with the Registry.
///
/// Metrics that fail to register are logged and ignored.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(STORE_OP_DURATION.clone())) {
        debug!(logger, "Failed to register STORE_OP_DURATION"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(STORE_OP_ERRORS_COUNT.clone())) {
        debug!(logger, "Failed to register STORE_OP_ERRORS_COUNT"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(STORE_TX_ROLLBACK_COUNT.clone())) {
        debug!(logger, "Failed to register STORE_TX_ROLLBACK_COUNT"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(SESSION_EVENTS_COUNT.clone())) {
        debug!(logger, "Failed to register SESSION_EVENTS_COUNT"; "error" => ?err);
    }
}
