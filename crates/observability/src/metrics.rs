//! Metric names and descriptions.
//!
//! The engine records through the `metrics` facade; whichever recorder the
//! host process installs (Prometheus exporter, statsd, none) receives them.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const JOBS_ENQUEUED: &str = "tidepool_jobs_enqueued_total";
pub const JOBS_CLAIMED: &str = "tidepool_jobs_claimed_total";
pub const JOBS_SUCCEEDED: &str = "tidepool_jobs_succeeded_total";
pub const JOBS_FAILED: &str = "tidepool_jobs_failed_total";
pub const JOBS_RETRIED: &str = "tidepool_jobs_retried_total";
pub const JOBS_CANCELLED: &str = "tidepool_jobs_cancelled_total";
pub const JOBS_REJECTED: &str = "tidepool_jobs_rejected_total";
pub const JOBS_TIMED_OUT: &str = "tidepool_jobs_timed_out_total";
pub const JOB_DURATION: &str = "tidepool_job_duration_seconds";
pub const QUEUE_DEPTH: &str = "tidepool_queue_depth";
pub const IN_FLIGHT: &str = "tidepool_jobs_in_flight";
pub const CONCURRENCY_CEILING: &str = "tidepool_concurrency_ceiling";
pub const STUCK_JOBS: &str = "tidepool_stuck_jobs";
pub const ALERTS_FIRED: &str = "tidepool_alerts_fired_total";

/// Register descriptions for every metric the engine emits.
pub fn describe_metrics() {
    describe_counter!(JOBS_ENQUEUED, "Jobs accepted by enqueue");
    describe_counter!(JOBS_CLAIMED, "Jobs claimed from the store for execution");
    describe_counter!(JOBS_SUCCEEDED, "Jobs that finished successfully");
    describe_counter!(JOBS_FAILED, "Jobs that reached terminal error");
    describe_counter!(JOBS_RETRIED, "Failed attempts scheduled for retry");
    describe_counter!(JOBS_CANCELLED, "Jobs cancelled explicitly or by cascade");
    describe_counter!(JOBS_REJECTED, "Jobs rejected at claim time (payload too large, no handler)");
    describe_counter!(JOBS_TIMED_OUT, "Jobs forcibly failed by the execution timeout");
    describe_histogram!(JOB_DURATION, Unit::Seconds, "Handler execution time per job kind");
    describe_gauge!(QUEUE_DEPTH, "Queued jobs waiting for a worker");
    describe_gauge!(IN_FLIGHT, "Jobs currently holding a worker slot");
    describe_gauge!(CONCURRENCY_CEILING, "Effective concurrency limit of the last tick");
    describe_gauge!(STUCK_JOBS, "Jobs that can never become ready (dependency cycle)");
    describe_counter!(ALERTS_FIRED, "Alerts emitted, labelled by severity");
}
