//! Metric instrument factories for correlate-jobs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one installed every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("correlate-jobs")
}

/// Counter: jobs created.
/// Labels: `job_type`, `correlated` ("true" | "false").
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("correlate.jobs.created")
        .with_description("Number of jobs created")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("correlate.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: continuations released or deleted when their parent finished.
/// Labels: `result` ("released" | "deleted").
pub fn continuations() -> Counter<u64> {
    meter()
        .u64_counter("correlate.continuations")
        .with_description("Continuations resolved after their parent finished")
        .build()
}

/// Counter: activity start attempts.
/// Labels: `result` ("started" | "declined").
pub fn activities() -> Counter<u64> {
    meter()
        .u64_counter("correlate.activities")
        .with_description("Correlation activities started or declined")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `job_type`, `result` ("succeeded" | "failed").
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("correlate.jobs.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
