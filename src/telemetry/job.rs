//! Job execution span helpers.
//!
//! Provides span creation and state-transition recording for jobs flowing
//! through the server.

use tracing::Span;

use crate::model::JobId;

/// Start a span for one job execution attempt.
///
/// `correlation.id` is declared empty; the activity started by the
/// correlation filter records it once the effective id is known.
pub fn start_job_span(job_type: &str, job_id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.type" = job_type,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "correlation.id" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
