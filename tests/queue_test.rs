//! Integration tests for the job queue lifecycle, without correlation.

use correlate_jobs::error::Error;
use correlate_jobs::event::EventKind;
use correlate_jobs::model::*;
use correlate_jobs::queue::JobQueue;
use serde_json::json;

// ---------------------------------------------------------------------------
// Basic lifecycle: enqueue → claim → complete
// ---------------------------------------------------------------------------

#[test]
fn enqueue_creates_queued_job() {
    let queue = JobQueue::in_memory();

    let id = queue.enqueue("resize-image", json!({"width": 640})).unwrap();
    let job = queue.get(&id).unwrap();

    assert_eq!(job.job_type, "resize-image");
    assert_eq!(job.args, json!({"width": 640}));
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);
    assert!(job.parameters.is_empty());
    assert_eq!(queue.queued_len().unwrap(), 1);
}

#[test]
fn full_lifecycle_enqueue_claim_complete() {
    let queue = JobQueue::in_memory();
    let id = queue.enqueue("resize-image", json!({})).unwrap();

    let claimed = queue.claim("worker-1").unwrap().expect("should claim job");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.attempts, 1);
    assert!(queue.claim("worker-2").unwrap().is_none());

    queue
        .complete(&id, Outcome::succeeded(json!({"ok": true}), 12))
        .unwrap();

    let done = queue.get(&id).unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert!(done.finished_at.is_some());
    let outcome = done.outcome.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.duration_ms, 12);
}

#[test]
fn failed_job_records_error() {
    let queue = JobQueue::in_memory();
    let id = queue.enqueue("resize-image", json!({})).unwrap();
    queue.claim("worker-1").unwrap();

    queue.fail(&id, Outcome::failed("disk full", 3)).unwrap();

    let job = queue.get(&id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.outcome.unwrap().error.as_deref(), Some("disk full"));
}

#[test]
fn claim_is_fifo() {
    let queue = JobQueue::in_memory();
    let first = queue.enqueue("a", json!({})).unwrap();
    let second = queue.enqueue("b", json!({})).unwrap();

    assert_eq!(queue.claim("w").unwrap().unwrap().id, first);
    assert_eq!(queue.claim("w").unwrap().unwrap().id, second);
}

#[test]
fn deleted_job_is_never_claimed() {
    let queue = JobQueue::in_memory();
    let id = queue.enqueue("a", json!({})).unwrap();

    queue.delete(&id, "no longer needed").unwrap();

    assert_eq!(queue.get(&id).unwrap().state, JobState::Deleted);
    assert_eq!(queue.queued_len().unwrap(), 0);
    assert!(queue.claim("w").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn blank_job_type_is_rejected() {
    let queue = JobQueue::in_memory();
    let err = queue.enqueue("  ", json!({})).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { param: "job_type", .. }), "{err:?}");
}

#[test]
fn completing_a_queued_job_is_an_invalid_transition() {
    let queue = JobQueue::in_memory();
    let id = queue.enqueue("a", json!({})).unwrap();

    let err = queue.complete(&id, Outcome::succeeded(json!(null), 0)).unwrap_err();
    assert!(
        matches!(
            err,
            Error::InvalidTransition {
                from: JobState::Queued,
                to: JobState::Succeeded
            }
        ),
        "{err:?}"
    );
}

#[test]
fn unknown_job_is_not_found() {
    let queue = JobQueue::in_memory();
    assert!(matches!(
        queue.get(&JobId::from("missing")),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn state_names_round_trip_through_display() {
    for state in [
        JobState::Created,
        JobState::Awaiting,
        JobState::Queued,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ] {
        assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
    }
    assert!("paused".parse::<JobState>().is_err());
}

#[test]
fn continuation_release_rules() {
    use ContinuationOptions::*;
    assert!(OnlyOnSucceeded.releases_on(JobState::Succeeded));
    assert!(!OnlyOnSucceeded.releases_on(JobState::Failed));
    assert!(!OnlyOnSucceeded.releases_on(JobState::Deleted));
    assert!(OnAnyFinished.releases_on(JobState::Failed));
    assert!(OnAnyFinished.releases_on(JobState::Deleted));
    assert!(!OnAnyFinished.releases_on(JobState::Processing));
}

// ---------------------------------------------------------------------------
// Queries and events
// ---------------------------------------------------------------------------

#[test]
fn list_by_state_filters_jobs() {
    let queue = JobQueue::in_memory();
    let a = queue.enqueue("a", json!({})).unwrap();
    let b = queue.enqueue("b", json!({})).unwrap();
    queue.claim("w").unwrap();

    let processing = queue.list_by_state(JobState::Processing).unwrap();
    let queued = queue.list_by_state(JobState::Queued).unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, a);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, b);
}

#[test]
fn events_are_recorded_in_order() {
    let queue = JobQueue::in_memory();
    let id = queue.enqueue("a", json!({})).unwrap();
    queue.claim("worker-1").unwrap();
    queue.complete(&id, Outcome::succeeded(json!(null), 1)).unwrap();

    let events = queue.events_since(0).unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);

    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::JobCreated { correlation_id, .. } => {
                assert_eq!(*correlation_id, None);
                Some("created")
            }
            EventKind::JobQueued { .. } => Some("queued"),
            EventKind::JobClaimed { worker_id, .. } => {
                assert_eq!(worker_id, "worker-1");
                Some("claimed")
            }
            EventKind::JobSucceeded { .. } => Some("succeeded"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, ["created", "queued", "claimed", "succeeded"]);

    let last = events.last().unwrap().seq;
    assert!(queue.events_since(last).unwrap().is_empty());
}
