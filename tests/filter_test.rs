//! Server-side correlation filter: scope bookkeeping around execution,
//! declined activities, and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use correlate_jobs::correlation::{
    self, Activity, ActivityFactory, AmbientAccessor, CorrelationActivity, CorrelationContext,
    CorrelationManager,
};
use correlate_jobs::error::JobError;
use correlate_jobs::filter::correlate::{ACTIVITY_ITEM_KEY, CORRELATION_ID_KEY};
use correlate_jobs::filter::{Items, PerformedContext, PerformingContext, ServerFilter};
use correlate_jobs::model::*;
use correlate_jobs::queue::JobQueue;
use correlate_jobs::server::{ExecutionResult, HandlerRegistry, JobHandler, execute};
use correlate_jobs::setup::CorrelateServices;
use serde_json::json;

#[derive(Default)]
struct Counts {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

/// Wraps the real activity and counts starts and stops.
struct CountingFactory(Arc<Counts>);

struct CountingActivity {
    inner: CorrelationActivity,
    counts: Arc<Counts>,
    open: bool,
}

impl ActivityFactory for CountingFactory {
    fn create_activity(&self) -> Box<dyn Activity> {
        Box::new(CountingActivity {
            inner: CorrelationActivity::new(),
            counts: self.0.clone(),
            open: false,
        })
    }
}

impl Activity for CountingActivity {
    fn start(&mut self, correlation_id: &str) -> Option<CorrelationContext> {
        let context = self.inner.start(correlation_id)?;
        self.open = true;
        self.counts.started.fetch_add(1, Ordering::SeqCst);
        Some(context)
    }

    fn stop(&mut self) {
        if self.open {
            self.open = false;
            self.counts.stopped.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.stop();
    }
}

/// Never opens a scope.
struct DecliningFactory;

struct DecliningActivity;

impl ActivityFactory for DecliningFactory {
    fn create_activity(&self) -> Box<dyn Activity> {
        Box::new(DecliningActivity)
    }
}

impl Activity for DecliningActivity {
    fn start(&mut self, _correlation_id: &str) -> Option<CorrelationContext> {
        None
    }

    fn stop(&mut self) {}
}

fn queue_with(factory: Arc<dyn ActivityFactory>) -> JobQueue {
    let services = CorrelateServices::new()
        .accessor(Arc::new(AmbientAccessor))
        .activity_factory(factory);
    JobQueue::builder().use_correlate(&services).unwrap().build()
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::empty();
    registry.register_fn("observe", |ctx| async move {
        Ok::<_, JobError>(json!({ "observed": ctx.correlation_id() }))
    });
    registry.register_fn("fail", |_ctx| async move {
        Err::<serde_json::Value, _>(JobError::failed("nope"))
    });
    registry.register_fn("panic", |_ctx| async move {
        if true {
            panic!("boom");
        }
        Ok::<_, JobError>(json!(null))
    });
    registry.register_fn("hang", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, JobError>(json!(null))
    });
    registry
}

async fn execute_one(queue: &JobQueue, job_type: &str) -> (Job, ExecutionResult) {
    let id = CorrelationManager::new()
        .correlate(Some("req-1".into()), async { queue.enqueue(job_type, json!({})) })
        .await
        .unwrap();
    let job = queue.claim("test-worker").unwrap().expect("job is queued");
    assert_eq!(job.id, id);
    let result = execute(&job, queue.filters().server(), registry().get(job_type)).await;
    (job, result)
}

// ---------------------------------------------------------------------------
// Scope bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scope_opens_and_closes_once_per_attempt() {
    for job_type in ["observe", "fail", "panic"] {
        let counts = Arc::new(Counts::default());
        let queue = queue_with(Arc::new(CountingFactory(counts.clone())));

        execute_one(&queue, job_type).await;

        assert_eq!(counts.started.load(Ordering::SeqCst), 1, "{job_type}");
        assert_eq!(counts.stopped.load(Ordering::SeqCst), 1, "{job_type}");
    }
}

#[tokio::test]
async fn failing_handler_is_reported_as_failed() {
    let queue = queue_with(Arc::new(CorrelationManager::new()));

    match execute_one(&queue, "fail").await.1 {
        ExecutionResult::Failed { error, .. } => assert_eq!(error.to_string(), "nope"),
        other => panic!("expected failure, got {other:?}"),
    }
    match execute_one(&queue, "panic").await.1 {
        ExecutionResult::Failed { error, .. } => {
            assert!(matches!(error, JobError::Panicked(ref msg) if msg == "boom"))
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_attempt_still_closes_its_scope() {
    let counts = Arc::new(Counts::default());
    let queue = queue_with(Arc::new(CountingFactory(counts.clone())));

    let outcome = tokio::time::timeout(Duration::from_millis(50), execute_one(&queue, "hang")).await;
    assert!(outcome.is_err(), "hang should not finish");

    assert_eq!(counts.started.load(Ordering::SeqCst), 1);
    assert_eq!(counts.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn declined_activity_runs_job_uncorrelated() {
    let queue = queue_with(Arc::new(DecliningFactory));

    let (job, result) = execute_one(&queue, "observe").await;

    // The id is still persisted; only the execution scope is missing.
    assert_eq!(job.parameter(CORRELATION_ID_KEY), Some("\"req-1\""));
    match result {
        ExecutionResult::Succeeded { data, .. } => assert!(data["observed"].is_null()),
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_handler_still_runs_filters() {
    let counts = Arc::new(Counts::default());
    let queue = queue_with(Arc::new(CountingFactory(counts.clone())));
    queue.enqueue("unregistered", json!({})).unwrap();
    let job = queue.claim("w").unwrap().unwrap();

    let result = execute(&job, queue.filters().server(), None::<Arc<dyn JobHandler>>).await;

    assert!(matches!(
        result,
        ExecutionResult::Failed { error: JobError::UnknownJobType(ref t), .. } if t == "unregistered"
    ));
    assert_eq!(counts.stopped.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Hooks driven by hand
// ---------------------------------------------------------------------------

fn filter() -> Arc<dyn ServerFilter> {
    let queue = JobQueue::builder().use_default_correlate().unwrap().build();
    queue.filters().server()[0].clone()
}

fn job_with_id(id: &str, stored: Option<&str>) -> Job {
    let now = chrono::Utc::now();
    let mut parameters = std::collections::BTreeMap::new();
    if let Some(stored) = stored {
        parameters.insert(CORRELATION_ID_KEY.to_string(), stored.to_string());
    }
    Job {
        id: JobId::from(id),
        job_type: "manual".to_string(),
        args: json!({}),
        parameters,
        parent_id: None,
        continuation: ContinuationOptions::default(),
        state: JobState::Processing,
        attempts: 1,
        created_at: now,
        updated_at: now,
        finished_at: None,
        outcome: None,
    }
}

#[tokio::test]
async fn pre_hook_prefers_stored_id_and_post_hook_restores() {
    let filter = filter();
    let job = job_with_id("job-1", Some("\"stored-id\""));

    correlation::frame(async {
        let mut items = Items::new();
        filter.on_performing(&mut PerformingContext::new(&job, &mut items));

        assert_eq!(correlation::current_correlation_id().as_deref(), Some("stored-id"));
        assert_eq!(items.get::<String>(CORRELATION_ID_KEY).map(String::as_str), Some("stored-id"));
        assert!(items.contains_key(ACTIVITY_ITEM_KEY));

        let result = Ok(json!(null));
        filter.on_performed(&mut PerformedContext::new(&job, &mut items, &result));

        assert_eq!(correlation::current_correlation_id(), None);
        assert!(!items.contains_key(ACTIVITY_ITEM_KEY));
    })
    .await;
}

#[tokio::test]
async fn pre_hook_falls_back_to_job_id_for_blank_or_null() {
    let filter = filter();
    for stored in [None, Some("null"), Some("\"  \"")] {
        let job = job_with_id("job-2", stored);
        correlation::frame(async {
            let mut items = Items::new();
            filter.on_performing(&mut PerformingContext::new(&job, &mut items));
            assert_eq!(
                correlation::current_correlation_id().as_deref(),
                Some("job-2"),
                "stored {stored:?}"
            );
        })
        .await;
    }
}

#[tokio::test]
async fn post_hook_without_pre_hook_is_a_no_op() {
    let filter = filter();
    let job = job_with_id("job-3", None);

    CorrelationManager::new()
        .correlate(Some("outer".into()), async {
            let mut items = Items::new();
            let result = Err(JobError::failed("never ran"));
            filter.on_performed(&mut PerformedContext::new(&job, &mut items, &result));
            assert_eq!(correlation::current_correlation_id().as_deref(), Some("outer"));
        })
        .await;
}

#[test]
fn pre_hook_outside_any_frame_declines() {
    let filter = filter();
    let job = job_with_id("job-4", None);
    let mut items = Items::new();

    filter.on_performing(&mut PerformingContext::new(&job, &mut items));

    assert!(items.is_empty());
    assert_eq!(correlation::current_correlation_id(), None);
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[test]
fn items_remove_with_wrong_type_keeps_value() {
    let mut items = Items::new();
    items.insert("answer", 42u32);

    assert_eq!(items.remove::<String>("answer"), None);
    assert_eq!(items.get::<u32>("answer"), Some(&42));
    assert_eq!(items.remove::<u32>("answer"), Some(42));
    assert!(items.is_empty());
}
