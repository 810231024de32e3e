//! One execution attempt: server filters around the handler.
//!
//! The attempt runs inside a fresh ambient frame. Pre-hooks run in
//! registration order, then the handler, then post-hooks in reverse order.
//! Post-hooks are owned by a guard, so they also run when the attempt is
//! dropped part way through.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::handler::{HandlerResult, JobContext, JobHandler};
use crate::correlation;
use crate::error::JobError;
use crate::filter::{Items, PerformedContext, PerformingContext, ServerFilter};
use crate::model::Job;

/// Result of running one execution attempt.
#[derive(Debug)]
pub enum ExecutionResult {
    Succeeded {
        data: serde_json::Value,
        duration_ms: u64,
    },
    Failed {
        error: JobError,
        duration_ms: u64,
    },
}

/// Run `job` once: filters, then `handler`, then filters again.
pub async fn execute(
    job: &Job,
    filters: &[Arc<dyn ServerFilter>],
    handler: Option<Arc<dyn JobHandler>>,
) -> ExecutionResult {
    correlation::frame(async {
        let start = Instant::now();
        let mut scope = FilterScope::enter(job, filters);

        let result = run_handler(job, handler).await;
        scope.exit(&result);

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(data) => ExecutionResult::Succeeded { data, duration_ms },
            Err(error) => ExecutionResult::Failed { error, duration_ms },
        }
    })
    .await
}

/// Runs the handler on its own task so a panic becomes a failed attempt.
/// The task inherits the ambient id set up by the pre-hooks and is aborted
/// if this future is dropped.
async fn run_handler(job: &Job, handler: Option<Arc<dyn JobHandler>>) -> HandlerResult {
    let Some(handler) = handler else {
        return Err(JobError::UnknownJobType(job.job_type.clone()));
    };

    let mut task = JoinSet::new();
    task.spawn(correlation::carry(handler.perform(JobContext::for_job(job))));

    match task.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => Err(JobError::Panicked(panic_message(e.into_panic()))),
        Some(Err(e)) => Err(JobError::failed(format!("handler task ended: {e}"))),
        None => Err(JobError::failed("handler task was never started")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owns the side table between pre- and post-hooks. Post-hooks run exactly
/// once: on [`exit`](Self::exit), or on drop if the attempt never got there.
struct FilterScope<'a> {
    job: &'a Job,
    filters: &'a [Arc<dyn ServerFilter>],
    items: Items,
    exited: bool,
}

impl<'a> FilterScope<'a> {
    fn enter(job: &'a Job, filters: &'a [Arc<dyn ServerFilter>]) -> Self {
        let mut items = Items::new();
        for filter in filters {
            filter.on_performing(&mut PerformingContext::new(job, &mut items));
        }
        debug!(job.id = %job.id, filters = filters.len(), "pre-execution filters ran");
        Self {
            job,
            filters,
            items,
            exited: false,
        }
    }

    fn exit(&mut self, result: &HandlerResult) {
        if self.exited {
            return;
        }
        self.exited = true;
        for filter in self.filters.iter().rev() {
            filter.on_performed(&mut PerformedContext::new(self.job, &mut self.items, result));
        }
    }
}

impl Drop for FilterScope<'_> {
    fn drop(&mut self) {
        if !self.exited {
            warn!(job.id = %self.job.id, "execution abandoned, running post-execution filters");
            self.exit(&Err(JobError::failed("execution cancelled")));
        }
    }
}
