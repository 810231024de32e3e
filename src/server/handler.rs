//! Job handlers and their registry.
//!
//! A handler is the business logic for one job type. The job names its type
//! directly; the registry maps that name to the handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::correlation;
use crate::error::JobError;
use crate::model::{Job, JobId};

pub type HandlerResult = Result<serde_json::Value, JobError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Business logic for one job type.
pub trait JobHandler: Send + Sync {
    fn perform(&self, ctx: JobContext) -> HandlerFuture;
}

/// What a handler sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub args: serde_json::Value,
    pub attempt: u32,
}

impl JobContext {
    pub(crate) fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            args: job.args.clone(),
            attempt: job.attempts,
        }
    }

    /// The ambient correlation id of the calling task.
    pub fn correlation_id(&self) -> Option<String> {
        correlation::current_correlation_id()
    }
}

struct FnHandler<F>(F);

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn perform(&self, ctx: JobContext) -> HandlerFuture {
        Box::pin((self.0)(ctx))
    }
}

/// Registry of handlers, indexed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Register an async closure as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler(f)))
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
