//! The job queue. The public API for creating and retiring jobs.
//!
//! The queue owns storage and the filters installed at construction. Every
//! job creation runs the client filters against the pending job before it
//! is stored; continuations are released or deleted here when their parent
//! finishes.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::filter::correlate::CORRELATION_ID_KEY;
use crate::filter::{
    ClientFilter, CreatedContext, CreatingContext, JobFilters, ServerFilter,
    deserialize_parameter,
};
use crate::model::*;
use crate::storage::{Storage, TxContext};
use crate::telemetry::metrics;

/// Builder for a queue. Filters are fixed once the queue is built.
#[derive(Default)]
pub struct JobQueueBuilder {
    storage: Option<Arc<Storage>>,
    pub(crate) filters: JobFilters,
    pub(crate) correlate_installed: bool,
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing store instead of creating a fresh one.
    pub fn storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn client_filter(mut self, filter: Arc<dyn ClientFilter>) -> Self {
        self.filters.add_client(filter);
        self
    }

    pub fn server_filter(mut self, filter: Arc<dyn ServerFilter>) -> Self {
        self.filters.add_server(filter);
        self
    }

    pub fn build(self) -> JobQueue {
        JobQueue {
            storage: self.storage.unwrap_or_default(),
            filters: Arc::new(self.filters),
            work_ready: Arc::new(Notify::new()),
        }
    }
}

/// A job queue. Cheap to clone; clones share storage and filters.
#[derive(Clone)]
pub struct JobQueue {
    storage: Arc<Storage>,
    filters: Arc<JobFilters>,
    work_ready: Arc<Notify>,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    /// A queue with fresh in-memory storage and no filters.
    pub fn in_memory() -> Self {
        JobQueueBuilder::new().build()
    }

    pub fn filters(&self) -> &JobFilters {
        &self.filters
    }

    /// Create a job. Runs client filters, stores the job, and queues it or
    /// parks it behind its parent.
    pub fn create(&self, new: NewJob) -> Result<JobId> {
        if new.job_type.trim().is_empty() {
            return Err(Error::invalid_argument("job_type", "must not be blank"));
        }
        if let Some(parent_id) = new.initial_state.parent_id() {
            // A continuation is only ever created against a stored parent.
            self.storage.get_job(parent_id)?;
        }

        let now = Utc::now();
        let mut job = Job {
            id: JobId::generate(),
            job_type: new.job_type,
            args: new.args,
            parameters: Default::default(),
            parent_id: new.initial_state.parent_id().cloned(),
            continuation: match &new.initial_state {
                InitialState::Awaiting { options, .. } => *options,
                InitialState::Enqueued => ContinuationOptions::default(),
            },
            state: JobState::Created,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            outcome: None,
        };

        {
            let mut ctx = CreatingContext {
                job: &mut job,
                initial_state: &new.initial_state,
                storage: &self.storage,
            };
            for filter in self.filters.client() {
                filter.on_creating(&mut ctx);
            }
        }

        let correlation_id: Option<String> =
            deserialize_parameter(job.parameter(CORRELATION_ID_KEY)).unwrap_or_default();
        let id = job.id.clone();
        let job_type = job.job_type.clone();

        let state = self.storage.atomically(|tx| {
            // Decided under the lock so a parent finishing concurrently
            // either sees this continuation or is seen by it.
            let state = match &new.initial_state {
                InitialState::Enqueued => JobState::Queued,
                InitialState::Awaiting { parent_id, options } => {
                    let parent = tx.get_job(parent_id)?.state;
                    if !parent.is_finished() {
                        JobState::Awaiting
                    } else if options.releases_on(parent) {
                        JobState::Queued
                    } else {
                        JobState::Deleted
                    }
                }
            };

            tx.insert_job(job)?;
            tx.record_event(EventKind::JobCreated {
                id: id.clone(),
                job_type: job_type.clone(),
                parent_id: new.initial_state.parent_id().cloned(),
                correlation_id: correlation_id.clone(),
            });
            tx.update_state(&id, state)?;

            match (state, &new.initial_state) {
                (JobState::Awaiting, InitialState::Awaiting { parent_id, .. }) => {
                    tx.record_event(EventKind::JobAwaiting {
                        id: id.clone(),
                        parent_id: parent_id.clone(),
                    });
                }
                (JobState::Deleted, InitialState::Awaiting { parent_id, .. }) => {
                    tx.record_event(EventKind::JobDeleted {
                        id: id.clone(),
                        reason: format!("parent {parent_id} already finished"),
                    });
                }
                _ => {
                    tx.record_event(EventKind::JobQueued { id: id.clone() });
                }
            }
            Ok(state)
        })?;

        metrics::jobs_created().add(
            1,
            &[
                KeyValue::new("job_type", job_type.clone()),
                KeyValue::new("correlated", correlation_id.is_some().to_string()),
            ],
        );
        info!(
            job.id = %id,
            job_type = %job_type,
            state = %state,
            correlation.id = correlation_id.as_deref().unwrap_or("-"),
            "job created"
        );

        if !self.filters.client().is_empty() {
            let stored = self.storage.get_job(&id)?;
            let ctx = CreatedContext { job: &stored };
            for filter in self.filters.client() {
                filter.on_created(&ctx);
            }
        }

        if state == JobState::Queued {
            self.work_ready.notify_one();
        }
        Ok(id)
    }

    /// Create a job that runs as soon as a worker is free.
    pub fn enqueue(&self, job_type: impl Into<String>, args: serde_json::Value) -> Result<JobId> {
        self.create(NewJob::new(job_type).args(args))
    }

    /// Create a job that runs once `parent_id` succeeds.
    pub fn continue_job_with(
        &self,
        parent_id: &JobId,
        job_type: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<JobId> {
        self.continue_job_with_options(parent_id, job_type, args, ContinuationOptions::default())
    }

    pub fn continue_job_with_options(
        &self,
        parent_id: &JobId,
        job_type: impl Into<String>,
        args: serde_json::Value,
        options: ContinuationOptions,
    ) -> Result<JobId> {
        self.create(
            NewJob::new(job_type)
                .args(args)
                .continue_after_with(parent_id.clone(), options),
        )
    }

    /// Get a job by ID.
    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.storage.get_job(id)
    }

    /// Read a job parameter. A parameter that was never set, or was stored
    /// as `null`, reads as `None`.
    pub fn get_job_parameter<T: DeserializeOwned>(&self, id: &JobId, name: &str) -> Result<Option<T>> {
        let raw = self.storage.get_job_parameter(id, name)?;
        deserialize_parameter(raw.as_deref())
    }

    /// List jobs by state.
    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        self.storage.list_by_state(state)
    }

    /// Number of jobs ready to be claimed.
    pub fn queued_len(&self) -> Result<usize> {
        self.storage.queued_len()
    }

    /// Get events since a sequence number.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        self.storage.events_since(since_seq)
    }

    /// Claim the next queued job for a worker. Returns None if the queue is
    /// empty.
    pub fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        self.storage.atomically(|tx| {
            let Some(job) = tx.claim_next()? else {
                return Ok(None);
            };
            tx.record_event(EventKind::JobClaimed {
                id: job.id.clone(),
                worker_id: worker_id.to_string(),
            });
            Ok(Some(job))
        })
    }

    /// Mark a processing job as succeeded and release its continuations.
    pub fn complete(&self, id: &JobId, outcome: Outcome) -> Result<()> {
        let duration_ms = outcome.duration_ms;
        self.finish(id, JobState::Succeeded, Some(outcome), |id| {
            EventKind::JobSucceeded { id, duration_ms }
        })
    }

    /// Mark a processing job as failed. Only continuations that run on any
    /// outcome are released; the rest are deleted.
    pub fn fail(&self, id: &JobId, outcome: Outcome) -> Result<()> {
        let error = outcome.error.clone().unwrap_or_default();
        self.finish(id, JobState::Failed, Some(outcome), |id| EventKind::JobFailed {
            id,
            error,
        })
    }

    /// Delete a job that has not started yet.
    pub fn delete(&self, id: &JobId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.finish(id, JobState::Deleted, None, |id| EventKind::JobDeleted {
            id,
            reason,
        })
    }

    fn finish(
        &self,
        id: &JobId,
        to: JobState,
        outcome: Option<Outcome>,
        event: impl FnOnce(JobId) -> EventKind,
    ) -> Result<()> {
        let released = self.storage.atomically(|tx| {
            tx.update_state(id, to)?;
            if let Some(outcome) = outcome {
                tx.set_outcome(id, outcome)?;
            }
            tx.record_event(event(id.clone()));
            resolve_continuations(tx, id, to)
        })?;

        for _ in 0..released {
            self.work_ready.notify_one();
        }
        Ok(())
    }

    /// Resolves when a job may have become available.
    pub(crate) async fn work_ready(&self) {
        self.work_ready.notified().await
    }
}

/// Release or delete every continuation waiting on `parent_id`, which just
/// reached `parent_state`. Deleting a continuation cascades to its own
/// continuations. Returns the number released into the queue.
fn resolve_continuations(tx: &mut TxContext<'_>, parent_id: &JobId, parent_state: JobState) -> Result<usize> {
    let mut released = 0;
    let mut pending = vec![(parent_id.clone(), parent_state)];

    while let Some((parent_id, parent_state)) = pending.pop() {
        for child in tx.awaiting_children(&parent_id) {
            let options = tx.get_job(&child)?.continuation;
            if options.releases_on(parent_state) {
                tx.update_state(&child, JobState::Queued)?;
                tx.record_event(EventKind::ContinuationReleased {
                    parent_id: parent_id.clone(),
                    id: child.clone(),
                });
                metrics::continuations().add(1, &[KeyValue::new("result", "released")]);
                debug!(parent.id = %parent_id, job.id = %child, "continuation released");
                released += 1;
            } else {
                tx.update_state(&child, JobState::Deleted)?;
                tx.record_event(EventKind::JobDeleted {
                    id: child.clone(),
                    reason: format!("parent {parent_id} finished as {parent_state}"),
                });
                metrics::continuations().add(1, &[KeyValue::new("result", "deleted")]);
                pending.push((child, JobState::Deleted));
            }
        }
    }
    Ok(released)
}
