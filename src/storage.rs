//! In-memory storage layer.
//!
//! Single source of truth for job records, the FIFO run queue, and the event
//! log. All writes go through the queue. One mutex guards everything, so a
//! closure passed to [`Storage::atomically`] observes and mutates a
//! consistent snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::telemetry::metrics;

/// Storage backend. Owns every job record.
#[derive(Default)]
pub struct Storage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
    events: Vec<Event>,
    next_seq: u64,
}

/// Handle for performing several storage operations under one lock.
pub(crate) struct TxContext<'a> {
    inner: &'a mut Inner,
}

impl TxContext<'_> {
    pub fn insert_job(&mut self, job: Job) -> Result<()> {
        if self.inner.jobs.contains_key(&job.id) {
            return Err(Error::Other(format!("job {} already exists", job.id)));
        }
        if job.state == JobState::Queued {
            self.inner.queue.push_back(job.id.clone());
        }
        self.inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Result<&Job> {
        self.inner
            .jobs
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Move a job to `to`, validating the transition. Returns the old state.
    pub fn update_state(&mut self, id: &JobId, to: JobState) -> Result<JobState> {
        let job = self
            .inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let now = Utc::now();
        job.state = to;
        job.updated_at = now;
        if to.is_finished() {
            job.finished_at = Some(now);
        }
        if to == JobState::Queued {
            self.inner.queue.push_back(id.clone());
        }

        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        record_event_on(
            self.inner,
            EventKind::StateTransition {
                id: id.clone(),
                from,
                to,
            },
        );
        Ok(from)
    }

    pub fn set_outcome(&mut self, id: &JobId, outcome: Outcome) -> Result<()> {
        let job = self
            .inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        job.outcome = Some(outcome);
        Ok(())
    }

    /// Pop the oldest queued job, mark it processing, and bump its attempts.
    pub fn claim_next(&mut self) -> Result<Option<Job>> {
        while let Some(id) = self.inner.queue.pop_front() {
            // Entries go stale when a queued job is deleted.
            let queued = self
                .inner
                .jobs
                .get(&id)
                .is_some_and(|job| job.state == JobState::Queued);
            if !queued {
                continue;
            }

            self.update_state(&id, JobState::Processing)?;
            let job = self
                .inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            job.attempts += 1;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    /// Continuations still waiting on `parent_id`, oldest first.
    pub fn awaiting_children(&self, parent_id: &JobId) -> Vec<JobId> {
        let mut children: Vec<&Job> = self
            .inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Awaiting && job.parent_id.as_ref() == Some(parent_id))
            .collect();
        children.sort_by_key(|job| job.created_at);
        children.into_iter().map(|job| job.id.clone()).collect()
    }

    pub fn record_event(&mut self, kind: EventKind) -> Event {
        record_event_on(self.inner, kind)
    }
}

fn record_event_on(inner: &mut Inner, kind: EventKind) -> Event {
    inner.next_seq += 1;
    let event = Event {
        seq: inner.next_seq,
        timestamp: Utc::now(),
        kind,
    };
    inner.events.push(event.clone());
    event
}

impl Storage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("storage lock poisoned".to_string()))
    }

    // -----------------------------------------------------------------------
    // Atomic sections
    // -----------------------------------------------------------------------

    /// Run a closure with exclusive access to the store.
    ///
    /// Closures validate before they mutate; an `Err` returned after a
    /// mutation leaves that mutation in place.
    pub(crate) fn atomically<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let mut guard = self.lock()?;
        let mut ctx = TxContext { inner: &mut guard };
        f(&mut ctx)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.lock()?
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Raw serialized value of a job parameter. `None` when the job never
    /// had the parameter set.
    pub fn get_job_parameter(&self, id: &JobId, name: &str) -> Result<Option<String>> {
        let inner = self.lock()?;
        let job = inner
            .jobs
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(job.parameters.get(name).cloned())
    }

    /// Jobs in a given state, oldest first.
    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    /// Number of jobs waiting to be claimed.
    pub fn queued_len(&self) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner
            .queue
            .iter()
            .filter(|id| {
                inner
                    .jobs
                    .get(*id)
                    .is_some_and(|job| job.state == JobState::Queued)
            })
            .count())
    }

    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| event.seq > since_seq)
            .cloned()
            .collect())
    }
}
