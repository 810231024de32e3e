//! Job filters: interception points around job creation and execution.
//!
//! Client filters run while a job is being created, before it is stored.
//! Server filters bracket each execution attempt: `on_performing` runs
//! before the handler, `on_performed` after it on every path. Filters are
//! injected into a queue at construction time through [`JobFilters`].
//!
//! Hooks return nothing. A filter that cannot do its work logs and lets the
//! job proceed.

pub mod correlate;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{JobError, Result};
use crate::model::{InitialState, Job, JobId};
use crate::storage::Storage;

/// Hooks invoked on the client side, while a job is created.
pub trait ClientFilter: Send + Sync {
    /// Before the job is stored. Parameters set here are persisted with it.
    fn on_creating(&self, ctx: &mut CreatingContext<'_>);

    /// After the job is stored.
    fn on_created(&self, _ctx: &CreatedContext<'_>) {}
}

/// Hooks invoked on the server side, around each execution attempt.
pub trait ServerFilter: Send + Sync {
    fn on_performing(&self, ctx: &mut PerformingContext<'_>);

    fn on_performed(&self, ctx: &mut PerformedContext<'_>);
}

/// Filters installed into one queue. Run in registration order on the way
/// in and in reverse order on the way out.
#[derive(Clone, Default)]
pub struct JobFilters {
    client: Vec<Arc<dyn ClientFilter>>,
    server: Vec<Arc<dyn ServerFilter>>,
}

impl JobFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self, filter: Arc<dyn ClientFilter>) {
        self.client.push(filter);
    }

    pub fn add_server(&mut self, filter: Arc<dyn ServerFilter>) {
        self.server.push(filter);
    }

    pub fn client(&self) -> &[Arc<dyn ClientFilter>] {
        &self.client
    }

    pub fn server(&self) -> &[Arc<dyn ServerFilter>] {
        &self.server
    }

    pub fn is_empty(&self) -> bool {
        self.client.is_empty() && self.server.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Parameter encoding
// ---------------------------------------------------------------------------

/// Parameters are stored as JSON: a string is persisted quoted.
pub fn serialize_parameter<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a stored parameter. A missing parameter and a stored `null` both
/// read as `None`.
pub fn deserialize_parameter<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    match raw {
        Some(raw) => Ok(serde_json::from_str::<Option<T>>(raw)?),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Client-side contexts
// ---------------------------------------------------------------------------

/// The in-flight creation of one job.
pub struct CreatingContext<'a> {
    pub(crate) job: &'a mut Job,
    pub(crate) initial_state: &'a InitialState,
    pub(crate) storage: &'a Storage,
}

impl CreatingContext<'_> {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.job.args
    }

    pub fn initial_state(&self) -> &InitialState {
        self.initial_state
    }

    /// Parent job, when the job is created as a continuation.
    pub fn parent_id(&self) -> Option<&JobId> {
        self.initial_state.parent_id()
    }

    /// Write a parameter onto the job being created.
    pub fn set_job_parameter<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let raw = serialize_parameter(value)?;
        self.job.parameters.insert(name.to_string(), raw);
        Ok(())
    }

    /// A parameter already set on the job being created.
    pub fn job_parameter<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        deserialize_parameter(self.job.parameter(name))
    }

    /// Read a parameter from another, already stored job.
    pub fn get_job_parameter<T: DeserializeOwned>(&self, job_id: &JobId, name: &str) -> Result<Option<T>> {
        let raw = self.storage.get_job_parameter(job_id, name)?;
        deserialize_parameter(raw.as_deref())
    }
}

/// A job that was just stored.
pub struct CreatedContext<'a> {
    pub(crate) job: &'a Job,
}

impl CreatedContext<'_> {
    pub fn job(&self) -> &Job {
        self.job
    }
}

// ---------------------------------------------------------------------------
// Server-side contexts
// ---------------------------------------------------------------------------

/// Per-execution side table shared by `on_performing` and `on_performed`.
#[derive(Default)]
pub struct Items {
    entries: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl Items {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.entries.insert(key, Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|value| value.downcast_ref())
    }

    /// Take a value out. A value of another type stays in place.
    pub fn remove<T: Any>(&mut self, key: &'static str) -> Option<T> {
        let value = self.entries.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.entries.insert(key, other);
                None
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An execution attempt that is about to run the handler.
pub struct PerformingContext<'a> {
    pub(crate) job: &'a Job,
    pub(crate) items: &'a mut Items,
}

impl<'a> PerformingContext<'a> {
    pub fn new(job: &'a Job, items: &'a mut Items) -> Self {
        Self { job, items }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// A parameter persisted on the job being executed.
    pub fn get_job_parameter<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        deserialize_parameter(self.job.parameter(name))
    }

    pub fn items(&self) -> &Items {
        self.items
    }

    pub fn items_mut(&mut self) -> &mut Items {
        self.items
    }
}

/// An execution attempt whose handler has finished, one way or another.
pub struct PerformedContext<'a> {
    pub(crate) job: &'a Job,
    pub(crate) items: &'a mut Items,
    pub(crate) result: &'a std::result::Result<serde_json::Value, JobError>,
}

impl<'a> PerformedContext<'a> {
    pub fn new(
        job: &'a Job,
        items: &'a mut Items,
        result: &'a std::result::Result<serde_json::Value, JobError>,
    ) -> Self {
        Self { job, items, result }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// The handler's error, if it failed.
    pub fn error(&self) -> Option<&JobError> {
        self.result.as_ref().err()
    }

    pub fn items(&self) -> &Items {
        self.items
    }

    pub fn items_mut(&mut self) -> &mut Items {
        self.items
    }
}
