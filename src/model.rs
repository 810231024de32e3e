//! Core data model.
//!
//! A job is a unit of deferred work. It has an opaque identity, arguments for
//! its handler, a small set of named parameters that filters persist
//! alongside it, an optional parent (for continuations), and lifecycle state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, generated by the queue.
    pub id: JobId,

    /// What kind of job this is. Determines which handler runs it.
    pub job_type: String,

    /// Arguments for the handler. The queue doesn't interpret these.
    pub args: serde_json::Value,

    /// Named parameters written by client filters at creation time.
    /// Values are serialized JSON (a string parameter is stored quoted).
    pub parameters: BTreeMap<String, String>,

    /// Parent job, when this job is a continuation.
    pub parent_id: Option<JobId>,

    /// Which parent outcomes release this continuation.
    pub continuation: ContinuationOptions,

    /// Current lifecycle state.
    pub state: JobState,

    /// Number of execution attempts so far.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Result of the last execution, once finished.
    pub outcome: Option<Outcome>,
}

impl Job {
    /// Raw serialized value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Being created; filters are still running. Never persisted.
    Created,
    /// Continuation waiting for its parent to finish.
    Awaiting,
    /// Ready for execution, waiting for a worker.
    Queued,
    /// A worker is executing it.
    Processing,
    /// Done successfully. Terminal.
    Succeeded,
    /// Execution failed. Terminal (retries are not handled here).
    Failed,
    /// Removed before or instead of running. Terminal.
    Deleted,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Created, Queued)
                | (Created, Awaiting)
                | (Created, Deleted)    // parent already finished the wrong way
                | (Awaiting, Queued)    // parent finished, continuation released
                | (Awaiting, Deleted)
                | (Queued, Processing)
                | (Queued, Deleted)
                | (Processing, Succeeded)
                | (Processing, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Deleted
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Awaiting => "awaiting",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "awaiting" => Ok(JobState::Awaiting),
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "deleted" => Ok(JobState::Deleted),
            other => Err(crate::error::Error::invalid_argument(
                "state",
                format!("unknown job state '{other}'"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Continuations
// ---------------------------------------------------------------------------

/// Which parent outcomes release a continuation into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationOptions {
    /// Run only when the parent succeeded; otherwise the continuation is deleted.
    #[default]
    OnlyOnSucceeded,
    /// Run whenever the parent reaches any terminal state.
    OnAnyFinished,
}

impl ContinuationOptions {
    /// Does a parent that finished in `parent` release the continuation?
    pub fn releases_on(self, parent: JobState) -> bool {
        match self {
            ContinuationOptions::OnlyOnSucceeded => parent == JobState::Succeeded,
            ContinuationOptions::OnAnyFinished => parent.is_finished(),
        }
    }
}

/// The state a job is created in, as declared by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialState {
    /// Queue immediately.
    Enqueued,
    /// Wait for `parent_id` to finish.
    Awaiting {
        parent_id: JobId,
        options: ContinuationOptions,
    },
}

impl InitialState {
    pub fn parent_id(&self) -> Option<&JobId> {
        match self {
            InitialState::Enqueued => None,
            InitialState::Awaiting { parent_id, .. } => Some(parent_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of job execution, stored with the job when it finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Arbitrary result data. Opaque to the queue.
    pub data: Option<serde_json::Value>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Execution duration.
    pub duration_ms: u64,
}

impl Outcome {
    pub fn succeeded(data: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The queue's public API for creating work.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) args: serde_json::Value,
    pub(crate) initial_state: InitialState,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            args: serde_json::Value::Null,
            initial_state: InitialState::Enqueued,
        }
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Make this job a continuation of `parent_id`, released when the
    /// parent succeeds.
    pub fn continue_after(self, parent_id: JobId) -> Self {
        self.continue_after_with(parent_id, ContinuationOptions::default())
    }

    pub fn continue_after_with(mut self, parent_id: JobId, options: ContinuationOptions) -> Self {
        self.initial_state = InitialState::Awaiting { parent_id, options };
        self
    }

    pub fn initial_state(&self) -> &InitialState {
        &self.initial_state
    }
}
