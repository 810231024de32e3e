//! Structured events emitted by the queue on every state change.
//!
//! Consumers read the event stream to build dashboards or audit logs.
//! `JobCreated` carries the correlation id persisted at creation, so a
//! whole operation can be reassembled from events alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, JobState};

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobCreated {
        id: JobId,
        job_type: String,
        parent_id: Option<JobId>,
        correlation_id: Option<String>,
    },
    JobAwaiting {
        id: JobId,
        parent_id: JobId,
    },
    JobQueued {
        id: JobId,
    },
    JobClaimed {
        id: JobId,
        worker_id: String,
    },
    JobSucceeded {
        id: JobId,
        duration_ms: u64,
    },
    JobFailed {
        id: JobId,
        error: String,
    },
    JobDeleted {
        id: JobId,
        reason: String,
    },
    ContinuationReleased {
        parent_id: JobId,
        id: JobId,
    },
    StateTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}
