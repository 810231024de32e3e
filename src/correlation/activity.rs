//! Activities: the execution-scoped half of correlation.
//!
//! An activity makes an id ambient for a bounded stretch of one task and
//! restores the previous state when stopped. Stopping is idempotent and
//! also happens on drop, so an activity cannot outlive its owner's scope
//! even when the owner panics or is cancelled.

use opentelemetry::KeyValue;
use tracing::{Span, debug};

use super::CorrelationContext;
use crate::telemetry::metrics;

/// A handle that brackets the time an id is ambient.
pub trait Activity: Send {
    /// Make `correlation_id` ambient. Returns the context now in effect, or
    /// `None` when the activity declines to open a scope.
    fn start(&mut self, correlation_id: &str) -> Option<CorrelationContext>;

    /// Restore the ambient state from before `start`. Safe to call when never
    /// started or already stopped.
    fn stop(&mut self);
}

/// Creates activities. Installed on the server side of the queue.
pub trait ActivityFactory: Send + Sync {
    fn create_activity(&self) -> Box<dyn Activity>;
}

/// Activity over the task-local frame.
///
/// Declines when the current task has no frame, and when already started.
#[derive(Debug, Default)]
pub struct CorrelationActivity {
    restore_depth: Option<usize>,
}

impl CorrelationActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.restore_depth.is_some()
    }
}

impl Activity for CorrelationActivity {
    fn start(&mut self, correlation_id: &str) -> Option<CorrelationContext> {
        if self.restore_depth.is_some() {
            metrics::activities().add(1, &[KeyValue::new("result", "declined")]);
            return None;
        }

        let context = CorrelationContext::new(correlation_id);
        let Some(depth) = super::push(context.clone()) else {
            debug!(correlation.id = correlation_id, "no ambient frame, activity declined");
            metrics::activities().add(1, &[KeyValue::new("result", "declined")]);
            return None;
        };
        self.restore_depth = Some(depth);

        // Job spans declare this field empty; other spans ignore the record.
        Span::current().record("correlation.id", correlation_id);
        metrics::activities().add(1, &[KeyValue::new("result", "started")]);
        Some(context)
    }

    fn stop(&mut self) {
        if let Some(depth) = self.restore_depth.take() {
            super::truncate(depth);
        }
    }
}

impl Drop for CorrelationActivity {
    fn drop(&mut self) {
        self.stop();
    }
}
