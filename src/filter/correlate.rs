//! Correlation id propagation across the create/execute boundary.
//!
//! At creation the client filter decides the id a job carries and persists
//! it under [`CORRELATION_ID_KEY`]: the ambient id wins, then the id a
//! continuation inherits from its parent, else nothing. At execution the
//! server filter makes the persisted id (or the job's own id) ambient for
//! the duration of the attempt.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ClientFilter, CreatingContext, PerformedContext, PerformingContext, ServerFilter};
use crate::correlation::{Activity, ActivityFactory, CorrelationContextAccessor, non_blank};
use crate::model::JobId;

/// Job parameter holding the correlation id resolved at creation.
pub const CORRELATION_ID_KEY: &str = "CorrelationId";

/// Side-table key for the running activity.
pub const ACTIVITY_ITEM_KEY: &str = "Correlate-Activity";

/// Where a creation-time correlation id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationSource {
    /// The creating code was running inside a correlation scope.
    Ambient,
    /// Inherited from the parent of a continuation.
    Parent,
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Persists the correlation id on jobs as they are created.
pub struct CorrelateClientFilter {
    accessor: Arc<dyn CorrelationContextAccessor>,
}

impl CorrelateClientFilter {
    pub fn new(accessor: Arc<dyn CorrelationContextAccessor>) -> Self {
        Self { accessor }
    }

    /// The id a job being created should carry, first match wins.
    pub fn resolve(&self, ctx: &CreatingContext<'_>) -> Option<(String, CorrelationSource)> {
        let ambient = self
            .accessor
            .correlation_context()
            .and_then(|context| non_blank(Some(context.correlation_id)));
        if let Some(id) = ambient {
            return Some((id, CorrelationSource::Ambient));
        }

        ctx.parent_id()
            .map(|parent_id| (resolve_continuation(ctx, parent_id), CorrelationSource::Parent))
    }
}

impl ClientFilter for CorrelateClientFilter {
    fn on_creating(&self, ctx: &mut CreatingContext<'_>) {
        let Some((correlation_id, source)) = self.resolve(ctx) else {
            debug!(
                job_type = ctx.job_type(),
                "no correlation id at creation, job will correlate under its own id"
            );
            return;
        };

        match ctx.set_job_parameter(CORRELATION_ID_KEY, &correlation_id) {
            Ok(()) => debug!(
                job_type = ctx.job_type(),
                correlation.id = %correlation_id,
                ?source,
                "correlation id assigned"
            ),
            Err(e) => warn!(
                job_type = ctx.job_type(),
                correlation.id = %correlation_id,
                error = %e,
                "failed to store correlation id"
            ),
        }
    }
}

/// The correlation id a continuation of `parent_id` inherits.
///
/// The parent's stored id if it has one, else the parent's own id. Only one
/// hop is read: every job in a chain persisted its resolved id when it was
/// created, so the parent's value already reflects its own ancestors.
pub fn resolve_continuation(ctx: &CreatingContext<'_>, parent_id: &JobId) -> String {
    match ctx.get_job_parameter::<String>(parent_id, CORRELATION_ID_KEY) {
        Ok(stored) => non_blank(stored).unwrap_or_else(|| parent_id.to_string()),
        Err(e) => {
            warn!(
                parent.id = %parent_id,
                error = %e,
                "unreadable parent correlation id, using parent id"
            );
            parent_id.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Makes the job's correlation id ambient while its handler runs.
pub struct CorrelateServerFilter {
    activity_factory: Arc<dyn ActivityFactory>,
}

impl CorrelateServerFilter {
    pub fn new(activity_factory: Arc<dyn ActivityFactory>) -> Self {
        Self { activity_factory }
    }
}

impl ServerFilter for CorrelateServerFilter {
    fn on_performing(&self, ctx: &mut PerformingContext<'_>) {
        let stored = ctx
            .get_job_parameter::<String>(CORRELATION_ID_KEY)
            .unwrap_or_else(|e| {
                warn!(job.id = %ctx.job_id(), error = %e, "unreadable correlation id, using job id");
                None
            });
        let correlation_id = non_blank(stored).unwrap_or_else(|| ctx.job_id().to_string());

        let mut activity = self.activity_factory.create_activity();
        match activity.start(&correlation_id) {
            Some(context) => {
                let items = ctx.items_mut();
                items.insert(CORRELATION_ID_KEY, context.correlation_id);
                items.insert(ACTIVITY_ITEM_KEY, activity);
            }
            None => debug!(
                job.id = %ctx.job_id(),
                correlation.id = %correlation_id,
                "correlation scope declined, executing uncorrelated"
            ),
        }
    }

    fn on_performed(&self, ctx: &mut PerformedContext<'_>) {
        if let Some(mut activity) = ctx.items_mut().remove::<Box<dyn Activity>>(ACTIVITY_ITEM_KEY) {
            activity.stop();
        }
    }
}
