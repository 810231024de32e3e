//! Ambient correlation context.
//!
//! The current correlation id lives in a tokio task-local frame, so it
//! follows one logical call chain across `.await` points and never leaks
//! between concurrently running tasks. A frame holds a stack of contexts:
//! [`CorrelationManager::correlate`] installs a frame with one context,
//! and activities push onto and truncate the frame they find themselves in.
//!
//! Spawned tasks start without a frame; use [`spawn_correlated`] to carry the
//! current id across `tokio::spawn`.

pub mod activity;

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

pub use activity::{Activity, ActivityFactory, CorrelationActivity};

tokio::task_local! {
    static AMBIENT: AmbientFrame;
}

/// The correlation state visible to code running inside a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
}

impl CorrelationContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }
}

#[derive(Default)]
struct AmbientFrame {
    stack: RefCell<Vec<CorrelationContext>>,
}

impl AmbientFrame {
    fn with_context(context: CorrelationContext) -> Self {
        Self {
            stack: RefCell::new(vec![context]),
        }
    }

    /// A new frame seeded with the caller's current context, if any.
    fn inherit() -> Self {
        match current_context() {
            Some(context) => Self::with_context(context),
            None => Self::default(),
        }
    }
}

/// The innermost context of the current task, if one is active.
pub fn current_context() -> Option<CorrelationContext> {
    AMBIENT
        .try_with(|frame| frame.stack.borrow().last().cloned())
        .ok()
        .flatten()
}

/// The current correlation id, if one is active.
pub fn current_correlation_id() -> Option<String> {
    current_context().map(|context| context.correlation_id)
}

/// Run `fut` inside a fresh, empty frame. Activities started within it are
/// visible to the rest of `fut` and discarded when it completes.
pub async fn frame<F: Future>(fut: F) -> F::Output {
    AMBIENT.scope(AmbientFrame::default(), fut).await
}

/// Bind the current correlation context to `fut`, wherever it ends up
/// being polled.
pub fn carry<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    AMBIENT.scope(AmbientFrame::inherit(), fut)
}

/// Spawn `fut` on the runtime, carrying the current correlation context.
pub fn spawn_correlated<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(carry(fut))
}

/// Push `context` onto the current frame. Returns the depth to truncate to
/// when the push is undone, or `None` when no frame is installed.
pub(crate) fn push(context: CorrelationContext) -> Option<usize> {
    AMBIENT
        .try_with(|frame| {
            let mut stack = frame.stack.borrow_mut();
            let depth = stack.len();
            stack.push(context);
            depth
        })
        .ok()
}

/// Drop everything above `depth` in the current frame. No-op without a frame.
pub(crate) fn truncate(depth: usize) {
    let _ = AMBIENT.try_with(|frame| frame.stack.borrow_mut().truncate(depth));
}

fn is_blank(id: &str) -> bool {
    id.trim().is_empty()
}

/// Returns the id if it carries anything besides whitespace.
pub(crate) fn non_blank(id: Option<String>) -> Option<String> {
    id.filter(|id| !is_blank(id))
}

// ---------------------------------------------------------------------------
// Accessor
// ---------------------------------------------------------------------------

/// Read access to the ambient correlation context.
pub trait CorrelationContextAccessor: Send + Sync {
    fn correlation_context(&self) -> Option<CorrelationContext>;
}

/// Reads the task-local frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientAccessor;

impl CorrelationContextAccessor for AmbientAccessor {
    fn correlation_context(&self) -> Option<CorrelationContext> {
        current_context()
    }
}

// ---------------------------------------------------------------------------
// Id generation
// ---------------------------------------------------------------------------

/// Generates ids for scopes opened without one.
pub trait CorrelationIdFactory: Send + Sync {
    fn create(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCorrelationIdFactory;

impl CorrelationIdFactory for UuidCorrelationIdFactory {
    fn create(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Opens correlation scopes and hands out activities.
#[derive(Clone)]
pub struct CorrelationManager {
    id_factory: Arc<dyn CorrelationIdFactory>,
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self::with_id_factory(Arc::new(UuidCorrelationIdFactory))
    }

    pub fn with_id_factory(id_factory: Arc<dyn CorrelationIdFactory>) -> Self {
        Self { id_factory }
    }

    /// Run `fut` with `correlation_id` as the ambient id. A missing or blank
    /// id is replaced by a generated one. The previous ambient state is
    /// restored when `fut` completes or is dropped.
    pub async fn correlate<F: Future>(&self, correlation_id: Option<String>, fut: F) -> F::Output {
        let context = self.context_for(correlation_id);
        debug!(correlation.id = %context.correlation_id, "correlation scope opened");
        AMBIENT.scope(AmbientFrame::with_context(context), fut).await
    }

    /// Synchronous variant of [`correlate`](Self::correlate).
    pub fn correlate_sync<R>(&self, correlation_id: Option<String>, f: impl FnOnce() -> R) -> R {
        let context = self.context_for(correlation_id);
        debug!(correlation.id = %context.correlation_id, "correlation scope opened");
        AMBIENT.sync_scope(AmbientFrame::with_context(context), f)
    }

    fn context_for(&self, correlation_id: Option<String>) -> CorrelationContext {
        let id = non_blank(correlation_id).unwrap_or_else(|| self.id_factory.create());
        CorrelationContext::new(id)
    }
}

impl ActivityFactory for CorrelationManager {
    fn create_activity(&self) -> Box<dyn Activity> {
        Box::new(CorrelationActivity::new())
    }
}
