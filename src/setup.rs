//! Composition entry point: install correlation into a queue.
//!
//! The client half (creation hook) needs read access to the ambient
//! context; the server half (execution hooks) needs an activity factory.
//! Both come from [`CorrelateServices`], and registration fails immediately
//! when either is missing rather than at the first job.

use std::sync::Arc;

use tracing::debug;

use crate::correlation::{
    ActivityFactory, AmbientAccessor, CorrelationContextAccessor, CorrelationManager,
};
use crate::error::{Error, Result};
use crate::filter::correlate::{CorrelateClientFilter, CorrelateServerFilter};
use crate::queue::JobQueueBuilder;

/// The collaborators correlation is built from, as registered by the host
/// application.
#[derive(Clone, Default)]
pub struct CorrelateServices {
    accessor: Option<Arc<dyn CorrelationContextAccessor>>,
    activity_factory: Option<Arc<dyn ActivityFactory>>,
}

impl CorrelateServices {
    /// No services registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The task-local accessor and a default [`CorrelationManager`].
    pub fn with_defaults() -> Self {
        Self::new()
            .accessor(Arc::new(AmbientAccessor))
            .activity_factory(Arc::new(CorrelationManager::new()))
    }

    pub fn accessor(mut self, accessor: Arc<dyn CorrelationContextAccessor>) -> Self {
        self.accessor = Some(accessor);
        self
    }

    pub fn activity_factory(mut self, factory: Arc<dyn ActivityFactory>) -> Self {
        self.activity_factory = Some(factory);
        self
    }

    fn resolve(&self) -> Result<(Arc<dyn CorrelationContextAccessor>, Arc<dyn ActivityFactory>)> {
        match (&self.accessor, &self.activity_factory) {
            (Some(accessor), Some(factory)) => Ok((Arc::clone(accessor), Arc::clone(factory))),
            (accessor, factory) => {
                let missing: Vec<&str> = [
                    accessor.is_none().then_some("CorrelationContextAccessor"),
                    factory.is_none().then_some("ActivityFactory"),
                ]
                .into_iter()
                .flatten()
                .collect();
                Err(Error::Config(format!(
                    "failed to register correlation with the job queue: missing {}. \
                     Register them on CorrelateServices or use CorrelateServices::with_defaults()",
                    missing.join(", ")
                )))
            }
        }
    }
}

impl JobQueueBuilder {
    /// Install correlation filters built from `services`.
    pub fn use_correlate(mut self, services: &CorrelateServices) -> Result<Self> {
        if self.correlate_installed {
            return Err(Error::Config(
                "correlation is already registered on this queue".to_string(),
            ));
        }
        let (accessor, factory) = services.resolve()?;

        self.filters
            .add_client(Arc::new(CorrelateClientFilter::new(accessor)));
        self.filters
            .add_server(Arc::new(CorrelateServerFilter::new(factory)));
        self.correlate_installed = true;
        debug!("correlation filters registered");
        Ok(self)
    }

    /// Install correlation with the default task-local collaborators.
    pub fn use_default_correlate(self) -> Result<Self> {
        self.use_correlate(&CorrelateServices::with_defaults())
    }
}
