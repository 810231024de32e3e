//! # correlate-jobs
//!
//! Correlation id propagation for background jobs.
//!
//! Code that creates a job inside a correlation scope stamps the job with the
//! ambient id; when a worker later executes the job, that id becomes ambient
//! again for the handler and everything it calls. Continuations inherit their
//! parent's id, and jobs created with no id at all correlate under their own
//! job id.
//!
//! ```no_run
//! use correlate_jobs::correlation::CorrelationManager;
//! use correlate_jobs::queue::JobQueue;
//!
//! # async fn demo() -> correlate_jobs::error::Result<()> {
//! let queue = JobQueue::builder().use_default_correlate()?.build();
//! CorrelationManager::new()
//!     .correlate(Some("order-42".into()), async {
//!         queue.enqueue("send-receipt", serde_json::json!({ "order": 42 }))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod event;
pub mod filter;
pub mod http;
pub mod model;
pub mod queue;
pub mod server;
pub mod setup;
pub mod storage;
pub mod telemetry;
