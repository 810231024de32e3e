//! Job server: worker loops that claim jobs, execute them, and retire them.

pub mod execution;
pub mod handler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::Outcome;
use crate::queue::JobQueue;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

pub use execution::{ExecutionResult, execute};
pub use handler::{HandlerRegistry, JobContext, JobHandler};

/// Configuration for the job server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Prefix for worker ids in events and logs.
    pub name: String,
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// How long an idle worker sleeps when no wake-up arrives.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "correlate".to_string(),
            workers: 4,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            poll_interval: config.poll_interval,
            ..Self::default()
        }
    }
}

/// Runs jobs from one queue.
#[derive(Clone)]
pub struct JobServer {
    queue: JobQueue,
    handlers: Arc<HandlerRegistry>,
    config: ServerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    active_jobs: Arc<AtomicUsize>,
}

impl JobServer {
    pub fn new(queue: JobQueue, handlers: HandlerRegistry, config: ServerConfig) -> Self {
        Self {
            queue,
            handlers: Arc::new(handlers),
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Number of jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Signal the worker loops to stop after their current job.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Run the worker loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            server = %self.config.name,
            workers = self.config.workers,
            "job server started"
        );

        let mut workers = JoinSet::new();
        for n in 0..self.config.workers.max(1) {
            let server = self.clone();
            let worker_id = format!("{}:{n}", self.config.name);
            workers.spawn(async move { server.worker_loop(worker_id).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker loop ended abnormally: {e}");
            }
        }

        info!(server = %self.config.name, "job server stopped");
        Ok(())
    }

    /// Execute queued jobs on the current task until none are left,
    /// including continuations released along the way. Returns how many ran.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let worker_id = format!("{}:inline", self.config.name);
        let mut processed = 0;
        while self.process_next(&worker_id).await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn worker_loop(&self, worker_id: String) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            match self.process_next(&worker_id).await {
                // More work may be waiting; skip the wait.
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker = %worker_id, "process_next error: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = self.queue.work_ready() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim and execute one job. Returns false when the queue was empty.
    async fn process_next(&self, worker_id: &str) -> Result<bool> {
        let Some(job) = self.queue.claim(worker_id)? else {
            return Ok(false);
        };

        let job_span = start_job_span(&job.job_type, &job.id, job.attempts);

        async {
            record_state_transition(&job_span, "queued", "processing");
            let handler = self.handlers.get(&job.job_type);
            if handler.is_none() {
                warn!(job_type = %job.job_type, "no handler for job type");
            }

            self.active_jobs.fetch_add(1, Ordering::Relaxed);
            let result = execute(&job, self.queue.filters().server(), handler).await;
            self.active_jobs.fetch_sub(1, Ordering::Relaxed);

            match result {
                ExecutionResult::Succeeded { data, duration_ms } => {
                    record_state_transition(&job_span, "processing", "succeeded");
                    info!(job.id = %job.id, duration_ms, "job succeeded");
                    record_duration(&job.job_type, "succeeded", duration_ms);
                    self.queue
                        .complete(&job.id, Outcome::succeeded(data, duration_ms))?;
                }
                ExecutionResult::Failed { error, duration_ms } => {
                    record_state_transition(&job_span, "processing", "failed");
                    error!(job.id = %job.id, %error, duration_ms, "job failed");
                    record_duration(&job.job_type, "failed", duration_ms);
                    self.queue
                        .fail(&job.id, Outcome::failed(error.to_string(), duration_ms))?;
                }
            }
            Ok(true)
        }
        .instrument(job_span.clone())
        .await
    }
}

fn record_duration(job_type: &str, result: &'static str, duration_ms: u64) {
    metrics::job_duration_ms().record(
        duration_ms as f64,
        &[
            KeyValue::new("job_type", job_type.to_string()),
            KeyValue::new("result", result),
        ],
    );
}
