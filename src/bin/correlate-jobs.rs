//! correlate-jobs CLI: run a chain of jobs and show how their ids propagate.

use clap::{Parser, Subcommand};
use correlate_jobs::config::Config;
use correlate_jobs::correlation::CorrelationManager;
use correlate_jobs::error::JobError;
use correlate_jobs::filter::correlate::CORRELATION_ID_KEY;
use correlate_jobs::http::CorrelatedClient;
use correlate_jobs::model::{JobId, JobState};
use correlate_jobs::queue::JobQueue;
use correlate_jobs::server::{HandlerRegistry, JobServer, ServerConfig};
use correlate_jobs::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::json;

const STEP_JOB: &str = "step";

#[derive(Parser)]
#[command(name = "correlate-jobs", about = "Correlation ids for background jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job plus continuations and run them to completion
    Run {
        /// Correlation id to create the chain under. Without one, the first
        /// job correlates under its own id.
        #[arg(long)]
        correlation_id: Option<String>,
        /// Number of continuations chained after the first job
        #[arg(long, default_value_t = 2)]
        continuations: usize,
        /// URL each job calls with the correlation header attached
        #[arg(long)]
        url: Option<String>,
    },
    /// Run worker loops until Ctrl-C, with a single job enqueued at start
    Serve {
        /// Correlation id for the seed job
        #[arg(long)]
        correlation_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "correlate-jobs"))?;

    match cli.command {
        Command::Run {
            correlation_id,
            continuations,
            url,
        } => cmd_run(&config, correlation_id, continuations, url).await,
        Command::Serve { correlation_id } => cmd_serve(&config, correlation_id).await,
    }
}

fn handlers(config: &Config, url: Option<String>) -> HandlerRegistry {
    let client = CorrelatedClient::default().with_header(config.correlation_header.clone());
    let mut registry = HandlerRegistry::empty();
    registry.register_fn(STEP_JOB, move |ctx| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let observed = ctx.correlation_id();
            let mut status = None;
            if let Some(url) = url {
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| JobError::failed(format!("GET {url}: {e}")))?;
                status = Some(response.status().as_u16());
            }
            tracing::info!(
                job.id = %ctx.job_id,
                correlation.id = observed.as_deref().unwrap_or("-"),
                "step executed"
            );
            Ok::<_, JobError>(json!({
                "observed_correlation_id": observed,
                "http_status": status,
            }))
        }
    });
    registry
}

async fn enqueue_chain(queue: &JobQueue, continuations: usize) -> anyhow::Result<Vec<JobId>> {
    let mut ids = vec![queue.enqueue(STEP_JOB, json!({ "step": 0 }))?];
    for step in 1..=continuations {
        let parent = ids[step - 1].clone();
        ids.push(queue.continue_job_with(&parent, STEP_JOB, json!({ "step": step }))?);
    }
    Ok(ids)
}

async fn cmd_run(
    config: &Config,
    correlation_id: Option<String>,
    continuations: usize,
    url: Option<String>,
) -> anyhow::Result<()> {
    let queue = JobQueue::builder().use_default_correlate()?.build();

    let ids = match correlation_id {
        Some(id) => {
            CorrelationManager::new()
                .correlate(Some(id), enqueue_chain(&queue, continuations))
                .await?
        }
        None => enqueue_chain(&queue, continuations).await?,
    };

    let server = JobServer::new(
        queue.clone(),
        handlers(config, url),
        ServerConfig::from_config(config),
    );
    let processed = server.run_until_idle().await?;

    println!(
        "{:<36}  {:<10}  {:<36}  OBSERVED",
        "JOB", "STATE", "PERSISTED"
    );
    println!("{}", "-".repeat(120));
    for id in &ids {
        let job = queue.get(id)?;
        let persisted: Option<String> = queue.get_job_parameter(id, CORRELATION_ID_KEY)?;
        let observed = job
            .outcome
            .as_ref()
            .and_then(|outcome| outcome.data.as_ref())
            .and_then(|data| data.get("observed_correlation_id"))
            .and_then(|value| value.as_str())
            .unwrap_or("-")
            .to_string();
        println!(
            "{:<36}  {:<10}  {:<36}  {}",
            job.id,
            job.state,
            persisted.as_deref().unwrap_or("-"),
            observed
        );
    }
    println!("\n{processed} job(s) executed");
    Ok(())
}

async fn cmd_serve(config: &Config, correlation_id: Option<String>) -> anyhow::Result<()> {
    let queue = JobQueue::builder().use_default_correlate()?.build();
    let server = JobServer::new(
        queue.clone(),
        handlers(config, None),
        ServerConfig::from_config(config),
    );

    let seed = match correlation_id {
        Some(id) => {
            CorrelationManager::new()
                .correlate(Some(id), async { queue.enqueue(STEP_JOB, json!({ "step": 0 })) })
                .await?
        }
        None => queue.enqueue(STEP_JOB, json!({ "step": 0 }))?,
    };
    println!("Enqueued: {seed}");

    let srv = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        srv.shutdown();
    });

    server.run().await?;

    let succeeded = queue.list_by_state(JobState::Succeeded)?.len();
    println!("{succeeded} job(s) succeeded");
    Ok(())
}
