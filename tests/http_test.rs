//! Outbound requests carry the ambient correlation id as a header.

use std::time::Duration;

use correlate_jobs::correlation::CorrelationManager;
use correlate_jobs::error::JobError;
use correlate_jobs::http::CorrelatedClient;
use correlate_jobs::model::JobId;
use correlate_jobs::queue::JobQueue;
use correlate_jobs::server::{HandlerRegistry, JobServer, ServerConfig};
use reqwest::header::HeaderName;
use serde_json::json;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Responds 200 only when the correlation header equals `expected`.
async fn expect_header(server: &MockServer, name: &'static str, expected: &'static str) {
    Mock::given(method("GET"))
        .and(path("/downstream"))
        .and(header(name, expected))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Responds 409 whenever any correlation header is present.
async fn reject_header(server: &MockServer, name: &'static str) {
    Mock::given(method("GET"))
        .and(path("/downstream"))
        .and(header_exists(name))
        .respond_with(ResponseTemplate::new(409))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/downstream"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn calling_handlers(url: String) -> HandlerRegistry {
    let client = CorrelatedClient::default();
    let mut registry = HandlerRegistry::empty();
    registry.register_fn("call", move |_ctx| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| JobError::failed(e.to_string()))?;
            Ok::<_, JobError>(json!({ "status": response.status().as_u16() }))
        }
    });
    registry
}

async fn run_call(queue: &JobQueue, url: String) {
    JobServer::new(
        queue.clone(),
        calling_handlers(url),
        ServerConfig {
            poll_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        },
    )
    .run_until_idle()
    .await
    .unwrap();
}

fn status(queue: &JobQueue, id: &JobId) -> u64 {
    let data = queue.get(id).unwrap().outcome.unwrap().data.unwrap();
    data["status"].as_u64().unwrap()
}

#[tokio::test]
async fn request_inside_scope_carries_the_header() {
    let server = MockServer::start().await;
    expect_header(&server, "correlationid", "my-id").await;

    let client = CorrelatedClient::default();
    let response = CorrelationManager::new()
        .correlate(Some("my-id".into()), async {
            client.get(&format!("{}/downstream", server.uri())).send().await
        })
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn request_outside_scope_has_no_header() {
    let server = MockServer::start().await;
    reject_header(&server, "correlationid").await;

    let response = CorrelatedClient::default()
        .get(&format!("{}/downstream", server.uri()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn header_name_is_configurable() {
    let server = MockServer::start().await;
    expect_header(&server, "x-request-id", "custom").await;

    let client = CorrelatedClient::default().with_header(HeaderName::from_static("x-request-id"));
    assert_eq!(client.header_name().as_str(), "x-request-id");

    let response = CorrelationManager::new()
        .correlate(Some("custom".into()), async {
            client.get(&format!("{}/downstream", server.uri())).send().await
        })
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn job_created_in_scope_calls_downstream_with_its_id() {
    let server = MockServer::start().await;
    expect_header(&server, "correlationid", "my-id").await;

    let queue = JobQueue::builder().use_default_correlate().unwrap().build();
    let id = CorrelationManager::new()
        .correlate(Some("my-id".into()), async { queue.enqueue("call", json!({})) })
        .await
        .unwrap();

    run_call(&queue, format!("{}/downstream", server.uri())).await;
    assert_eq!(status(&queue, &id), 200);
}

#[tokio::test]
async fn uncorrelated_job_calls_downstream_with_its_job_id() {
    let server = MockServer::start().await;
    let queue = JobQueue::builder().use_default_correlate().unwrap().build();
    let id = queue.enqueue("call", json!({})).unwrap();
    let expected: &'static str = Box::leak(id.to_string().into_boxed_str());
    expect_header(&server, "correlationid", expected).await;

    run_call(&queue, format!("{}/downstream", server.uri())).await;
    assert_eq!(status(&queue, &id), 200);
}
