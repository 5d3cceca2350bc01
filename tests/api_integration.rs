//! Integration tests for the HTTP trigger surface.
//!
//! Each test spins up an Axum server on a random port over in-memory
//! collaborators and exercises the real JSON contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use support_pipeline::api::{AppState, api_routes};
use support_pipeline::pipeline::types::{Category, Priority};
use support_pipeline::pipeline::{DigestAggregator, Orchestrator};
use support_pipeline::testing::{
    MemoryLedger, MemoryStore, RecordingSink, ScriptedClassifier, StaticSource, email,
};

struct Harness {
    base: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    classifier: Arc<ScriptedClassifier>,
}

impl Harness {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

/// Start an Axum server on a random port over the given source.
async fn start_server(source: StaticSource) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    let classifier = Arc::new(ScriptedClassifier::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(source),
        Arc::new(MemoryLedger::new()),
        classifier.clone(),
        store.clone(),
    ));
    let digest = Arc::new(DigestAggregator::new(store.clone(), sink.clone()));
    let app = api_routes(AppState {
        orchestrator,
        digest,
        scheduler: None,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        store,
        sink,
        classifier,
    }
}

fn inbox() -> Vec<support_pipeline::pipeline::types::RawEmail> {
    vec![
        email("m1", "VPN down", "Cannot reach the office network"),
        email("m2", "Laptop won't boot", "Black screen since this morning"),
        email("m3", "Weird login prompt", "Asked for my password twice"),
    ]
}

#[tokio::test]
async fn health_reports_scheduler_state() {
    let h = start_server(StaticSource::new(vec![])).await;
    let (status, body) = h.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["scheduler_running"], false);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn status_before_any_run() {
    let h = start_server(StaticSource::new(vec![])).await;
    let (status, body) = h.get("/api/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "Never run");
    assert!(body["last_run"].is_null());
    assert_eq!(body["run_active"], false);
    assert_eq!(body["scheduler"]["running"], false);
}

#[tokio::test]
async fn unknown_path_is_json_404() {
    let h = start_server(StaticSource::new(vec![])).await;
    let (status, body) = h.get("/api/nope").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Endpoint not found");
}

#[tokio::test]
async fn out_of_range_hours_are_rejected() {
    let h = start_server(StaticSource::new(inbox())).await;
    for hours in [0, 169] {
        let (status, body) = h.post("/api/run-pipeline", json!({ "hours": hours })).await;
        assert_eq!(status, 400, "hours={hours}");
        assert_eq!(body["success"], false);
    }
    assert!(h.store.tickets().is_empty());
}

#[tokio::test]
async fn run_pipeline_returns_report_and_updates_status() {
    let h = start_server(StaticSource::new(inbox())).await;
    h.classifier
        .classify_as("VPN down", Category::Network, Priority::High);
    h.classifier.fail_transport("Weird login prompt");

    let (status, body) = h.post("/api/run-pipeline", json!({ "hours": 12 })).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["hours"], 12);
    let report = &body["report"];
    assert_eq!(report["fetched"], 3);
    assert_eq!(report["stored"], 2);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["failures"][0]["email_id"], "m3");
    assert_eq!(h.store.tickets().len(), 2);

    let (_, status_body) = h.get("/api/status").await;
    assert_eq!(status_body["status"], "Success");
    assert_eq!(status_body["last_run"]["stored"], 2);
}

#[tokio::test]
async fn concurrent_run_is_rejected_with_conflict() {
    let source = StaticSource::new(inbox()).with_delay(Duration::from_millis(400));
    let h = Arc::new(start_server(source).await);

    let first = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.post("/api/run-pipeline", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = h.post("/api/run-pipeline", json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["success"], false);

    let (status, body) = first.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["report"]["stored"], 3);
}

#[tokio::test]
async fn fetch_only_does_not_store() {
    let h = start_server(StaticSource::new(inbox())).await;
    let (status, body) = h.post("/api/fetch", json!({ "hours": 2 })).await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 3);
    assert_eq!(body["emails"].as_array().unwrap().len(), 3);
    assert_eq!(h.classifier.call_count(), 0);
    assert!(h.store.tickets().is_empty());
}

#[tokio::test]
async fn classify_endpoint_statuses() {
    let h = start_server(StaticSource::new(vec![])).await;
    h.classifier
        .classify_as("Printer jam", Category::Hardware, Priority::Low);
    h.classifier.fail_schema("gibberish");

    let (status, body) = h
        .post("/api/classify", json!({ "subject": "Printer jam", "body": "tray 2" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["classification"]["category"], "Hardware");
    assert_eq!(body["classification"]["priority"], "Low");

    let (status, _) = h.post("/api/classify", json!({ "subject": " ", "body": "" })).await;
    assert_eq!(status, 400);

    let (status, body) = h.post("/api/classify", json!({ "subject": "gibberish" })).await;
    assert_eq!(status, 422);
    assert_eq!(body["success"], false);
    assert!(h.store.tickets().is_empty());
}

#[tokio::test]
async fn send_digest_delivers_summary() {
    let h = start_server(StaticSource::new(inbox())).await;
    h.classifier
        .classify_as("VPN down", Category::Network, Priority::Critical);
    let (status, _) = h.post("/api/run-pipeline", json!({})).await;
    assert_eq!(status, 200);

    let (status, body) = h.post("/api/send-digest", json!({ "hours": 24 })).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["delivered"], true);
    assert_eq!(body["summary"]["total"], 3);
    assert_eq!(body["summary"]["urgent"][0]["title"], "VPN down");

    let delivered = h.sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("*Total Issues:* 3"));
}

#[tokio::test]
async fn failed_delivery_is_reported_not_raised() {
    let h = start_server(StaticSource::new(vec![])).await;
    h.sink.set_failing(true);
    let (status, body) = h.post("/api/send-digest", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], false);
    assert_eq!(body["delivered"], false);
    assert!(body["error"].is_string());
    assert_eq!(h.sink.attempts(), 1);
}
