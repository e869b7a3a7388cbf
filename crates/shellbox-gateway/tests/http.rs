#![cfg(unix)]

use serde_json::{Value, json};
use shellbox_core::{ExecutionService, Platform, SandboxSettings};
use shellbox_gateway::GatewayServer;
use shellbox_history::HistoryDb;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct TestGateway {
    base: String,
    history: HistoryDb,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start() -> TestGateway {
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryDb::new(dir.path().join("history.db")).unwrap();
    let service = ExecutionService::new(Arc::new(SandboxSettings::default()), Platform::current());
    let server = GatewayServer::new(Arc::new(service), Some(history.clone()));
    let shutdown = server.shutdown_token();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(server.serve(listener));

    TestGateway {
        base,
        history,
        shutdown,
        _dir: dir,
    }
}

#[tokio::test]
async fn health() {
    let gw = start().await;
    let resp = reqwest::get(format!("{}/health", gw.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn execute_echo_and_record_history() {
    let gw = start().await;
    let dir = tempfile::tempdir().unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{}/execute", gw.base))
        .json(&json!({
            "command": "echo hello",
            "description": "greet",
            "directory": dir.path(),
            "sessionId": "s-1",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"], "hello\n");
    assert!(body["displayText"].as_str().unwrap().contains("hello"));

    let entries = gw.history.list_session("s-1", None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].request["command"], "echo hello");
    assert_eq!(entries[0].response["content"], "hello\n");
}

#[tokio::test]
async fn failing_command_is_still_200() {
    let gw = start().await;
    let dir = tempfile::tempdir().unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{}/execute", gw.base))
        .json(&json!({"command": "exit 9", "directory": dir.path()}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["content"].as_str().unwrap().contains("Exit Code: 9"));
}

#[tokio::test]
async fn invalid_profile_is_400() {
    let gw = start().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/execute", gw.base))
        .json(&json!({
            "command": "ls",
            "config": {"sandbox": "os-profile", "profile": "not-a-real-profile"},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_profile");
    assert!(gw.history.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_directory_is_400() {
    let gw = start().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/execute", gw.base))
        .json(&json!({"command": "ls", "directory": "/definitely/not/here"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_work_dir");
}

#[tokio::test]
async fn malformed_body_is_400() {
    let gw = start().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/execute", gw.base))
        .header("content-type", "application/json")
        .body(r#"{"description": "no command"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_request");
}
