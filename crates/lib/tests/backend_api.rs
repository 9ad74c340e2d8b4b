//! Integration tests: run a small mock Open-WebUI backend on a free port and
//! drive the client against it over real HTTP. Covers pagination + merge,
//! both list envelope shapes, snapshot parsing, task stop, and redirect
//! classification.

use axum::extract::{Path, Query};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;

use lib::api::{ApiError, OpenWebUiClient, SendTurn};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn chats_page(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
    let page = params
        .get("page")
        .and_then(|p| p.parse::<u32>().ok())
        .unwrap_or(0);
    // Page 1 is a bare array, page 2 a {data: [...]} wrapper, page 3 empty:
    // both envelope shapes and the termination condition in one route.
    let body = match page {
        1 => json!([
            {"id": "a", "title": "Alpha", "updated_at": 1_700_000_000},
            {"id": "b", "title": "Beta", "updated_at": "1700000001"},
        ]),
        2 => json!({"data": [
            {"id": "c", "title": "Gamma", "updated_at": 1_700_000_002_000i64},
        ]}),
        _ => json!([]),
    };
    Json(body)
}

async fn pinned() -> Json<serde_json::Value> {
    // Duplicates id "a" from page 1; the pinned entry must win the merge.
    Json(json!([{"id": "a", "title": "Alpha (pinned)", "pinned": true}]))
}

async fn archived() -> Json<serde_json::Value> {
    Json(json!({"data": []}))
}

async fn chat_snapshot(Path(id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({
        "id": id,
        "title": "Weather",
        "created_at": 1_700_000_000,
        "chat": {
            "history": {
                "currentId": "m2",
                "messages": {
                    "m1": {"id": "m1", "role": "user", "content": "hi"},
                    "m2": {"id": "m2", "role": "assistant", "content": "Hello", "done": false, "parentId": "m1"},
                }
            },
            "messages": []
        }
    }))
}

async fn completions(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    assert_eq!(body.get("stream"), Some(&json!(true)));
    assert!(body.get("id").is_some(), "response message id attached");
    Json(json!({"task_id": "task-1"}))
}

async fn stop_task(Path(task_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({"stopped": task_id}))
}

async fn chat_tasks(Path(_chat_id): Path<String>) -> Json<serde_json::Value> {
    Json(json!({"task_ids": ["task-1", "task-2"]}))
}

async fn redirecting() -> impl IntoResponse {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, "https://correct.example.com/api")],
    )
}

async fn start_mock_backend() -> String {
    let router = Router::new()
        .route("/api/v1/chats/", get(chats_page))
        .route("/api/v1/chats/pinned", get(pinned))
        .route("/api/v1/chats/all/archived", get(archived))
        .route("/api/v1/chats/redirect-me", get(redirecting))
        .route("/api/v1/chats/:id", get(chat_snapshot))
        .route("/api/chat/completions", post(completions))
        .route("/api/tasks/stop/:id", post(stop_task))
        .route("/api/tasks/chat/:id", get(chat_tasks));

    let port = free_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind mock backend");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn list_paginates_and_merges_with_precedence() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);

    let list = client.fetch_conversation_list(None).await.expect("list");
    let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), 3, "a, b, c exactly once");
    assert!(ids.contains(&"a") && ids.contains(&"b") && ids.contains(&"c"));

    let a = list.iter().find(|s| s.id == "a").unwrap();
    assert!(a.pinned, "pinned entry takes precedence over the page entry");
    assert_eq!(a.title, "Alpha (pinned)");

    // Millisecond timestamp normalized to seconds.
    let c = list.iter().find(|s| s.id == "c").unwrap();
    assert_eq!(c.updated_at, Some(1_700_000_002));
}

#[tokio::test]
async fn list_limit_truncates() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);
    let list = client.fetch_conversation_list(Some(2)).await.expect("list");
    assert_eq!(list.len(), 2);
}

#[tokio::test]
async fn snapshot_parses_history_chain() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);

    let conversation = client.fetch_conversation("c1").await.expect("snapshot");
    assert_eq!(conversation.id, "c1");
    assert_eq!(conversation.title, "Weather");
    assert_eq!(conversation.messages.len(), 2);
    let reply = &conversation.messages[1];
    assert_eq!(reply.id, "m2");
    assert_eq!(reply.content, "Hello");
    assert!(reply.streaming, "done: false means still streaming");
}

#[tokio::test]
async fn send_turn_returns_task_handle() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);

    let handle = client
        .send_turn(SendTurn {
            model: "llama3.2:latest".to_string(),
            messages: vec![lib::api::Message::user("hello")],
            ..Default::default()
        })
        .await
        .expect("send turn");
    assert_eq!(handle.task_id.as_deref(), Some("task-1"));
    assert!(!handle.message_id.is_empty());
    assert!(!handle.session_id.is_empty());
}

#[tokio::test]
async fn stop_and_task_listing_round_trip() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);

    let tasks = client.list_chat_tasks("c1").await.expect("tasks");
    assert_eq!(tasks, vec!["task-1".to_string(), "task-2".to_string()]);
    client.stop_task("task-1").await.expect("stop");
}

#[tokio::test]
async fn redirects_surface_the_location() {
    let base = start_mock_backend().await;
    let client = OpenWebUiClient::new(&base, None);

    let err = client.fetch_conversation("redirect-me").await.unwrap_err();
    match err {
        ApiError::Redirect { status, location } => {
            assert_eq!(status, 307);
            assert_eq!(location, "https://correct.example.com/api");
        }
        other => panic!("expected redirect classification, got: {:?}", other),
    }
}
