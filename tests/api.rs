//! API endpoint integration tests

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use audiosmith::DbPool;
use audiosmith::api::{ApiState, CHAT_PROMPT, VOICE_PROMPT, router};
use audiosmith::llm::ChatModel;

mod common;
use common::{EchoModel, setup_test_db};

const TOKEN: &str = "test-token";

/// Router with one token (for alice) and an optional model
fn build_test_router(db: DbPool, llm: Option<Arc<dyn ChatModel>>) -> axum::Router {
    let mut state = ApiState::new(db);
    state.tokens = HashMap::from([(TOKEN.to_string(), "alice".to_string())]);
    state.llm = llm;
    router(Arc::new(state))
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn send_json(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn transcript() -> Value {
    json!([
        {"role": "user", "content": "Hello", "timestamp": "2026-01-01T00:00:00Z"},
        {"role": "assistant", "content": "Hi there", "timestamp": "2026-01-01T00:00:01Z"}
    ])
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(setup_test_db(), None);

    let (status, json) = send_json(&app, get("/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_chats_require_bearer() {
    let app = build_test_router(setup_test_db(), None);

    let (status, json) = send_json(&app, get("/chats/history", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["success"], false);

    let (status, _) = send_json(&app, get("/chats/history", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_save_then_load_chat() {
    let app = build_test_router(setup_test_db(), None);

    let body = json!({"chatId": "c1", "title": "Greeting", "conversation": transcript()});
    let (status, json) = send_json(&app, post("/chats/save", Some(TOKEN), &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "Chat saved successfully");
    assert_eq!(json["chat"]["chatId"], "c1");

    let (status, json) = send_json(&app, get("/chats/c1", Some(TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["chat"]["title"], "Greeting");
    assert_eq!(json["chat"]["conversation"][1]["content"], "Hi there");
    assert!(json["chat"]["lastUpdated"].is_string());
}

#[tokio::test]
async fn test_save_twice_keeps_one_chat() {
    let app = build_test_router(setup_test_db(), None);

    let first = json!({"chatId": "c1", "conversation": []});
    send_json(&app, post("/chats/save", Some(TOKEN), &first)).await;
    let second = json!({"chatId": "c1", "title": "Renamed", "conversation": transcript()});
    send_json(&app, post("/chats/save", Some(TOKEN), &second)).await;

    let (status, json) = send_json(&app, get("/chats/history", Some(TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    let chats = json["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["title"], "Renamed");
    assert_eq!(chats[0]["conversation"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_save_stamps_missing_timestamps() {
    let app = build_test_router(setup_test_db(), None);

    let body = json!({
        "chatId": "c1",
        "conversation": [{"role": "user", "content": "Hello"}]
    });
    let (status, json) = send_json(&app, post("/chats/save", Some(TOKEN), &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, json) = send_json(&app, get("/chats/c1", Some(TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    let message = &json["chat"]["conversation"][0];
    assert_eq!(message["content"], "Hello");
    assert!(message["timestamp"].is_string());
}

#[tokio::test]
async fn test_malformed_body_gets_failure_envelope() {
    let app = build_test_router(setup_test_db(), Some(EchoModel::new("unused")));

    let request = Request::builder()
        .method("POST")
        .uri("/chats/save")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert!(json["message"].is_string());

    let wrong_shape = json!({"chatId": "c1", "conversation": [{"role": "user"}]});
    let (status, json) = send_json(&app, post("/chats/save", Some(TOKEN), &wrong_shape)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    let (status, json) = send_json(&app, post("/chat", None, &json!({"message": 42}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_missing_title_defaults() {
    let app = build_test_router(setup_test_db(), None);

    let body = json!({"chatId": "c1", "conversation": transcript()});
    let (_, json) = send_json(&app, post("/chats/save", Some(TOKEN), &body)).await;

    assert_eq!(json["chat"]["title"], "New Chat");
}

#[tokio::test]
async fn test_unknown_chat_is_404() {
    let app = build_test_router(setup_test_db(), None);

    let (status, json) = send_json(&app, get("/chats/nope", Some(TOKEN))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "Chat not found");
}

#[tokio::test]
async fn test_save_requires_chat_id_and_conversation() {
    let app = build_test_router(setup_test_db(), None);

    for body in [
        json!({"conversation": transcript()}),
        json!({"chatId": "", "conversation": transcript()}),
        json!({"chatId": "c1"}),
    ] {
        let (status, json) = send_json(&app, post("/chats/save", Some(TOKEN), &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "ChatId and conversation are required");
    }
}

#[tokio::test]
async fn test_system_messages_rejected() {
    let app = build_test_router(setup_test_db(), None);

    let body = json!({
        "chatId": "c1",
        "conversation": [
            {"role": "system", "content": "Error: boom", "timestamp": "2026-01-01T00:00:00Z"}
        ]
    });
    let (status, json) = send_json(&app, post("/chats/save", Some(TOKEN), &body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_chats_are_scoped_per_user() {
    let db = setup_test_db();
    let mut state = ApiState::new(db);
    state.tokens = HashMap::from([
        ("t-alice".to_string(), "alice".to_string()),
        ("t-bob".to_string(), "bob".to_string()),
    ]);
    let app = router(Arc::new(state));

    let body = json!({"chatId": "shared", "title": "Alice's", "conversation": transcript()});
    send_json(&app, post("/chats/save", Some("t-alice"), &body)).await;

    let (status, _) = send_json(&app, get("/chats/shared", Some("t-bob"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, json) = send_json(&app, get("/chats/history", Some("t-bob"))).await;
    assert!(json["chats"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_development_mode_uses_bearer_as_user() {
    let app = router(Arc::new(ApiState::new(setup_test_db())));

    let body = json!({"chatId": "c1", "conversation": transcript()});
    let (_, json) = send_json(&app, post("/chats/save", Some("carol"), &body)).await;

    assert_eq!(json["chat"]["userId"], "carol");
}

#[tokio::test]
async fn test_chat_requires_message() {
    let app = build_test_router(setup_test_db(), Some(EchoModel::new("unused")));

    let (status, json) = send_json(&app, post("/chat", None, &json!({"message": ""}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "No message provided");
}

#[tokio::test]
async fn test_chat_without_model_is_unavailable() {
    let app = build_test_router(setup_test_db(), None);

    let (status, json) = send_json(&app, post("/chat", None, &json!({"message": "Hi"}))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_chat_plain_reply() {
    let model = EchoModel::new("Hi there");
    let app = build_test_router(setup_test_db(), Some(model.clone()));

    let (status, json) = send_json(&app, post("/chat", None, &json!({"message": "Hello"}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["response"], "Hi there");

    let prompt = model.last_prompt().unwrap();
    assert_eq!(prompt.system, CHAT_PROMPT);
    assert_eq!(prompt.message, "Hello");
}

#[tokio::test]
async fn test_chat_streamed_reply() {
    let app = build_test_router(setup_test_db(), Some(EchoModel::new("Hi there")));

    let body = json!({"message": "Hello", "stream": true});
    let (status, bytes) = send(&app, post("/chat", None, &body)).await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec![r#"data: "Hi ""#, r#"data: "there""#, "data: [DONE]"]);
}

#[tokio::test]
async fn test_voice_chat_reports_language() {
    let model = EchoModel::new("Hola");
    let app = build_test_router(setup_test_db(), Some(model.clone()));

    let body = json!({"message": "Hola", "language": "es"});
    let (status, json) = send_json(&app, post("/voice-chat", None, &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["response"], "Hola");
    assert_eq!(json["language"], "es");
    assert_eq!(model.last_prompt().unwrap().system, VOICE_PROMPT);

    let (_, json) = send_json(&app, post("/voice-chat", None, &json!({"message": "Hi"}))).await;
    assert_eq!(json["language"], "en");
}
