//! Fixtures for handler tests: a wiremock server plays the Bot API.

use serde_json::{json, Value};
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use wiremock::matchers::{body_partial_json, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::Config;

pub const ADMIN: i64 = 42;

pub fn bot(server: &MockServer) -> Bot {
    Bot::new("123456:TEST").set_api_url(server.uri().parse().unwrap())
}

pub fn config(store_path: &std::path::Path) -> Config {
    let store_path = store_path.display().to_string();
    Config::from_lookup(|key| {
        match key {
            "BOT_TOKEN" => Some("123456:TEST"),
            "ADMIN_ID" => Some("42"),
            "BOT_USERNAME" => Some("vault_bot"),
            "STORE_PATH" => Some(store_path.as_str()),
            "USER_COOLDOWN_SECONDS" => Some("5"),
            _ => None,
        }
        .map(str::to_string)
    })
    .unwrap()
}

fn method_path(name: &str) -> String {
    format!("(?i)^/bot[^/]+/{name}$")
}

pub async fn mock_ok(server: &MockServer, api_method: &str, result: Value) {
    Mock::given(method("POST"))
        .and(path_regex(method_path(api_method)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": result })))
        .mount(server)
        .await;
}

fn error_body(description: &str) -> Value {
    json!({ "ok": false, "error_code": 400, "description": description })
}

pub async fn mock_error(server: &MockServer, api_method: &str, description: &str) {
    Mock::given(method("POST"))
        .and(path_regex(method_path(api_method)))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(description)))
        .mount(server)
        .await;
}

pub async fn mock_error_for_chat(server: &MockServer, api_method: &str, chat_id: i64, description: &str) {
    Mock::given(method("POST"))
        .and(path_regex(method_path(api_method)))
        .and(body_partial_json(json!({ "chat_id": chat_id })))
        .respond_with(ResponseTemplate::new(400).set_body_json(error_body(description)))
        .mount(server)
        .await;
}

/// Answers every method the handlers use with a plausible success.
pub async fn mock_all(server: &MockServer) {
    for m in ["sendMessage", "sendDocument", "sendVideo"] {
        mock_ok(server, m, text_message(500, ADMIN, "ok")).await;
    }
    mock_ok(server, "deleteMessage", json!(true)).await;
    mock_ok(server, "answerCallbackQuery", json!(true)).await;
}

pub async fn calls(server: &MockServer, api_method: &str) -> usize {
    requests(server, api_method).await.len()
}

async fn requests(server: &MockServer, api_method: &str) -> Vec<wiremock::Request> {
    let suffix = format!("/{}", api_method.to_lowercase());
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().to_lowercase().ends_with(&suffix))
        .collect()
}

/// JSON bodies of a JSON-encoded method (not the multipart file uploads).
pub async fn bodies(server: &MockServer, api_method: &str) -> Vec<Value> {
    requests(server, api_method)
        .await
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

/// Texts of all `sendMessage` calls, in order.
pub async fn sent_texts(server: &MockServer) -> Vec<String> {
    bodies(server, "sendMessage")
        .await
        .into_iter()
        .map(|b| b["text"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn user(id: i64) -> Value {
    json!({ "id": id, "is_bot": false, "first_name": "Test", "username": format!("user{id}") })
}

fn chat(id: i64) -> Value {
    json!({ "id": id, "type": "private", "first_name": "Test" })
}

pub fn text_message(message_id: i32, chat_id: i64, text: &str) -> Value {
    json!({
        "message_id": message_id,
        "date": 1_700_000_000,
        "chat": chat(chat_id),
        "from": user(chat_id),
        "text": text,
    })
}

pub fn text(from: i64, text: &str) -> Message {
    serde_json::from_value(text_message(1, from, text)).unwrap()
}

pub fn document(from: i64, file_id: &str) -> Message {
    let msg: Message = serde_json::from_value(json!({
        "message_id": 2,
        "date": 1_700_000_000,
        "chat": chat(from),
        "from": user(from),
        "document": { "file_id": file_id, "file_unique_id": format!("u-{file_id}") },
    }))
    .unwrap();
    assert!(msg.document().is_some(), "fixture did not parse as a document");
    msg
}

pub fn video(from: i64, file_id: &str) -> Message {
    let msg: Message = serde_json::from_value(json!({
        "message_id": 3,
        "date": 1_700_000_000,
        "chat": chat(from),
        "from": user(from),
        "video": {
            "file_id": file_id,
            "file_unique_id": format!("u-{file_id}"),
            "file_size": 1_048_576,
            "width": 1280,
            "height": 720,
            "duration": 60,
            "file_name": "movie.mp4",
            "mime_type": "video/mp4",
        },
    }))
    .unwrap();
    assert!(msg.video().is_some(), "fixture did not parse as a video");
    msg
}

pub fn callback(from: i64, data: &str) -> CallbackQuery {
    serde_json::from_value(json!({
        "id": "cb-1",
        "from": user(from),
        "chat_instance": "ci-1",
        "data": data,
        "message": text_message(9, from, "Stored Files:"),
    }))
    .unwrap()
}
