use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

use senrag::chat::{ChatMessage, ChatModel, OpenAiChat};
use senrag::config::{Config, SharedConfig};
use senrag::embeddings::{Embedder, OpenAiEmbedder};
use senrag::error::RagError;

const STREAM_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: [DONE]\n\n",
);

/// One request as the upstream API saw it
#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    authorization: Option<String>,
    body: Value,
}

type RequestLog = Arc<Mutex<Vec<Recorded>>>;

fn record(log: &RequestLog, uri: &Uri, headers: &HeaderMap, body: &Value) {
    log.lock().push(Recorded {
        path: uri.path().to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
        body: body.clone(),
    });
}

async fn chat_completions(
    State(log): State<RequestLog>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record(&log, &uri, &headers, &body);

    if body["stream"] == json!(true) {
        return ([(header::CONTENT_TYPE, "text/event-stream")], STREAM_BODY).into_response();
    }

    let model = body["model"].as_str().unwrap_or_default();
    Json(json!({
        "choices": [{"message": {"role": "assistant", "content": format!("answered by {}", model)}}]
    }))
    .into_response()
}

/// Answers in reverse order so the client has to sort by index
async fn embeddings(
    State(log): State<RequestLog>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&log, &uri, &headers, &body);

    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(i, text)| {
            let len = text.as_str().unwrap_or_default().len();
            json!({"index": i, "embedding": [len as f32, 1.0]})
        })
        .collect();

    Json(json!({ "data": data }))
}

async fn denied() -> (StatusCode, &'static str) {
    (StatusCode::UNAUTHORIZED, "invalid api key")
}

/// Start a local OpenAI-compatible API; returns its base URL and request log
async fn spawn_upstream() -> (String, RequestLog) {
    let log = RequestLog::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/denied/chat/completions", post(denied))
        .route("/denied/embeddings", post(denied))
        .with_state(log.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), log)
}

fn shared_config(base_url: &str) -> SharedConfig {
    let yaml = format!(
        "llm:\n  base_url: {}\n  api_key: sk-test\n  model: gpt-4o-mini\n  max_tokens: 256\nembedder:\n  model: text-embedding-3-small\n  batch_size: 2\n",
        base_url
    );
    SharedConfig::new(Config::from_yaml_with_env(&yaml, |_| None).unwrap())
}

fn question() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("Answer briefly."),
        ChatMessage::user("What stores the vectors?"),
    ]
}

#[tokio::test]
async fn chat_follows_runtime_model_update() {
    let (base, log) = spawn_upstream().await;
    let config = shared_config(&format!("{}/v1", base));
    let chat = OpenAiChat::new(config.clone());

    let answer = chat.chat(&question()).await.unwrap();
    assert_eq!(answer, "answered by gpt-4o-mini");

    config.update_llm(None, Some("llama3".to_string()));
    let answer = chat.chat(&question()).await.unwrap();
    assert_eq!(answer, "answered by llama3");

    let requests = log.lock().clone();
    assert_eq!(requests.len(), 2);

    let first = &requests[0];
    assert_eq!(first.path, "/v1/chat/completions");
    assert_eq!(first.authorization.as_deref(), Some("Bearer sk-test"));
    assert_eq!(first.body["model"], "gpt-4o-mini");
    assert_eq!(first.body["max_tokens"], 256);
    assert!(first.body.get("temperature").is_none());
    assert_eq!(first.body["messages"][0]["role"], "system");
    assert_eq!(first.body["messages"][1]["content"], "What stores the vectors?");

    assert_eq!(requests[1].body["model"], "llama3");
}

#[tokio::test]
async fn chat_follows_runtime_base_url_update() {
    let (old_base, old_log) = spawn_upstream().await;
    let (new_base, new_log) = spawn_upstream().await;
    let config = shared_config(&format!("{}/v1", old_base));
    let chat = OpenAiChat::new(config.clone());

    config.update_llm(Some(format!("{}/v1", new_base)), None);
    chat.chat(&question()).await.unwrap();

    assert!(old_log.lock().is_empty());
    assert_eq!(new_log.lock().len(), 1);
}

#[tokio::test]
async fn stream_chat_yields_fragments() {
    let (base, log) = spawn_upstream().await;
    let chat = OpenAiChat::new(shared_config(&format!("{}/v1", base)));

    let fragments: Vec<String> = chat
        .stream_chat(&question())
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(fragments, vec!["Hel", "lo"]);
    assert_eq!(log.lock()[0].body["stream"], true);
}

#[tokio::test]
async fn embeddings_are_batched_and_ordered() {
    let (base, log) = spawn_upstream().await;
    let embedder = OpenAiEmbedder::new(shared_config(&format!("{}/v1", base)));

    let texts = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
    let embeddings = embedder.embed_batch(&texts).await.unwrap();

    let lengths: Vec<f32> = embeddings.iter().map(|e| e.values[0]).collect();
    assert_eq!(lengths, vec![1.0, 2.0, 3.0]);

    let requests = log.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.path == "/v1/embeddings"));
    assert!(requests
        .iter()
        .all(|r| r.authorization.as_deref() == Some("Bearer sk-test")));
    assert_eq!(requests[0].body["model"], "text-embedding-3-small");
    assert_eq!(requests[0].body["input"], json!(["a", "bb"]));
    assert_eq!(requests[1].body["input"], json!(["ccc"]));
}

#[tokio::test]
async fn upstream_error_text_is_passed_through() {
    let (base, _log) = spawn_upstream().await;
    let config = shared_config(&format!("{}/denied", base));

    let err = OpenAiChat::new(config.clone())
        .chat(&question())
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Chat(_)));
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("invalid api key"));

    let err = OpenAiEmbedder::new(config)
        .embed("hello")
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Embedding(_)));
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("invalid api key"));
}
