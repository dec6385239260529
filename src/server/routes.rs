//! API route handlers

use axum::{
    extract::{rejection::JsonRejection, Multipart, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::Path;
use uuid::Uuid;

use super::state::AppState;
use crate::error::{RagError, Result};

/// Body of `/api/query` and `/api/query/stream`
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub top_k: i64,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    /// Name the file was uploaded with
    pub filename: String,
    /// Name the file was saved under
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateConfigRequest {
    #[serde(default)]
    pub llm: LlmUpdate,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmUpdate {
    pub base_url: Option<String>,
    pub model: Option<String>,
}

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "time": chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

/// POST /api/upload - save the `file` field and ingest it
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let config = state.config().snapshot();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RagError::validation(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        // Only the final path component of the client-supplied name is kept
        let filename = field
            .file_name()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = Path::new(&filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        if !config.is_extension_allowed(&ext) {
            return Err(RagError::validation(format!(
                "unsupported file type '{}', allowed: {}",
                ext,
                config.upload.allowed_extensions.join(", ")
            )));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| RagError::validation(format!("failed to read upload: {}", e)))?;

        let id = format!("{}{}", Uuid::new_v4(), ext);
        let save_dir = Path::new(&config.upload.save_path);
        tokio::fs::create_dir_all(save_dir).await?;
        let save_path = save_dir.join(&id);
        tokio::fs::write(&save_path, &data).await?;

        info!("Saved upload {} ({} bytes) as {}", filename, data.len(), id);

        let report = state.engine().ingest_as(&save_path, &filename).await?;
        info!("Ingested {} as {} chunks", filename, report.chunks);

        return Ok(Json(UploadResponse {
            message: "upload succeeded".to_string(),
            filename,
            id,
        }));
    }

    Err(RagError::validation("missing form field 'file'"))
}

/// POST /api/query
pub async fn query(
    State(state): State<AppState>,
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>> {
    let request = validate_query(payload)?;

    let outcome = state
        .engine()
        .query(&request.question, request.top_k)
        .await?;

    Ok(Json(QueryResponse {
        answer: outcome.answer,
    }))
}

/// POST /api/query/stream - answer fragments as server-sent events.
///
/// Each fragment is one `data:` event. A failure mid-stream is sent as an
/// `error` event. The stream always finishes with `data: [DONE]`.
pub async fn query_stream(
    State(state): State<AppState>,
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let request = validate_query(payload)?;

    let fragments = state
        .engine()
        .stream_query(&request.question, request.top_k)
        .await?;

    let events = fragments
        .map(|item| {
            Ok::<_, Infallible>(match item {
                Ok(text) => Event::default().data(strip_cr(&text)),
                Err(e) => {
                    warn!("answer stream failed: {}", e);
                    Event::default().event("error").data(strip_cr(&e.to_string()))
                }
            })
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// GET /api/config - current settings without secrets
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let config = state.config().snapshot();

    Json(json!({
        "llm": {
            "provider": config.llm.provider,
            "base_url": config.llm.base_url,
            "model": config.llm.model,
            "max_tokens": config.llm.max_tokens,
            "temperature": config.llm.temperature,
        },
        "qdrant": {
            "host": config.qdrant.host,
            "port": config.qdrant.port,
            "collection_name": config.qdrant.collection_name,
            "use_auth": config.qdrant.use_auth,
        },
        "upload": {
            "max_file_size": config.upload.max_file_size,
            "allowed_extensions": config.upload.allowed_extensions,
            "save_path": config.upload.save_path,
        },
        "embedder": {
            "model": config.embedder.model,
            "batch_size": config.embedder.batch_size,
        },
    }))
}

/// PUT /api/config - change the LLM endpoint or model for this process only
pub async fn update_config(
    State(state): State<AppState>,
    payload: std::result::Result<Json<UpdateConfigRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = payload.map_err(|e| RagError::validation(e.body_text()))?;

    state
        .config()
        .update_llm(request.llm.base_url, request.llm.model);

    let llm = state.config().llm();
    info!("LLM settings updated: base_url={} model={}", llm.base_url, llm.model);

    Ok(Json(json!({ "message": "configuration updated" })))
}

fn validate_query(
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> Result<QueryRequest> {
    let Json(request) = payload.map_err(|e| RagError::validation(e.body_text()))?;

    if request.question.trim().is_empty() {
        return Err(RagError::validation("question is required"));
    }

    Ok(request)
}

/// SSE data may not carry carriage returns
fn strip_cr(text: &str) -> String {
    text.replace('\r', "")
}
