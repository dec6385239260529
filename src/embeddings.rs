use crate::config::SharedConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

/// Base URL used when `llm.base_url` is empty
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Produces fixed-dimension embeddings for text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed many texts; the result has one embedding per input, in order.
    /// Either every text is embedded or the whole call fails.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Length of every vector this embedder produces
    fn dimensions(&self) -> u64;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint
#[derive(Clone)]
pub struct OpenAiEmbedder {
    config: SharedConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    /// Create a new embedding client; endpoint settings are read on every call
    pub fn new(config: SharedConfig) -> Self {
        let client = reqwest::Client::new();
        OpenAiEmbedder { config, client }
    }

    /// One HTTP request for `texts`
    async fn request(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let llm = self.config.llm();
        let model = self.config.embedder().model;

        let url = endpoint(&llm.base_url, "embeddings");
        let request = EmbeddingRequest {
            model: &model,
            input: texts,
        };

        let mut builder = self.client.post(&url).json(&request);
        if !llm.api_key.is_empty() {
            builder = builder.bearer_auth(&llm.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RagError::embedding(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::embedding(format!(
                "API request failed: {} {}",
                status, error_text
            )));
        }

        let response_data: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::embedding(format!("invalid response: {}", e)))?;

        order_embeddings(response_data.data, texts.len())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut embeddings = self.request(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| RagError::embedding("no embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let batch_size = self.config.embedder().batch_size.max(1);
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            debug!("Embedding batch of {} texts", batch.len());
            embeddings.extend(self.request(batch).await?);
        }

        Ok(embeddings)
    }

    fn dimensions(&self) -> u64 {
        self.config.embedder().dimensions
    }
}

/// Put response items back in input order and check nothing is missing
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Embedding>> {
    if data.len() != expected {
        return Err(RagError::embedding(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    data.sort_by_key(|d| d.index);

    Ok(data
        .into_iter()
        .map(|d| Embedding {
            values: d.embedding,
        })
        .collect())
}

/// Join an API base URL and a path, falling back to the OpenAI URL
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    let base = if base_url.is_empty() {
        DEFAULT_BASE_URL
    } else {
        base_url
    };
    format!("{}/{}", base.trim_end_matches('/'), path)
}
