use crate::config::QdrantConfig;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::{debug, info};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    Value, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant, QdrantError};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on connecting and preparing the collection at startup
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout of each request to Qdrant, setup and later upserts and searches alike
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A chunk of a document together with its embedding
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    /// Point identifier in the vector store
    pub id: Uuid,
    pub content: String,
    /// Name of the file the chunk came from
    pub source: String,
    pub vector: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

/// A stored chunk returned by a similarity search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub content: String,
    pub source: String,
    /// Cosine similarity to the query, higher is closer
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// Storage and nearest-neighbour search over chunk embeddings
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace all `chunks` in one request
    async fn upsert(&self, chunks: Vec<DocumentChunk>) -> Result<()>;

    /// The `limit` chunks closest to `vector`, best match first
    async fn search(&self, vector: Vec<f32>, limit: u64) -> Result<Vec<SearchResult>>;
}

/// Vector store backed by a single Qdrant collection
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantStore {
    /// Connect to Qdrant and make sure the collection exists.
    ///
    /// The whole setup is bounded by `SETUP_TIMEOUT`.
    pub async fn connect(config: &QdrantConfig, dimensions: u64) -> Result<Self> {
        tokio::time::timeout(SETUP_TIMEOUT, Self::setup(config, dimensions))
            .await
            .map_err(|_| {
                RagError::store(format!(
                    "timed out after {}s connecting to qdrant",
                    SETUP_TIMEOUT.as_secs()
                ))
            })?
    }

    async fn setup(config: &QdrantConfig, dimensions: u64) -> Result<Self> {
        let url = format!("http://{}:{}", config.host, config.port);
        info!("Connecting to qdrant at {}", url);

        if config.use_auth && config.api_key.is_empty() {
            return Err(RagError::Config(
                "qdrant.use_auth is set but no API key is configured".to_string(),
            ));
        }

        let config_builder = Qdrant::from_url(&url).timeout(REQUEST_TIMEOUT);
        let config_builder = if config.api_key.is_empty() {
            config_builder
        } else {
            config_builder.api_key(config.api_key.clone())
        };

        let client = config_builder
            .build()
            .map_err(|e| RagError::store(format!("failed to connect to qdrant: {}", e)))?;

        let store = QdrantStore {
            client,
            collection_name: config.collection_name.clone(),
        };
        store.ensure_collection(dimensions).await?;

        Ok(store)
    }

    /// Create the collection unless it already exists
    async fn ensure_collection(&self, dimensions: u64) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| RagError::store(format!("failed to check collection: {}", e)))?;

        if exists {
            debug!("Using existing collection {}", self.collection_name);
            return Ok(());
        }

        let create_collection = CreateCollectionBuilder::new(self.collection_name.clone())
            .vectors_config(VectorParamsBuilder::new(dimensions, Distance::Cosine));

        match self.client.create_collection(create_collection).await {
            Ok(_) => {
                info!(
                    "Created collection {} ({} dimensions)",
                    self.collection_name, dimensions
                );
                Ok(())
            }
            // Another instance created it between the check and the create
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(RagError::store(format!(
                "failed to create collection {}: {}",
                self.collection_name, e
            ))),
        }
    }
}

fn is_already_exists(error: &QdrantError) -> bool {
    match error {
        QdrantError::ResponseError { status } => {
            status.code() == tonic::Code::AlreadyExists
                || status.message().contains("already exists")
        }
        _ => false,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, chunks: Vec<DocumentChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points = chunks
            .into_iter()
            .map(to_point)
            .collect::<Result<Vec<PointStruct>>>()?;
        let count = points.len();

        let upsert_request = UpsertPointsBuilder::new(self.collection_name.clone(), points).wait(true);

        self.client
            .upsert_points(upsert_request)
            .await
            .map_err(|e| RagError::store(e.to_string()))?;

        debug!("Upserted {} points into {}", count, self.collection_name);
        Ok(())
    }

    async fn search(&self, vector: Vec<f32>, limit: u64) -> Result<Vec<SearchResult>> {
        let search_request =
            SearchPointsBuilder::new(self.collection_name.clone(), vector, limit).with_payload(true);

        let search_response = self
            .client
            .search_points(search_request)
            .await
            .map_err(|e| RagError::store(e.to_string()))?;

        Ok(search_response
            .result
            .into_iter()
            .map(|point| from_payload(&point.payload, point.score))
            .collect())
    }
}

fn to_point(chunk: DocumentChunk) -> Result<PointStruct> {
    // Metadata is kept as a JSON string so it reads back without type mapping
    let metadata = serde_json::to_string(&chunk.metadata)
        .map_err(|e| RagError::store(format!("failed to encode metadata: {}", e)))?;

    let payload = Payload::try_from(json!({
        "content": chunk.content,
        "source": chunk.source,
        "metadata": metadata,
    }))
    .map_err(|e| RagError::store(format!("failed to build payload: {}", e)))?;

    Ok(PointStruct::new(chunk.id.to_string(), chunk.vector, payload))
}

fn from_payload(payload: &HashMap<String, Value>, score: f32) -> SearchResult {
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_default()
    };

    let metadata = payload
        .get("metadata")
        .and_then(|v| v.as_str())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    SearchResult {
        content: text("content"),
        source: text("source"),
        score,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> DocumentChunk {
        DocumentChunk {
            id: Uuid::new_v4(),
            content: "Qdrant stores vectors.".to_string(),
            source: "notes.md".to_string(),
            vector: vec![0.1, 0.2, 0.3],
            metadata: HashMap::from([("chunk_index".to_string(), "0".to_string())]),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let chunk = chunk();
        let point = to_point(chunk.clone()).unwrap();

        let result = from_payload(&point.payload, 0.87);
        assert_eq!(result.content, chunk.content);
        assert_eq!(result.source, chunk.source);
        assert_eq!(result.metadata, chunk.metadata);
        assert_eq!(result.score, 0.87);
    }

    #[test]
    fn test_missing_payload_fields_default_to_empty() {
        let result = from_payload(&HashMap::new(), 0.5);
        assert!(result.content.is_empty());
        assert!(result.source.is_empty());
        assert!(result.metadata.is_empty());
    }

    #[test]
    fn test_already_exists_detection() {
        let exists = QdrantError::ResponseError {
            status: tonic::Status::already_exists("Collection `docs` already exists!"),
        };
        let denied = QdrantError::ResponseError {
            status: tonic::Status::permission_denied("invalid api key"),
        };
        assert!(is_already_exists(&exists));
        assert!(!is_already_exists(&denied));
    }
}
