use crate::chat::{AnswerStream, ChatMessage, ChatModel};
use crate::chunking::split_into_chunks;
use crate::database::{DocumentChunk, SearchResult, VectorStore};
use crate::document::{extract_text, Document};
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use futures::stream::{self, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Number of chunks retrieved when the caller asks for zero or fewer
pub const DEFAULT_TOP_K: u64 = 5;

/// Answer given when the search finds nothing; the chat model is not called
pub const NO_RESULTS_ANSWER: &str = "No relevant documents found.";

pub const SYSTEM_PROMPT: &str = "You are a knowledge base assistant. \
Answer the user's question using only the provided context. \
If the context does not contain the information needed to answer, say so explicitly.";

/// Outcome of ingesting one file
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub source: String,
    pub chunks: usize,
    pub point_ids: Vec<Uuid>,
}

/// Outcome of a blocking query
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Best-scoring chunk, `None` when nothing matched
    pub top_result: Option<SearchResult>,
    pub answer: String,
}

/// RAG (Retrieval-Augmented Generation) engine
#[derive(Clone)]
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    chat: Arc<dyn ChatModel>,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        chat: Arc<dyn ChatModel>,
    ) -> Self {
        RagEngine {
            embedder,
            store,
            chat,
        }
    }

    /// Ingest a file, labelling its chunks with the file's base name
    pub async fn ingest(&self, file_path: &Path) -> Result<IngestReport> {
        let document = extract_text(file_path)?;
        let source = document.file_name.clone();
        self.ingest_document(document, &source).await
    }

    /// Ingest a file: extract, chunk, embed and store it, labelling chunks with `source`.
    ///
    /// Nothing is stored unless every chunk was embedded.
    pub async fn ingest_as(&self, file_path: &Path, source: &str) -> Result<IngestReport> {
        let document = extract_text(file_path)?;
        self.ingest_document(document, source).await
    }

    async fn ingest_document(&self, document: Document, source: &str) -> Result<IngestReport> {
        let chunks = split_into_chunks(&document.content);
        info!("Split {} into {} chunks", source, chunks.len());

        let embeddings = self.embedder.embed_batch(&chunks).await?;
        let records = build_records(chunks, embeddings, source)?;
        let point_ids = records.iter().map(|r| r.id).collect::<Vec<_>>();

        self.store.upsert(records).await?;
        info!("Stored {} chunks from {}", point_ids.len(), source);

        Ok(IngestReport {
            source: source.to_string(),
            chunks: point_ids.len(),
            point_ids,
        })
    }

    /// Answer a question from the stored documents
    pub async fn query(&self, question: &str, top_k: i64) -> Result<QueryOutcome> {
        let results = self.retrieve(question, top_k).await?;

        let Some(top_result) = results.first().cloned() else {
            return Ok(QueryOutcome {
                top_result: None,
                answer: NO_RESULTS_ANSWER.to_string(),
            });
        };

        let answer = self.chat.chat(&build_messages(question, &results)).await?;

        Ok(QueryOutcome {
            top_result: Some(top_result),
            answer,
        })
    }

    /// Answer a question, streaming the answer as the chat model produces it
    pub async fn stream_query(&self, question: &str, top_k: i64) -> Result<AnswerStream> {
        let results = self.retrieve(question, top_k).await?;

        if results.is_empty() {
            let answer = NO_RESULTS_ANSWER.to_string();
            return Ok(stream::once(async move { Ok::<_, RagError>(answer) }).boxed());
        }

        self.chat
            .stream_chat(&build_messages(question, &results))
            .await
    }

    async fn retrieve(&self, question: &str, top_k: i64) -> Result<Vec<SearchResult>> {
        let limit = effective_top_k(top_k);
        info!("Query: \"{}\" (top_k {})", question, limit);

        let query_embedding = self.embedder.embed(question).await?;
        let results = self.store.search(query_embedding.values, limit).await?;
        debug!("Retrieved {} chunks", results.len());

        Ok(results)
    }
}

/// `top_k` as requested, or `DEFAULT_TOP_K` when it is zero or negative
pub fn effective_top_k(top_k: i64) -> u64 {
    if top_k <= 0 {
        DEFAULT_TOP_K
    } else {
        top_k as u64
    }
}

/// Pair each chunk with the embedding at the same position
fn build_records(
    chunks: Vec<String>,
    embeddings: Vec<Embedding>,
    source: &str,
) -> Result<Vec<DocumentChunk>> {
    if chunks.len() != embeddings.len() {
        return Err(RagError::embedding(format!(
            "expected {} embeddings, got {}",
            chunks.len(),
            embeddings.len()
        )));
    }

    let chunk_count = chunks.len();
    Ok(chunks
        .into_iter()
        .zip(embeddings)
        .enumerate()
        .map(|(idx, (content, embedding))| DocumentChunk {
            id: Uuid::new_v4(),
            content,
            source: source.to_string(),
            vector: embedding.values,
            metadata: HashMap::from([
                ("chunk_index".to_string(), idx.to_string()),
                ("chunk_count".to_string(), chunk_count.to_string()),
            ]),
        })
        .collect())
}

/// Numbered context block, one entry per retrieved chunk
pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("[{}] {}\n{}\n\n", i + 1, r.source, r.content))
        .collect()
}

fn build_messages(question: &str, results: &[SearchResult]) -> Vec<ChatMessage> {
    let user_message = format!(
        "Context:\n{}\nQuestion: {}",
        build_context(results),
        question
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_message)]
}
