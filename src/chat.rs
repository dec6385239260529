use crate::config::SharedConfig;
use crate::embeddings::endpoint;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Display;

/// Answer fragments in arrival order. An `Err` item is always the last one.
pub type AnswerStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A chat-completion model
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete the conversation and return the whole answer
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Complete the conversation, yielding the answer as it is generated
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<AnswerStream>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct OpenAiChat {
    config: SharedConfig,
    client: reqwest::Client,
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
}

impl OpenAiChat {
    /// Create a new chat client; base URL and model are read on every call
    pub fn new(config: SharedConfig) -> Self {
        let client = reqwest::Client::new();
        OpenAiChat { config, client }
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let llm = self.config.llm();

        let request = ChatRequest {
            model: llm.model.clone(),
            messages,
            max_tokens: (llm.max_tokens > 0).then_some(llm.max_tokens),
            temperature: (llm.temperature > 0.0).then_some(llm.temperature),
            stream,
        };

        let url = endpoint(&llm.base_url, "chat/completions");
        debug!("POST {} (model {}, stream {})", url, llm.model, stream);

        let mut builder = self.client.post(&url).json(&request);
        if !llm.api_key.is_empty() {
            builder = builder.bearer_auth(&llm.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RagError::chat(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::chat(format!(
                "API request failed: {} {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(messages, false).await?;

        let response_data: ChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::chat(format!("invalid response: {}", e)))?;

        response_data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::chat("No response generated"))
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<AnswerStream> {
        let response = self.send(messages, true).await?;
        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }
}

/// One `data:` payload of a server-sent event stream
#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` lines, buffering partial lines
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(parse_line(&line));
        }
        events
    }

    /// Flush a trailing line that had no newline
    fn finish(&mut self) -> Vec<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim().strip_prefix("data:")?.trim_start();

    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

/// Text carried by one streamed completion chunk, if any
fn parse_chunk(data: &str) -> Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| RagError::chat(format!("invalid stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(RagError::chat(error.to_string()));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

struct StreamState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn enqueue(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Done => {
                    self.finished = true;
                    return;
                }
                SseEvent::Data(data) => match parse_chunk(&data) {
                    Ok(Some(text)) => self.pending.push_back(Ok(text)),
                    Ok(None) => {}
                    Err(e) => {
                        self.pending.push_back(Err(e));
                        self.finished = true;
                        return;
                    }
                },
            }
        }
    }
}

/// Turn a chat-completion SSE byte stream into answer fragments.
///
/// Ends at `[DONE]`, at the end of the byte stream, or right after the first
/// error. Dropping the returned stream drops the underlying connection.
fn decode_stream<S, B, E>(bytes: S) -> AnswerStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = StreamState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(bytes.as_ref());
                    state.enqueue(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(RagError::chat(format!("stream error: {}", e))), state));
                }
                None => {
                    let events = state.decoder.finish();
                    state.enqueue(events);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
