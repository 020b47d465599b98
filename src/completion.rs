//! Streaming chat-completion backends.
//!
//! A [`CompletionBackend`] turns a message list into a [`FragmentStream`]:
//! a bounded channel of text fragments fed by a background task. Dropping
//! the receiver stops the task at its next send, which in turn drops the
//! upstream HTTP response and closes the connection.
//!
//! | Config value | Backend |
//! |--------------|---------|
//! | `"openai"` | [`OpenAICompletion`], any OpenAI-compatible `/chat/completions` |
//! | `"disabled"` | [`DisabledCompletion`] |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use oraculum_core::prompt::ChatMessage;

use crate::config::CompletionConfig;

/// Fragments of one streamed answer, in order. Ends after the last
/// fragment, or after a single `Err` if the stream failed.
pub type FragmentStream = mpsc::Receiver<Result<String>>;

/// Capacity of the fragment channel between the reader task and the consumer.
const FRAGMENT_BUFFER: usize = 32;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start a streamed completion.
    ///
    /// Errors returned here mean the stream never started (connection
    /// refused, non-2xx status). Failures after that arrive in-band.
    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream>;
}

/// Build the backend named by `config.provider`.
pub fn create_backend(config: &CompletionConfig) -> Result<Arc<dyn CompletionBackend>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

// ============ Disabled Backend ============

/// Backend that refuses every request.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionBackend for DisabledCompletion {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn stream(&self, _messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        bail!("Completion provider is disabled; set [completion] provider = \"openai\"")
    }
}

// ============ OpenAI-compatible Backend ============

/// Streams `POST {base_url}/chat/completions` with `stream: true`.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAICompletion {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
    idle_timeout: Duration,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    /// Build with an explicit key instead of reading the environment.
    pub fn with_api_key(config: &CompletionConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("completion.model required for OpenAI provider"))?;
        let idle_timeout = Duration::from_secs(config.timeout_secs);
        // Stalls are caught per chunk; there is no whole-request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(idle_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            idle_timeout,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAICompletion {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
        });
        if let (Some(max), Some(obj)) = (self.max_tokens, body.as_object_mut()) {
            obj.insert("max_tokens".to_string(), json!(max));
        }

        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let res = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| anyhow!("completion endpoint did not respond in time"))??;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            bail!("Completion API error {}: {}", status, text);
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let mut upstream = res.bytes_stream();
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::default();
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("completion consumer went away, closing upstream");
                        return;
                    }
                    next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
                };
                let item = match next {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        if let Some(line) = lines.finish() {
                            let event = parse_sse_line(&line);
                            if event == SseEvent::Done || !forward_event(&tx, event).await {
                                return;
                            }
                        }
                        let _ = tx
                            .send(Err(anyhow!("completion stream ended before [DONE]")))
                            .await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(Err(anyhow!("completion stream stalled for {:?}", idle_timeout)))
                            .await;
                        return;
                    }
                };
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "completion stream broke");
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    if !forward_event(&tx, parse_sse_line(&line)).await {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Forward one parsed line to the consumer. Returns `false` once the
/// stream is over: `[DONE]`, an in-band error, or a departed consumer.
async fn forward_event(tx: &mpsc::Sender<Result<String>>, event: SseEvent) -> bool {
    match event {
        SseEvent::Fragment(text) => tx.send(Ok(text)).await.is_ok(),
        SseEvent::Done => false,
        SseEvent::Error(message) => {
            let _ = tx.send(Err(anyhow!(message))).await;
            false
        }
        SseEvent::Skip => true,
    }
}

// ============ SSE parsing ============

/// Reassembles complete lines from arbitrarily split network chunks.
///
/// Bytes are buffered rather than decoded per chunk, so a multi-byte UTF-8
/// character split across chunks survives intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Take whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

/// Meaning of one line of an OpenAI-style event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Fragment(String),
    Done,
    Error(String),
    /// Blank lines, comments, role-only deltas, unparseable payloads.
    Skip,
}

pub fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return SseEvent::Skip;
    };
    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return SseEvent::Error(message);
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseEvent::Fragment(content.to_string()),
        _ => SseEvent::Skip,
    }
}
