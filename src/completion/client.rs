//! Completion service client.
//!
//! [`CompletionClient`] is the seam between the engine and the external
//! text-completion service. The HTTP implementation talks to an
//! OpenAI-compatible `/chat/completions` endpoint with streaming enabled so
//! progress can be observed through a [`Heartbeat`] and text received before
//! a dropped connection can be salvaged.

use crate::errors::CallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// One request to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(model: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
        }
    }
}

/// Text plus token accounting returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug)]
struct HeartbeatState {
    last_progress: Instant,
    partial: String,
}

/// Liveness signal shared between an outstanding call and its watchdog.
///
/// Clients call [`Heartbeat::beat`] whenever bytes arrive and
/// [`Heartbeat::push_text`] for decoded output, which also counts as
/// progress.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    inner: Arc<Mutex<HeartbeatState>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeartbeatState {
                last_progress: Instant::now(),
                partial: String::new(),
            })),
        }
    }

    pub fn beat(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.last_progress = Instant::now();
        }
    }

    pub fn push_text(&self, text: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state.last_progress = Instant::now();
            state.partial.push_str(text);
        }
    }

    pub fn last_progress(&self) -> Instant {
        self.inner
            .lock()
            .map(|s| s.last_progress)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_progress().elapsed()
    }

    /// Text received so far, if any.
    pub fn partial(&self) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .map(|s| s.partial.clone())
            .filter(|p| !p.trim().is_empty())
    }
}

/// A text-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion. Implementations report progress on `heartbeat`
    /// and classify failures as transient or permanent.
    async fn complete(
        &self,
        request: &CompletionRequest,
        heartbeat: &Heartbeat,
    ) -> Result<CompletionResponse, CallError>;
}

/// Streaming client for OpenAI-compatible chat completion endpoints.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCompletionClient {
    pub fn new(base_url: &str, api_key: Option<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        heartbeat: &Heartbeat,
    ) -> Result<CompletionResponse, CallError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let mut builder = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let mut response = builder.send().await.map_err(|e| classify_send_error(&e))?;
        heartbeat.beat();

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &detail));
        }

        let mut stream = StreamState::new(&request.model);
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    heartbeat.beat();
                    buffer.extend_from_slice(&bytes);
                    stream.consume(drain_sse_events(&mut buffer), heartbeat);
                    if stream.done {
                        break;
                    }
                }
                Ok(None) => {
                    // The last packet may arrive without its blank line
                    if !buffer.is_empty() {
                        buffer.extend_from_slice(b"\n\n");
                        stream.consume(drain_sse_events(&mut buffer), heartbeat);
                    }
                    break;
                }
                Err(e) => return Err(stream.interrupted(format!("stream interrupted: {}", e))),
            }
        }

        if !stream.is_complete() {
            return Err(stream.interrupted("stream ended before completion".to_string()));
        }
        Ok(stream.finish(&request.prompt))
    }
}

fn classify_send_error(err: &reqwest::Error) -> CallError {
    if err.is_builder() {
        CallError::Permanent(err.to_string())
    } else {
        CallError::Transient {
            reason: err.to_string(),
            partial: None,
        }
    }
}

/// Map an HTTP status to transient (rate limits, timeouts, server errors)
/// or permanent (every other client error).
pub fn classify_status(status: u16, detail: &str) -> CallError {
    let detail = detail.chars().take(500).collect::<String>();
    match status {
        408 | 409 | 425 | 429 | 500..=599 => CallError::Transient {
            reason: format!("HTTP {}: {}", status, detail),
            partial: None,
        },
        _ => CallError::Permanent(format!("HTTP {}: {}", status, detail)),
    }
}

/// Accumulates a streamed response.
#[derive(Debug)]
struct StreamState {
    text: String,
    model: String,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    /// `[DONE]` sentinel seen.
    done: bool,
    /// A choice reported a `finish_reason`.
    finished: bool,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            text: String::new(),
            model: model.to_string(),
            prompt_tokens: None,
            completion_tokens: None,
            done: false,
            finished: false,
        }
    }

    fn consume(&mut self, events: Vec<SseEvent>, heartbeat: &Heartbeat) {
        for event in events {
            if let Some(delta) = self.apply(&event) {
                heartbeat.push_text(&delta);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.done || self.finished
    }

    /// Transient failure carrying whatever text already arrived.
    fn interrupted(self, reason: String) -> CallError {
        let partial = Some(self.text).filter(|t| !t.trim().is_empty());
        CallError::Transient { reason, partial }
    }

    /// Apply one event; returns newly received text.
    fn apply(&mut self, event: &SseEvent) -> Option<String> {
        let value = match event {
            SseEvent::Done => {
                self.done = true;
                return None;
            }
            SseEvent::Data(value) => value,
        };

        if let Some(model) = value.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            self.prompt_tokens = usage.get("prompt_tokens").and_then(Value::as_u64);
            self.completion_tokens = usage.get("completion_tokens").and_then(Value::as_u64);
        }

        let choice = value.get("choices").and_then(|c| c.get(0))?;
        if choice.get("finish_reason").is_some_and(|r| !r.is_null()) {
            self.finished = true;
        }
        let delta = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)?;
        if delta.is_empty() {
            return None;
        }
        self.text.push_str(delta);
        Some(delta.to_string())
    }

    fn finish(self, prompt: &str) -> CompletionResponse {
        CompletionResponse {
            prompt_tokens: self
                .prompt_tokens
                .unwrap_or_else(|| estimate_tokens(prompt)),
            completion_tokens: self
                .completion_tokens
                .unwrap_or_else(|| estimate_tokens(&self.text)),
            text: self.text,
            model: self.model,
        }
    }
}

/// Rough token estimate for services that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(Value),
    Done,
}

/// Packet separators accepted between SSE events, longest first.
const PACKET_TERMINATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

/// Byte range `(start, end)` of the earliest packet terminator in `buffer`.
fn find_packet_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for terminator in PACKET_TERMINATORS {
        let found = buffer
            .windows(terminator.len())
            .position(|w| w == terminator)
            .map(|start| (start, start + terminator.len()));
        if let Some(hit) = found
            && best.is_none_or(|b| hit.0 < b.0)
        {
            best = Some(hit);
        }
    }
    best
}

/// Remove every complete SSE packet from `buffer` and decode its data lines.
///
/// Works on raw bytes: terminators are ASCII, so a multi-byte character
/// split across network reads stays intact until its packet is complete.
fn drain_sse_events(buffer: &mut Vec<u8>) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some((_, end)) = find_packet_end(buffer) {
        let packet: Vec<u8> = buffer.drain(..end).collect();
        let packet = match String::from_utf8(packet) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Skipping SSE packet with invalid UTF-8");
                continue;
            }
        };

        for line in packet.split(['\r', '\n']) {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                break;
            }
            if data.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                events.push(SseEvent::Data(value));
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn content(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}", text)
    }

    #[test]
    fn drains_complete_packets_only() {
        let mut buffer = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             : keep-alive\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
             data: {\"tail\""
            .to_vec();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(buffer, b"data: {\"tail\"");
    }

    #[test]
    fn crlf_and_cr_separators_end_packets() {
        let mut buffer = format!("{}\r\n\r\n{}\r\r{}\r\n", content("a"), content("b"), content("c"))
            .into_bytes();
        let mut state = StreamState::new("m");
        let deltas: Vec<String> = drain_sse_events(&mut buffer)
            .iter()
            .filter_map(|e| state.apply(e))
            .collect();
        assert_eq!(deltas, vec!["a", "b"]);
        assert_eq!(buffer, format!("{}\r\n", content("c")).into_bytes());
    }

    #[test]
    fn split_multibyte_character_waits_for_its_packet() {
        let packet = format!("{}\n\n", content("café")).into_bytes();
        let split = packet.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = packet[..split].to_vec();
        assert!(drain_sse_events(&mut buffer).is_empty());
        buffer.extend_from_slice(&packet[split..]);

        let mut state = StreamState::new("m");
        for event in drain_sse_events(&mut buffer) {
            state.apply(&event);
        }
        assert_eq!(state.text, "café");
    }

    #[test]
    fn finish_reason_marks_the_stream_complete() {
        let mut buffer =
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_vec();
        let mut state = StreamState::new("m");
        assert!(!state.is_complete());
        for event in drain_sse_events(&mut buffer) {
            state.apply(&event);
        }
        assert!(state.is_complete());
        assert!(!state.done);
    }

    #[test]
    fn stream_state_accumulates_text_and_usage() {
        let mut buffer = String::from(
            "data: {\"model\":\"m-1\",\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n\
             data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":2}}\n\n\
             data: [DONE]\n\n",
        )
        .into_bytes();
        let mut state = StreamState::new("requested");
        let deltas: Vec<String> = drain_sse_events(&mut buffer)
            .iter()
            .filter_map(|e| state.apply(e))
            .collect();

        assert_eq!(deltas, vec!["Hello ", "world"]);
        assert!(state.done);
        let response = state.finish("prompt");
        assert_eq!(response.text, "Hello world");
        assert_eq!(response.model, "m-1");
        assert_eq!(response.prompt_tokens, 12);
        assert_eq!(response.completion_tokens, 2);
    }

    #[test]
    fn missing_usage_is_estimated() {
        let state = StreamState::new("m");
        let response = state.finish("12345678");
        assert_eq!(response.prompt_tokens, 2);
        assert_eq!(response.completion_tokens, 0);
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(429, "slow down").is_retryable());
        assert!(classify_status(503, "").is_retryable());
        assert!(!classify_status(400, "bad").is_retryable());
        assert!(!classify_status(401, "key").is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_tracks_progress_and_partial_text() {
        let heartbeat = Heartbeat::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(heartbeat.idle_for(), Duration::from_secs(5));

        heartbeat.push_text("partial answer");
        assert_eq!(heartbeat.idle_for(), Duration::ZERO);
        assert_eq!(heartbeat.partial().as_deref(), Some("partial answer"));

        let quiet = Heartbeat::new();
        quiet.push_text("  ");
        assert!(quiet.partial().is_none());
    }

    #[test]
    fn endpoint_joins_base_url() {
        let client =
            HttpCompletionClient::new("http://localhost:8080/v1/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            if n == 0 {
                return;
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(head_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&raw[..head_end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + length {
                    return;
                }
            }
        }
    }

    async fn write_stream(
        socket: &mut TcpStream,
        pieces: Vec<Vec<u8>>,
        complete: bool,
    ) -> std::io::Result<()> {
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                  transfer-encoding: chunked\r\nconnection: close\r\n\r\n",
            )
            .await?;
        for piece in pieces {
            socket.write_all(format!("{:x}\r\n", piece.len()).as_bytes()).await?;
            socket.write_all(&piece).await?;
            socket.write_all(b"\r\n").await?;
            socket.flush().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if complete {
            socket.write_all(b"0\r\n\r\n").await?;
        }
        socket.flush().await
    }

    /// Start a one-shot server that streams `pieces` as separate HTTP
    /// chunks. Without `complete` the connection drops before the final
    /// chunk. Returns the base URL.
    async fn serve_stream(pieces: Vec<Vec<u8>>, complete: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                read_request(&mut socket).await;
                let _ = write_stream(&mut socket, pieces, complete).await;
            }
        });
        format!("http://{}", addr)
    }

    async fn complete_against(
        pieces: Vec<Vec<u8>>,
        complete: bool,
    ) -> Result<CompletionResponse, CallError> {
        let base_url = serve_stream(pieces, complete).await;
        let client = HttpCompletionClient::new(&base_url, None, Duration::from_secs(5)).unwrap();
        client
            .complete(&CompletionRequest::new("m", "prompt"), &Heartbeat::new())
            .await
    }

    #[tokio::test]
    async fn http_stream_keeps_characters_split_across_chunks() {
        let packet = format!("{}\n\n", content("café")).into_bytes();
        let split = packet.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let pieces = vec![
            packet[..split].to_vec(),
            packet[split..].to_vec(),
            b"data: [DONE]\n\n".to_vec(),
        ];

        let response = complete_against(pieces, true).await.unwrap();
        assert_eq!(response.text, "café");
    }

    #[tokio::test]
    async fn http_stream_accepts_crlf_framing() {
        let pieces = vec![
            format!("{}\r\n\r\n", content("hel")).into_bytes(),
            format!("{}\r\n\r\ndata: [DONE]\r\n\r\n", content("lo")).into_bytes(),
        ];

        let response = complete_against(pieces, true).await.unwrap();
        assert_eq!(response.text, "hello");
    }

    #[tokio::test]
    async fn http_stream_finish_reason_without_done_succeeds() {
        let pieces = vec![
            format!("{}\n\n", content("done")).into_bytes(),
            // No trailing blank line before the server closes
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}".to_vec(),
        ];

        let response = complete_against(pieces, true).await.unwrap();
        assert_eq!(response.text, "done");
    }

    #[tokio::test]
    async fn http_stream_ending_without_done_is_transient() {
        let pieces = vec![b"data: {\"choices\":[]}\n\n".to_vec()];

        let err = complete_against(pieces, true).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, CallError::Transient { partial: None, .. }));
    }

    #[tokio::test]
    async fn http_stream_disconnect_keeps_partial_text() {
        let pieces = vec![
            format!("{}\n\n", content("hel")).into_bytes(),
            format!("{}\n\n", content("lo")).into_bytes(),
        ];

        let err = complete_against(pieces, false).await.unwrap_err();
        match err {
            CallError::Transient { partial, .. } => assert_eq!(partial.as_deref(), Some("hello")),
            other => panic!("expected transient error, got {other:?}"),
        }
    }
}
