//! The completion caller: one logical call to the completion service.
//!
//! A logical call may become several service requests. Oversized input is
//! chunked and followed by one synthesis request, and every request runs
//! under the retry policy with two independent timers:
//! - a stall timer, reset whenever the client reports progress
//! - an overall per-attempt timeout
//!
//! Cancellation is cooperative. It is checked before each attempt, during
//! backoff and between chunk requests, and never interrupts a request that
//! is already in flight.

use crate::completion::chunking::{ChunkConfig, chunk_text};
use crate::completion::client::{
    CompletionClient, CompletionRequest, CompletionResponse, Heartbeat, estimate_tokens,
};
use crate::completion::retry::RetryPolicy;
use crate::errors::CallError;
use crate::plan::Depth;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(600);

/// A prompt split into instructions and the input text they apply to.
///
/// Only `input` is chunked; instructions are repeated in every request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub instructions: String,
    pub input: String,
}

impl Prompt {
    pub fn new(instructions: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            input: input.into(),
        }
    }

    pub fn render(&self) -> String {
        if self.input.is_empty() {
            self.instructions.clone()
        } else {
            format!("{}\n\n=== INPUT ===\n{}", self.instructions, self.input)
        }
    }

    /// SHA-256 of the rendered prompt, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }

    fn render_chunk(&self, index: usize, total: usize, chunk: &str) -> String {
        format!(
            "{}\n\nThe input is too long for one request and was split into {} overlapping \
             sections. Report findings for section {} only; the sections are combined \
             afterwards.\n\n=== INPUT (section {} of {}) ===\n{}",
            self.instructions,
            total,
            index + 1,
            index + 1,
            total,
            chunk
        )
    }

    fn render_synthesis(&self, partials: &[String]) -> String {
        let sections: Vec<String> = partials
            .iter()
            .enumerate()
            .map(|(i, text)| format!("<<< section {} of {} >>>\n{}", i + 1, partials.len(), text))
            .collect();
        format!(
            "{}\n\nThe input was analyzed in {} overlapping sections. Combine the section \
             findings below into one answer, merging points repeated across section \
             boundaries.\n\n=== SECTION FINDINGS ===\n{}",
            self.instructions,
            partials.len(),
            sections.join("\n\n")
        )
    }
}

/// Outcome of one logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed_ms: u64,
    /// Input was split into chunks plus one synthesis request
    pub chunked: bool,
    pub chunk_count: u32,
    /// Text was salvaged from an interrupted response
    pub partial: bool,
    /// Service requests issued, retries included
    pub attempts: u32,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub depth: Depth,
    /// Phase- or operation-level default model, used when no hint is given.
    pub default_model: Option<String>,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new(depth: Depth, cancel: CancellationToken) -> Self {
        Self {
            depth,
            default_model: None,
            cancel,
        }
    }

    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }
}

/// Picks a model for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelector {
    pub default: String,
    pub surface: Option<String>,
    pub standard: Option<String>,
    pub deep: Option<String>,
}

impl ModelSelector {
    pub fn new(default: &str) -> Self {
        Self {
            default: default.to_string(),
            surface: None,
            standard: None,
            deep: None,
        }
    }

    /// Explicit hint, else the phase default, else the model for `depth`.
    pub fn select(&self, hint: Option<&str>, phase_default: Option<&str>, depth: Depth) -> String {
        let by_depth = match depth {
            Depth::Surface => self.surface.as_deref(),
            Depth::Standard => self.standard.as_deref(),
            Depth::Deep => self.deep.as_deref(),
        };
        hint.filter(|h| !h.is_empty())
            .or(phase_default.filter(|m| !m.is_empty()))
            .or(by_depth)
            .unwrap_or(&self.default)
            .to_string()
    }
}

/// One service request's result after retries.
struct Attempted {
    response: CompletionResponse,
    attempts: u32,
    partial: bool,
}

/// Makes logical calls against a [`CompletionClient`].
#[derive(Clone)]
pub struct CompletionCaller {
    client: Arc<dyn CompletionClient>,
    models: ModelSelector,
    retry: RetryPolicy,
    chunking: ChunkConfig,
    stall_timeout: Duration,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for CompletionCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCaller")
            .field("models", &self.models)
            .field("retry", &self.retry)
            .field("chunking", &self.chunking)
            .field("stall_timeout", &self.stall_timeout)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl CompletionCaller {
    pub fn new(client: Arc<dyn CompletionClient>, models: ModelSelector) -> Self {
        Self {
            client,
            models,
            retry: RetryPolicy::default(),
            chunking: ChunkConfig::default(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_timeouts(mut self, stall_timeout: Duration, attempt_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn models(&self) -> &ModelSelector {
        &self.models
    }

    /// Run one logical call.
    pub async fn call(
        &self,
        prompt: &Prompt,
        model_hint: Option<&str>,
        options: &CallOptions,
    ) -> Result<CallResult, CallError> {
        let started = Instant::now();
        let model = self
            .models
            .select(model_hint, options.default_model.as_deref(), options.depth);

        if self.chunking.needs_chunking(&prompt.input) {
            return self.call_chunked(prompt, &model, options, started).await;
        }

        let attempted = self
            .request_with_retry(&model, &prompt.render(), &options.cancel)
            .await?;

        Ok(CallResult {
            text: attempted.response.text,
            model: attempted.response.model,
            prompt_tokens: attempted.response.prompt_tokens,
            completion_tokens: attempted.response.completion_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
            chunked: false,
            chunk_count: 0,
            partial: attempted.partial,
            attempts: attempted.attempts,
        })
    }

    async fn call_chunked(
        &self,
        prompt: &Prompt,
        model: &str,
        options: &CallOptions,
        started: Instant,
    ) -> Result<CallResult, CallError> {
        let chunks = chunk_text(&prompt.input, &self.chunking);
        info!(
            model = %model,
            chunks = chunks.len(),
            input_chars = prompt.input.chars().count(),
            "Input exceeds chunk threshold, splitting"
        );

        let mut partials = Vec::with_capacity(chunks.len());
        let mut prompt_tokens = 0;
        let mut completion_tokens = 0;
        let mut attempts = 0;
        let mut partial = false;

        for chunk in &chunks {
            if options.cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }
            let text = prompt.render_chunk(chunk.index, chunks.len(), &chunk.text);
            let attempted = self.request_with_retry(model, &text, &options.cancel).await?;
            debug!(chunk = chunk.index, start = chunk.start, end = chunk.end, "Chunk call finished");

            prompt_tokens += attempted.response.prompt_tokens;
            completion_tokens += attempted.response.completion_tokens;
            attempts += attempted.attempts;
            partial |= attempted.partial;
            partials.push(attempted.response.text);
        }

        if options.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        let synthesis = self
            .request_with_retry(model, &prompt.render_synthesis(&partials), &options.cancel)
            .await?;

        Ok(CallResult {
            text: synthesis.response.text,
            model: synthesis.response.model,
            prompt_tokens: prompt_tokens + synthesis.response.prompt_tokens,
            completion_tokens: completion_tokens + synthesis.response.completion_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
            chunked: true,
            chunk_count: chunks.len() as u32,
            partial: partial || synthesis.partial,
            attempts: attempts + synthesis.attempts,
        })
    }

    /// Issue one service request, retrying transient failures.
    async fn request_with_retry(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Attempted, CallError> {
        let request = CompletionRequest::new(model, prompt);
        let mut attempts = 0;
        let mut salvaged: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }
            attempts += 1;

            let err = match self.attempt(&request).await {
                Ok(response) => {
                    return Ok(Attempted {
                        response,
                        attempts,
                        partial: false,
                    });
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => {
                    warn!(model = %model, attempt = attempts, error = %err, "Completion request rejected");
                    return Err(err);
                }
            };

            if let Some(text) = err.partial_text()
                && salvaged.as_ref().is_none_or(|best| text.len() > best.len())
            {
                salvaged = Some(text.to_string());
            }

            if !self.retry.has_attempts_left(attempts) {
                return self.exhausted(model, prompt, attempts, err, salvaged);
            }

            let delay = self.retry.delay_after(attempts);
            warn!(
                model = %model,
                attempt = attempts,
                max_attempts = self.retry.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Transient completion failure, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
            }
        }
    }

    fn exhausted(
        &self,
        model: &str,
        prompt: &str,
        attempts: u32,
        last: CallError,
        salvaged: Option<String>,
    ) -> Result<Attempted, CallError> {
        match salvaged {
            Some(text) if self.retry.accept_partial => {
                warn!(
                    model = %model,
                    attempts,
                    salvaged_chars = text.chars().count(),
                    "Retries exhausted, returning salvaged partial output"
                );
                Ok(Attempted {
                    response: CompletionResponse {
                        prompt_tokens: estimate_tokens(prompt),
                        completion_tokens: estimate_tokens(&text),
                        text,
                        model: model.to_string(),
                    },
                    attempts,
                    partial: true,
                })
            }
            _ => Err(CallError::RetriesExhausted {
                attempts,
                last_error: last.to_string(),
            }),
        }
    }

    /// One request under the stall watchdog and the attempt timeout.
    async fn attempt(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError> {
        let heartbeat = Heartbeat::new();
        let call = self.client.complete(request, &heartbeat);
        tokio::pin!(call);

        let deadline = tokio::time::sleep(self.attempt_timeout);
        tokio::pin!(deadline);

        loop {
            let stall_at = heartbeat.last_progress() + self.stall_timeout;
            tokio::select! {
                result = &mut call => return result,
                _ = &mut deadline => {
                    return Err(CallError::Transient {
                        reason: format!("attempt timed out after {}s", self.attempt_timeout.as_secs()),
                        partial: heartbeat.partial(),
                    });
                }
                _ = tokio::time::sleep_until(stall_at) => {
                    if heartbeat.idle_for() >= self.stall_timeout {
                        return Err(CallError::Stalled {
                            stall_secs: self.stall_timeout.as_secs(),
                            partial: heartbeat.partial(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::scripted::{ScriptedClient, ScriptedReply};

    fn caller(client: Arc<ScriptedClient>) -> CompletionCaller {
        CompletionCaller::new(client, ModelSelector::new("base-model")).with_retry(
            RetryPolicy::default()
                .with_initial_backoff(Duration::from_millis(100))
                .with_max_backoff(Duration::from_secs(5)),
        )
    }

    fn options() -> CallOptions {
        CallOptions::new(Depth::Standard, CancellationToken::new())
    }

    #[test]
    fn model_selection_precedence() {
        let mut models = ModelSelector::new("base");
        models.deep = Some("deep-model".into());

        assert_eq!(models.select(Some("hinted"), Some("phase"), Depth::Deep), "hinted");
        assert_eq!(models.select(None, Some("phase"), Depth::Deep), "phase");
        assert_eq!(models.select(None, None, Depth::Deep), "deep-model");
        assert_eq!(models.select(None, None, Depth::Surface), "base");
        assert_eq!(models.select(Some(""), None, Depth::Surface), "base");
    }

    #[test]
    fn prompt_fingerprint_is_stable() {
        let a = Prompt::new("Analyze.", "text");
        let b = Prompt::new("Analyze.", "text");
        let c = Prompt::new("Analyze.", "other");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn simple_call_returns_text_and_tokens() {
        let client = Arc::new(ScriptedClient::new().reply_when("Analyze", "analysis"));
        let result = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap();

        assert_eq!(result.text, "analysis");
        assert_eq!(result.model, "base-model");
        assert_eq!(result.attempts, 1);
        assert!(!result.chunked);
        assert!(result.prompt_tokens > 0);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_twice_then_succeeds_on_backoff_schedule() {
        let client = Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![
                ScriptedReply::transient("rate limited"),
                ScriptedReply::transient("connection reset"),
                ScriptedReply::text("third time"),
            ],
        ));
        let result = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap();

        assert_eq!(result.text, "third time");
        assert_eq!(result.attempts, 3);

        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        let gap1 = calls[1].started - calls[0].finished;
        let gap2 = calls[2].started - calls[1].finished;
        assert_eq!(gap1, Duration::from_millis(100));
        assert_eq!(gap2, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let client = Arc::new(
            ScriptedClient::new().script("Analyze", vec![ScriptedReply::permanent("bad request")]),
        );
        let err = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Permanent(_)));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_without_partial() {
        let client = Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![
                ScriptedReply::transient("a"),
                ScriptedReply::transient("b"),
                ScriptedReply::transient("c"),
                ScriptedReply::text("never reached"),
            ],
        ));
        let err = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn salvages_partial_text_after_exhaustion() {
        let client = Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![
                ScriptedReply::dropped("half an ans"),
                ScriptedReply::dropped("half an answer"),
                ScriptedReply::transient("gone"),
            ],
        ));
        let result = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.text, "half an answer");
        assert_eq!(result.attempts, 3);

        let strict = caller(Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![
                ScriptedReply::dropped("x"),
                ScriptedReply::dropped("y"),
                ScriptedReply::dropped("z"),
            ],
        )))
        .with_retry(RetryPolicy::default().with_accept_partial(false));
        let err = strict
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::RetriesExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempt_is_retried() {
        let client = Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![
                ScriptedReply::stall(Duration::from_secs(3600)),
                ScriptedReply::text("recovered"),
            ],
        ));
        let result = caller(client.clone())
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(600))
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap();
        assert_eq!(result.text, "recovered");
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_progressing_call_is_not_a_stall() {
        let client = Arc::new(ScriptedClient::new().script(
            "Analyze",
            vec![ScriptedReply::trickle("steady", 6, Duration::from_secs(5))],
        ));
        let result = caller(client.clone())
            .with_timeouts(Duration::from_secs(10), Duration::from_secs(600))
            .call(&Prompt::new("Analyze.", "doc"), None, &options())
            .await
            .unwrap();
        assert_eq!(result.text, "steady");
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_call_issues_one_synthesis() {
        let client = Arc::new(
            ScriptedClient::new()
                .reply_when("SECTION FINDINGS", "combined")
                .reply_when("=== INPUT (section", "section findings"),
        );
        let input: String = (0..400).map(|i| format!("word{} ", i)).collect();
        let result = caller(client.clone())
            .with_chunking(ChunkConfig::new(1_000, 800, 100))
            .call(&Prompt::new("Analyze.", input.as_str()), None, &options())
            .await
            .unwrap();

        let chunks = chunk_text(&input, &ChunkConfig::new(1_000, 800, 100));
        assert!(result.chunked);
        assert_eq!(result.chunk_count as usize, chunks.len());
        assert_eq!(result.text, "combined");
        assert_eq!(client.calls_matching("SECTION FINDINGS"), 1);
        assert_eq!(client.calls_matching("=== INPUT (section"), chunks.len());
        assert_eq!(client.call_count(), chunks.len() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_prevents_next_attempt() {
        let client = Arc::new(
            ScriptedClient::new().script("Analyze", vec![ScriptedReply::transient("busy")]),
        );
        let opts = options();
        let cancel = opts.cancel.clone();
        let caller = caller(client.clone());

        let handle = tokio::spawn(async move {
            caller.call(&Prompt::new("Analyze.", "doc"), None, &opts).await
        });
        // First attempt fails immediately; cancel during the backoff
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_issues_nothing() {
        let client = Arc::new(ScriptedClient::new());
        let opts = options();
        opts.cancel.cancel();
        let err = caller(client.clone())
            .call(&Prompt::new("Analyze.", "doc"), None, &opts)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(client.call_count(), 0);
    }
}
