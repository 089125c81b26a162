//! A deterministic, scripted completion client.
//!
//! Used by `dossier run --dry-run` to exercise a plan without a service, and
//! by tests to drive retries, stalls, delays and concurrency. Every request
//! is recorded with its start and finish instants on the tokio clock.

use crate::completion::client::{
    CompletionClient, CompletionRequest, CompletionResponse, Heartbeat, estimate_tokens,
};
use crate::errors::CallError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted behaviour for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    /// Fail transiently with no output
    Transient(String),
    /// Stream some text, then drop the connection
    Dropped(String),
    Permanent(String),
    /// Hang without progress for the given time
    Stall(Duration),
    /// Stream `text` in `pieces` parts, one every `interval`
    Trickle {
        text: String,
        pieces: usize,
        interval: Duration,
    },
}

impl ScriptedReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn transient(reason: &str) -> Self {
        Self::Transient(reason.to_string())
    }

    pub fn dropped(partial: &str) -> Self {
        Self::Dropped(partial.to_string())
    }

    pub fn permanent(reason: &str) -> Self {
        Self::Permanent(reason.to_string())
    }

    pub fn stall(duration: Duration) -> Self {
        Self::Stall(duration)
    }

    pub fn trickle(text: &str, pieces: usize, interval: Duration) -> Self {
        Self::Trickle {
            text: text.to_string(),
            pieces: pieces.max(1),
            interval,
        }
    }
}

/// A finished (or abandoned) request.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub model: String,
    pub prompt: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug)]
struct Rule {
    marker: String,
    queue: VecDeque<ScriptedReply>,
    fallback: Option<ScriptedReply>,
}

/// Completion client that answers from a script.
///
/// Requests are matched against rules by substring, in registration order.
/// Unmatched requests get a deterministic reply derived from the prompt.
#[derive(Debug)]
pub struct ScriptedClient {
    prefix: String,
    rules: Mutex<Vec<Rule>>,
    delays: Vec<(String, Duration)>,
    default_delay: Duration,
    records: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            prefix: "response".to_string(),
            rules: Mutex::new(Vec::new()),
            delays: Vec::new(),
            default_delay: Duration::ZERO,
            records: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Prefix of the generated default replies.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Delay every request by `delay` unless a marker delay applies.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_delay_for(mut self, marker: &str, delay: Duration) -> Self {
        self.delays.push((marker.to_string(), delay));
        self
    }

    /// Always answer prompts containing `marker` with `text`.
    pub fn reply_when(self, marker: &str, text: &str) -> Self {
        self.push_rule(marker, VecDeque::new(), Some(ScriptedReply::text(text)))
    }

    /// Answer prompts containing `marker` with `replies`, in order.
    pub fn script(self, marker: &str, replies: Vec<ScriptedReply>) -> Self {
        self.push_rule(marker, replies.into(), None)
    }

    fn push_rule(self, marker: &str, queue: VecDeque<ScriptedReply>, fallback: Option<ScriptedReply>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                marker: marker.to_string(),
                queue,
                fallback,
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn calls_matching(&self, marker: &str) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|c| c.prompt.contains(marker)).count())
            .unwrap_or(0)
    }

    /// Highest number of requests in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping requests whose prompt contains `marker`.
    pub fn max_overlap(&self, marker: &str) -> usize {
        let records: Vec<CallRecord> = self
            .calls()
            .into_iter()
            .filter(|c| c.prompt.contains(marker))
            .collect();
        records
            .iter()
            .map(|r| {
                records
                    .iter()
                    .filter(|o| o.started <= r.started && r.started < o.finished)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    fn next_reply(&self, prompt: &str) -> ScriptedReply {
        if let Ok(mut rules) = self.rules.lock() {
            for rule in rules.iter_mut().filter(|r| prompt.contains(&r.marker)) {
                if let Some(reply) = rule.queue.pop_front() {
                    return reply;
                }
                if let Some(reply) = &rule.fallback {
                    return reply.clone();
                }
            }
        }
        let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
        ScriptedReply::Text(format!("{} {}", self.prefix, &digest[..12]))
    }

    fn delay_for(&self, prompt: &str) -> Duration {
        self.delays
            .iter()
            .find(|(marker, _)| prompt.contains(marker))
            .map(|(_, d)| *d)
            .unwrap_or(self.default_delay)
    }
}

/// Records the request when it finishes or is abandoned.
struct CallGuard<'a> {
    client: &'a ScriptedClient,
    request: &'a CompletionRequest,
    started: Instant,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.client.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut records) = self.client.records.lock() {
            records.push(CallRecord {
                model: self.request.model.clone(),
                prompt: self.request.prompt.clone(),
                started: self.started,
                finished: Instant::now(),
            });
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        heartbeat: &Heartbeat,
    ) -> Result<CompletionResponse, CallError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = CallGuard {
            client: self,
            request,
            started: Instant::now(),
        };

        let reply = self.next_reply(&request.prompt);
        let delay = self.delay_for(&request.prompt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            heartbeat.beat();
        }

        let text = match reply {
            ScriptedReply::Text(text) => text,
            ScriptedReply::Transient(reason) => {
                return Err(CallError::Transient {
                    reason,
                    partial: None,
                });
            }
            ScriptedReply::Dropped(partial) => {
                heartbeat.push_text(&partial);
                return Err(CallError::Transient {
                    reason: "connection dropped mid-response".to_string(),
                    partial: Some(partial),
                });
            }
            ScriptedReply::Permanent(reason) => return Err(CallError::Permanent(reason)),
            ScriptedReply::Stall(duration) => {
                tokio::time::sleep(duration).await;
                return Err(CallError::Transient {
                    reason: "stalled reply ended".to_string(),
                    partial: None,
                });
            }
            ScriptedReply::Trickle {
                text,
                pieces,
                interval,
            } => {
                let chars: Vec<char> = text.chars().collect();
                let per_piece = chars.len().div_ceil(pieces).max(1);
                for piece in chars.chunks(per_piece) {
                    tokio::time::sleep(interval).await;
                    heartbeat.push_text(&piece.iter().collect::<String>());
                }
                text
            }
        };

        Ok(CompletionResponse {
            prompt_tokens: estimate_tokens(&request.prompt),
            completion_tokens: estimate_tokens(&text),
            text,
            model: request.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ask(client: &ScriptedClient, prompt: &str) -> Result<CompletionResponse, CallError> {
        client
            .complete(&CompletionRequest::new("m", prompt), &Heartbeat::new())
            .await
    }

    #[tokio::test]
    async fn default_replies_are_deterministic() {
        let client = ScriptedClient::new();
        let a = ask(&client, "same prompt").await.unwrap();
        let b = ask(&client, "same prompt").await.unwrap();
        let c = ask(&client, "other prompt").await.unwrap();
        assert_eq!(a.text, b.text);
        assert_ne!(a.text, c.text);
        assert!(a.text.starts_with("response "));
    }

    #[tokio::test]
    async fn scripted_replies_are_consumed_then_fall_through() {
        let client = ScriptedClient::new()
            .script("alpha", vec![ScriptedReply::transient("busy")])
            .reply_when("alpha", "steady");

        assert!(ask(&client, "alpha one").await.is_err());
        assert_eq!(ask(&client, "alpha two").await.unwrap().text, "steady");
        assert_eq!(client.calls_matching("alpha"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn records_overlap_of_concurrent_requests() {
        let client = std::sync::Arc::new(ScriptedClient::new().with_delay(Duration::from_millis(100)));
        let mut handles = Vec::new();
        for i in 0..3 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                ask(&client, &format!("item {}", i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(client.peak_in_flight(), 3);
        assert_eq!(client.max_overlap("item"), 3);
        assert_eq!(client.call_count(), 3);
    }
}
