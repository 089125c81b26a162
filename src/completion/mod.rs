//! Calls to the external completion service.
//!
//! - [`client`]: the `CompletionClient` seam and the streaming HTTP client
//! - [`caller`]: model selection, chunking, retry, stall detection
//! - [`chunking`]: overlapping input windows
//! - [`retry`]: backoff schedule
//! - [`scripted`]: deterministic client for dry runs and tests

pub mod caller;
pub mod chunking;
pub mod client;
pub mod retry;
pub mod scripted;

pub use caller::{CallOptions, CallResult, CompletionCaller, ModelSelector, Prompt};
pub use chunking::{Chunk, ChunkConfig, chunk_text};
pub use client::{CompletionClient, CompletionRequest, CompletionResponse, Heartbeat, HttpCompletionClient};
pub use retry::RetryPolicy;
pub use scripted::{ScriptedClient, ScriptedReply};
