use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use mediaflow_types::PendingJob;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

mod download;
mod http;
mod sse;

pub use download::{download_to_file, BROWSER_USER_AGENT};
pub use http::HttpGenerationClient;
pub use sse::{drain_sse_frames, SseFrame};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Message(Value),
    Done { finish_reason: String },
}

pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamFrame>> + Send>>;

/// The remote media-generation service.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Submits an async video job and returns the raw creation response.
    async fn create_job(
        &self,
        bearer: &str,
        prompt: &str,
        orientation: &str,
        frame_count: u32,
    ) -> anyhow::Result<Value>;

    /// Jobs still pending for this bearer. An empty list means nothing is
    /// left in flight.
    async fn poll_pending(&self, bearer: &str) -> anyhow::Result<Vec<PendingJob>>;

    /// Finished, retrievable results (drafts) for this bearer.
    async fn fetch_retrievable_results(&self, bearer: &str) -> anyhow::Result<Value>;

    async fn stream_completion(
        &self,
        bearer: Option<&str>,
        body: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<FrameStream>;
}

/// Remote job id from a creation response (`id`, falling back to `task_id`).
pub fn extract_job_id(value: &Value) -> Option<String> {
    ["id", "task_id"].iter().find_map(|key| {
        value.get(*key).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    })
}

/// Normalizes the pending endpoint's two response shapes: a bare array or
/// an object with a `tasks` array.
pub fn parse_pending(value: &Value) -> Vec<PendingJob> {
    let entries = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("tasks")
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };
    entries.iter().map(PendingJob::from_value).collect()
}

pub(crate) fn normalize_plain_base(input: &str) -> String {
    input.trim().trim_end_matches('/').to_string()
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}
