use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use mediaflow_types::PendingJob;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::sse::{drain_sse_frames, SseFrame};
use crate::{
    normalize_plain_base, parse_pending, truncate_for_error, FrameStream, GenerationApi,
    StreamFrame,
};

const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const DRAFTS_PAGE_SIZE: u32 = 20;
const VIDEO_SIZE: &str = "small";
const VIDEO_MODEL: &str = "sy_8";

/// reqwest-backed client for one upstream base URL.
#[derive(Clone)]
pub struct HttpGenerationClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: normalize_plain_base(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json(&self, path: &str, body: Value, timeout: Duration) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "posting generation request");
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() >= 400 {
            anyhow::bail!("HTTP {}: {}", status.as_u16(), truncate_for_error(&text, 500));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl GenerationApi for HttpGenerationClient {
    async fn create_job(
        &self,
        bearer: &str,
        prompt: &str,
        orientation: &str,
        frame_count: u32,
    ) -> anyhow::Result<Value> {
        let body = json!({
            "bearer_token": bearer,
            "prompt": prompt,
            "orientation": orientation,
            "size": VIDEO_SIZE,
            "n_frames": frame_count,
            "model": VIDEO_MODEL,
        });
        self.post_json("/videos", body, CREATE_TIMEOUT).await
    }

    async fn poll_pending(&self, bearer: &str) -> anyhow::Result<Vec<PendingJob>> {
        let value = self
            .post_json("/pending", json!({ "bearer_token": bearer }), QUERY_TIMEOUT)
            .await?;
        Ok(parse_pending(&value))
    }

    async fn fetch_retrievable_results(&self, bearer: &str) -> anyhow::Result<Value> {
        let body = json!({
            "bearer_token": bearer,
            "limit": DRAFTS_PAGE_SIZE,
            "offset": 0,
        });
        self.post_json("/drafts", body, QUERY_TIMEOUT).await
    }

    async fn stream_completion(
        &self,
        bearer: Option<&str>,
        body: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<FrameStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(url)
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(token) = bearer.or(self.api_key.as_deref()) {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamFrame::Done {
                        finish_reason: "cancelled".to_string(),
                    };
                    finished = true;
                    break;
                }

                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);

                for frame in drain_sse_frames(&mut buffer) {
                    match frame {
                        SseFrame::Data(value) => {
                            yield StreamFrame::Message(value);
                        }
                        SseFrame::Done => {
                            yield StreamFrame::Done {
                                finish_reason: "stop".to_string(),
                            };
                            finished = true;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            if !finished {
                yield StreamFrame::Done {
                    finish_reason: "eof".to_string(),
                };
            }
        };
        Ok(Box::pin(stream))
    }
}
