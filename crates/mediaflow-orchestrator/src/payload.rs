use mediaflow_types::AttachedRole;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const VIDEO_EXTENSIONS: [&str; 3] = [".mp4", ".mov", ".webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
        }
    }
}

/// How a model's tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Submit a remote job and poll it to completion.
    AsyncJob {
        orientation: Orientation,
        frame_count: u32,
    },
    /// Open a server-sent-events completion and follow it to the end.
    Streaming,
}

impl ExecutionPath {
    pub fn from_model(model: &str, async_prefix: &str) -> Self {
        if async_prefix.is_empty() || !model.starts_with(async_prefix) {
            return ExecutionPath::Streaming;
        }
        let orientation = if model.contains("portrait") {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        };
        let frame_count = if model.contains("15s") { 450 } else { 300 };
        ExecutionPath::AsyncJob {
            orientation,
            frame_count,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, ExecutionPath::AsyncJob { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn infer(data_url: &str, file_name: Option<&str>) -> Self {
        if data_url.starts_with("data:video") {
            return MediaKind::Video;
        }
        let is_video_file = file_name
            .map(|name| {
                let lower = name.to_ascii_lowercase();
                VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
            })
            .unwrap_or(false);
        if is_video_file {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    fn part_key(self) -> &'static str {
        match self {
            MediaKind::Image => "image_url",
            MediaKind::Video => "video_url",
        }
    }
}

/// Prompt plus every attached role prompt, joined by single spaces.
pub fn final_prompt(prompt: &str, roles: &[AttachedRole]) -> String {
    let role_prompts = roles
        .iter()
        .map(|r| r.prompt.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    match (prompt.is_empty(), role_prompts.is_empty()) {
        (_, true) => prompt.to_string(),
        (true, false) => role_prompts,
        (false, false) => format!("{prompt} {role_prompts}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestPayload {
    pub model: String,
    pub prompt: String,
    pub content: Value,
}

impl RequestPayload {
    pub fn build(
        model: &str,
        prompt: &str,
        roles: &[AttachedRole],
        attachment: Option<(&str, Option<&str>)>,
    ) -> Self {
        let prompt_text = final_prompt(prompt, roles);
        let mut parts = Vec::new();
        if !prompt_text.is_empty() {
            parts.push(json!({"type": "text", "text": prompt_text}));
        }
        if let Some((data_url, file_name)) = attachment {
            let key = MediaKind::infer(data_url, file_name).part_key();
            parts.push(json!({"type": key, key: {"url": data_url}}));
        }
        let content = if parts.is_empty() {
            Value::String(prompt.to_string())
        } else {
            Value::Array(parts)
        };
        Self {
            model: model.to_string(),
            prompt: prompt_text,
            content,
        }
    }

    /// Body of a streaming chat-completions request.
    pub fn to_stream_body(&self) -> Value {
        json!({
            "model": self.model,
            "stream": true,
            "messages": [{"role": "user", "content": self.content}],
        })
    }
}
