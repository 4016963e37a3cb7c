use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a credential row owned by the credential provider.
pub type CredentialId = i64;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation request. Field names serialize in camelCase so a persisted
/// list stays readable by the desktop front end that shares the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id_for_pending: Option<CredentialId>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wm_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wm_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub created_at: i64,
}

impl Task {
    pub fn new(draft: TaskDraft) -> Self {
        let attachment = draft.attachment.unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: draft.model,
            prompt: draft.prompt,
            status: TaskStatus::Queued,
            progress: 0.0,
            remote_task_id: None,
            token_id_for_pending: None,
            message: String::new(),
            url: None,
            result: None,
            wm_stage: None,
            wm_attempt: None,
            local_path: None,
            file_name: attachment.file_name,
            file_data_url: attachment.data_url,
            file_path: attachment.path,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_attachment(&self) -> bool {
        self.file_data_url.is_some() || self.file_path.is_some()
    }
}

/// Media attached to a task, either already encoded as a data URL or as a
/// local file that is read at submission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDraft {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub attachment: Option<MediaAttachment>,
}

impl TaskDraft {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: MediaAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Caller-facing partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub attachment: Option<MediaAttachment>,
}

impl TaskPatch {
    pub fn apply_to(&self, task: &mut Task) -> bool {
        let mut changed = false;
        if let Some(model) = &self.model {
            task.model = model.clone();
            changed = true;
        }
        if let Some(prompt) = &self.prompt {
            task.prompt = prompt.clone();
            changed = true;
        }
        if let Some(message) = &self.message {
            task.message = message.clone();
            changed = true;
        }
        if let Some(local_path) = &self.local_path {
            task.local_path = Some(local_path.clone());
            changed = true;
        }
        if let Some(attachment) = &self.attachment {
            task.file_name = attachment.file_name.clone();
            task.file_data_url = attachment.data_url.clone();
            task.file_path = attachment.path.clone();
            changed = true;
        }
        changed
    }
}

/// Named prompt fragment merged into every submitted prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachedRole {
    pub name: String,
    pub prompt: String,
}
