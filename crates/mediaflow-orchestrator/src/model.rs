use mediaflow_types::CredentialId;
use serde::{Deserialize, Serialize};

/// Everything that can happen to a task. Runners and pollers never mutate a
/// task directly; they emit one of these and let the reducer produce the
/// next state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started,
    Submitted {
        remote_task_id: String,
        credential_id: Option<CredentialId>,
        message: String,
    },
    CredentialPinned {
        credential_id: CredentialId,
    },
    Progress {
        percent: f64,
    },
    WatermarkStage {
        stage: Option<String>,
        attempt: Option<u32>,
        remote_task_id: Option<String>,
    },
    StreamResult {
        url: String,
        raw: String,
    },
    StreamFinished,
    Completed {
        message: String,
    },
    Failed {
        message: String,
    },
    Cancelled {
        message: String,
    },
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Started => "started",
            TaskEvent::Submitted { .. } => "submitted",
            TaskEvent::CredentialPinned { .. } => "credential_pinned",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::WatermarkStage { .. } => "watermark_stage",
            TaskEvent::StreamResult { .. } => "stream_result",
            TaskEvent::StreamFinished => "stream_finished",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Failed { .. } => "failed",
            TaskEvent::Cancelled { .. } => "cancelled",
        }
    }
}
