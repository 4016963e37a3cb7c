use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CredentialId;

/// A bearer token handed out by the credential provider, with the id that
/// must stay pinned to the job for the lifetime of its polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialGrant {
    #[serde(rename = "token_id")]
    pub credential_id: CredentialId,
    #[serde(rename = "bearer_token")]
    pub bearer: String,
}

/// A persisted remote job whose recorded progress is below 100.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncompleteJob {
    #[serde(rename = "task_id", default)]
    pub remote_job_id: Option<String>,
    #[serde(rename = "token_id", default)]
    pub credential_id: Option<CredentialId>,
}

/// One entry of the remote pending queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Either a 0..=1 fraction or a 0..=100 percentage, depending on the upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f64>,
}

impl PendingJob {
    pub fn from_value(value: &Value) -> Self {
        Self {
            id: value
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            progress_pct: value.get("progress_pct").and_then(|v| v.as_f64()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistenceCapabilities {
    /// The persistence layer owns the canonical task list.
    pub task_list: bool,
}
