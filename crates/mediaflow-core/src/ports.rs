use async_trait::async_trait;
use mediaflow_types::{CredentialGrant, CredentialId, IncompleteJob, PersistenceCapabilities, Task};
use serde_json::Value;

/// Durable record of tasks and remote jobs, owned by the host.
#[async_trait]
pub trait Persistence: Send + Sync {
    fn capabilities(&self) -> PersistenceCapabilities;

    /// `None` when nothing has been stored yet.
    async fn get_task_list(&self) -> anyhow::Result<Option<Vec<Task>>>;

    async fn set_task_list(&self, tasks: &[Task]) -> anyhow::Result<()>;

    async fn get_incomplete_remote_jobs(&self) -> anyhow::Result<Vec<IncompleteJob>>;

    async fn record_job_creation(
        &self,
        credential_id: CredentialId,
        raw: &Value,
        prompt: &str,
    ) -> anyhow::Result<()>;

    async fn update_job_progress(&self, remote_job_id: &str, progress: f64) -> anyhow::Result<()>;

    async fn save_results_and_download(
        &self,
        results: &Value,
        remote_job_id: &str,
    ) -> anyhow::Result<()>;
}

/// Issues bearer tokens for remote jobs.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn pick_random_credential(&self) -> anyhow::Result<CredentialGrant>;

    async fn bearer_for(&self, credential_id: CredentialId) -> anyhow::Result<Option<String>>;

    async fn credential_id_for_remote_job(
        &self,
        remote_job_id: &str,
    ) -> anyhow::Result<Option<CredentialId>>;
}
