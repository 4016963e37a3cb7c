use async_trait::async_trait;
use mediaflow_core::{CredentialProvider, Persistence};
use mediaflow_types::{CredentialGrant, CredentialId, IncompleteJob, PersistenceCapabilities, Task};
use serde_json::Value;

use crate::db::SqliteStore;

#[async_trait]
impl Persistence for SqliteStore {
    fn capabilities(&self) -> PersistenceCapabilities {
        PersistenceCapabilities { task_list: true }
    }

    async fn get_task_list(&self) -> anyhow::Result<Option<Vec<Task>>> {
        Ok(self.load_tasks().await?)
    }

    async fn set_task_list(&self, tasks: &[Task]) -> anyhow::Result<()> {
        Ok(self.save_tasks(tasks).await?)
    }

    async fn get_incomplete_remote_jobs(&self) -> anyhow::Result<Vec<IncompleteJob>> {
        let jobs = self.incomplete_jobs().await?;
        tracing::info!(count = jobs.len(), "loaded incomplete remote jobs");
        Ok(jobs)
    }

    async fn record_job_creation(
        &self,
        credential_id: CredentialId,
        raw: &Value,
        prompt: &str,
    ) -> anyhow::Result<()> {
        self.record_job(credential_id, raw, prompt).await?;
        Ok(())
    }

    async fn update_job_progress(&self, remote_job_id: &str, progress: f64) -> anyhow::Result<()> {
        Ok(self.set_job_progress(remote_job_id, progress).await?)
    }

    async fn save_results_and_download(
        &self,
        results: &Value,
        remote_job_id: &str,
    ) -> anyhow::Result<()> {
        self.download_result(results, remote_job_id).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for SqliteStore {
    async fn pick_random_credential(&self) -> anyhow::Result<CredentialGrant> {
        Ok(self.pick_credential().await?)
    }

    async fn bearer_for(&self, credential_id: CredentialId) -> anyhow::Result<Option<String>> {
        Ok(self.bearer_by_id(credential_id).await?)
    }

    async fn credential_id_for_remote_job(
        &self,
        remote_job_id: &str,
    ) -> anyhow::Result<Option<CredentialId>> {
        Ok(self.credential_for_job(remote_job_id).await?)
    }
}
