use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mediaflow_core::{CredentialProvider, EngineConfig, Persistence};
use mediaflow_providers::{FrameStream, GenerationApi, StreamFrame};
use mediaflow_types::{
    CredentialGrant, CredentialId, IncompleteJob, PendingJob, PersistenceCapabilities, Task,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub fn test_config(state_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 20,
        state_dir: state_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

pub fn pending(progress: f64) -> Vec<PendingJob> {
    vec![PendingJob {
        id: Some("task_x".to_string()),
        progress_pct: Some(progress),
    }]
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Remote generation API
// ============================================================================

pub enum StreamScript {
    Frames(Vec<Result<StreamFrame, String>>),
    Hang,
    OpenError(String),
}

pub struct FakeApi {
    create_response: Mutex<Result<Value, String>>,
    pending_script: Mutex<VecDeque<Result<Vec<PendingJob>, String>>>,
    pending_default: Mutex<Result<Vec<PendingJob>, String>>,
    stream_script: Mutex<Option<StreamScript>>,
    pub create_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub created: Mutex<Vec<(String, String, String, u32)>>,
    pub polled_bearers: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            create_response: Mutex::new(Ok(json!({"id": "task_remote_1"}))),
            pending_script: Mutex::new(VecDeque::new()),
            pending_default: Mutex::new(Ok(Vec::new())),
            stream_script: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            polled_bearers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_create_response(&self, response: Result<Value, String>) {
        *self.create_response.lock().unwrap() = response;
    }

    pub fn push_pending(&self, response: Result<Vec<PendingJob>, String>) {
        self.pending_script.lock().unwrap().push_back(response);
    }

    /// Response once the scripted queue is exhausted.
    pub fn set_pending_default(&self, response: Result<Vec<PendingJob>, String>) {
        *self.pending_default.lock().unwrap() = response;
    }

    pub fn set_stream(&self, script: StreamScript) {
        *self.stream_script.lock().unwrap() = Some(script);
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationApi for FakeApi {
    async fn create_job(
        &self,
        bearer: &str,
        prompt: &str,
        orientation: &str,
        frame_count: u32,
    ) -> anyhow::Result<Value> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push((
            bearer.to_string(),
            prompt.to_string(),
            orientation.to_string(),
            frame_count,
        ));
        self.create_response
            .lock()
            .unwrap()
            .clone()
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn poll_pending(&self, bearer: &str) -> anyhow::Result<Vec<PendingJob>> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polled_bearers.lock().unwrap().push(bearer.to_string());
        let next = self.pending_script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.pending_default.lock().unwrap().clone())
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn fetch_retrievable_results(&self, _bearer: &str) -> anyhow::Result<Value> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"items": [{"task_id": "task_remote_1", "generation_id": "gen_1"}]}))
    }

    async fn stream_completion(
        &self,
        _bearer: Option<&str>,
        _body: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<FrameStream> {
        let script = self.stream_script.lock().unwrap().take();
        match script {
            Some(StreamScript::Frames(frames)) => Ok(Box::pin(futures::stream::iter(
                frames
                    .into_iter()
                    .map(|f| f.map_err(|e| anyhow::anyhow!(e)))
                    .collect::<Vec<_>>(),
            ))),
            Some(StreamScript::Hang) => Ok(Box::pin(futures::stream::pending::<anyhow::Result<StreamFrame>>())),
            Some(StreamScript::OpenError(err)) => Err(anyhow::anyhow!(err)),
            None => Ok(Box::pin(futures::stream::empty::<anyhow::Result<StreamFrame>>())),
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Default)]
pub struct FakePersistence {
    pub owns_task_list: bool,
    pub task_list: Mutex<Option<Vec<Task>>>,
    pub incomplete: Mutex<Vec<IncompleteJob>>,
    pub creations: Mutex<Vec<(CredentialId, Value, String)>>,
    pub progress: Mutex<Vec<(String, f64)>>,
    pub saved_results: Mutex<Vec<String>>,
}

impl FakePersistence {
    pub fn new(owns_task_list: bool) -> Arc<Self> {
        Arc::new(Self {
            owns_task_list,
            ..Self::default()
        })
    }

    pub fn add_incomplete(&self, remote_job_id: Option<&str>, credential_id: Option<CredentialId>) {
        self.incomplete.lock().unwrap().push(IncompleteJob {
            remote_job_id: remote_job_id.map(str::to_string),
            credential_id,
        });
    }

    pub fn progress_for(&self, remote_job_id: &str) -> Vec<f64> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == remote_job_id)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl Persistence for FakePersistence {
    fn capabilities(&self) -> PersistenceCapabilities {
        PersistenceCapabilities {
            task_list: self.owns_task_list,
        }
    }

    async fn get_task_list(&self) -> anyhow::Result<Option<Vec<Task>>> {
        Ok(self.task_list.lock().unwrap().clone())
    }

    async fn set_task_list(&self, tasks: &[Task]) -> anyhow::Result<()> {
        *self.task_list.lock().unwrap() = Some(tasks.to_vec());
        Ok(())
    }

    async fn get_incomplete_remote_jobs(&self) -> anyhow::Result<Vec<IncompleteJob>> {
        Ok(self.incomplete.lock().unwrap().clone())
    }

    async fn record_job_creation(
        &self,
        credential_id: CredentialId,
        raw: &Value,
        prompt: &str,
    ) -> anyhow::Result<()> {
        self.creations
            .lock()
            .unwrap()
            .push((credential_id, raw.clone(), prompt.to_string()));
        Ok(())
    }

    async fn update_job_progress(&self, remote_job_id: &str, progress: f64) -> anyhow::Result<()> {
        self.progress
            .lock()
            .unwrap()
            .push((remote_job_id.to_string(), progress));
        Ok(())
    }

    async fn save_results_and_download(
        &self,
        _results: &Value,
        remote_job_id: &str,
    ) -> anyhow::Result<()> {
        self.saved_results
            .lock()
            .unwrap()
            .push(remote_job_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Default)]
pub struct FakeCredentials {
    pub pick: Mutex<Option<CredentialGrant>>,
    pub bearers: Mutex<HashMap<CredentialId, String>>,
    pub by_remote: Mutex<HashMap<String, CredentialId>>,
}

impl FakeCredentials {
    /// One usable credential, id 7.
    pub fn single() -> Arc<Self> {
        let creds = Self::default();
        creds.add(7, "bearer-7");
        *creds.pick.lock().unwrap() = Some(CredentialGrant {
            credential_id: 7,
            bearer: "bearer-7".to_string(),
        });
        Arc::new(creds)
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: CredentialId, bearer: &str) {
        self.bearers.lock().unwrap().insert(id, bearer.to_string());
    }

    pub fn link_remote(&self, remote_job_id: &str, id: CredentialId) {
        self.by_remote
            .lock()
            .unwrap()
            .insert(remote_job_id.to_string(), id);
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn pick_random_credential(&self) -> anyhow::Result<CredentialGrant> {
        self.pick
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no usable credential"))
    }

    async fn bearer_for(&self, credential_id: CredentialId) -> anyhow::Result<Option<String>> {
        Ok(self.bearers.lock().unwrap().get(&credential_id).cloned())
    }

    async fn credential_id_for_remote_job(
        &self,
        remote_job_id: &str,
    ) -> anyhow::Result<Option<CredentialId>> {
        Ok(self.by_remote.lock().unwrap().get(remote_job_id).copied())
    }
}
