use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Dedup key of a poller: the local task it updates, or the remote job for
/// orphans recovered without a local task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollKey {
    Task(String),
    Remote(String),
}

impl fmt::Display for PollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollKey::Task(id) => f.write_str(id),
            PollKey::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerHandle {
    pub generation: u64,
    pub remote_job_id: String,
    pub cancel: CancellationToken,
    pub started_at_ms: i64,
}

/// Active pollers. At most one entry per key; a finishing poller removes
/// only the entry carrying its own generation.
#[derive(Clone, Default)]
pub struct PollerRegistry {
    active: Arc<RwLock<HashMap<PollKey, PollerHandle>>>,
    next_generation: Arc<AtomicU64>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        key: PollKey,
        remote_job_id: &str,
    ) -> std::result::Result<PollerHandle, PollerHandle> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(&key).cloned() {
            return Err(existing);
        }
        let handle = PollerHandle {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst) + 1,
            remote_job_id: remote_job_id.to_string(),
            cancel: CancellationToken::new(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        guard.insert(key, handle.clone());
        Ok(handle)
    }

    pub async fn finish_if_match(&self, key: &PollKey, generation: u64) -> Option<PollerHandle> {
        let mut guard = self.active.write().await;
        if guard.get(key).map(|h| h.generation) == Some(generation) {
            return guard.remove(key);
        }
        None
    }

    /// Cancels and removes the poller under `key`, if any.
    pub async fn stop(&self, key: &PollKey) -> Option<PollerHandle> {
        let removed = self.active.write().await.remove(key);
        if let Some(handle) = &removed {
            handle.cancel.cancel();
        }
        removed
    }

    pub async fn stop_all(&self) -> usize {
        let drained = self.active.write().await.drain().collect::<Vec<_>>();
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }

    pub async fn contains(&self, key: &PollKey) -> bool {
        self.active.read().await.contains_key(key)
    }

    /// True when any poller, local or orphan, already tracks this remote job.
    pub async fn covers_remote(&self, remote_job_id: &str) -> bool {
        self.active
            .read()
            .await
            .values()
            .any(|h| h.remote_job_id == remote_job_id)
    }

    pub async fn keys(&self) -> Vec<PollKey> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.active.read().await.is_empty()
    }
}

/// Cancellation tokens of in-flight streaming requests, by task id.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a stream for this task is already in flight.
    pub async fn register(&self, task_id: &str) -> Option<CancellationToken> {
        let mut guard = self.active.lock().await;
        if guard.contains_key(task_id) {
            return None;
        }
        let token = CancellationToken::new();
        guard.insert(task_id.to_string(), token.clone());
        Some(token)
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.active.lock().await.remove(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn finish(&self, task_id: &str) {
        self.active.lock().await.remove(task_id);
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    pub async fn is_empty(&self) -> bool {
        self.active.lock().await.is_empty()
    }

    pub async fn cancel_all(&self) {
        for (_, token) in self.active.lock().await.drain() {
            token.cancel();
        }
    }
}
