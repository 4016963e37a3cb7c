// Task Store
// In-memory task list with a bounded, fire-and-forget persisted mirror

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mediaflow_orchestrator::{reduce, TaskEvent};
use mediaflow_types::{Task, TaskPatch};
use tokio::sync::{watch, RwLock};

use crate::ports::Persistence;

// ============================================================================
// Mirror backends
// ============================================================================

/// JSON file holding the task list, used when no persistence layer owns it.
#[derive(Debug, Clone)]
pub struct LocalTaskFile {
    path: PathBuf,
}

impl LocalTaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<Vec<Task>>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, tasks: &[Task]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(tasks)?;
        atomic_write(&self.path, &content).await
    }
}

async fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, content).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Where the bounded task list is written. Chosen once at construction.
pub enum TaskMirror {
    Persistence(Arc<dyn Persistence>),
    LocalFile(LocalTaskFile),
    Memory,
}

impl TaskMirror {
    /// Prefers a persistence layer that owns the task list, then the local
    /// file, then nothing.
    pub fn select(persistence: Option<Arc<dyn Persistence>>, local: Option<LocalTaskFile>) -> Self {
        match persistence {
            Some(persistence) if persistence.capabilities().task_list => {
                TaskMirror::Persistence(persistence)
            }
            _ => local.map(TaskMirror::LocalFile).unwrap_or(TaskMirror::Memory),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskMirror::Persistence(_) => "persistence",
            TaskMirror::LocalFile(_) => "local_file",
            TaskMirror::Memory => "memory",
        }
    }

    async fn load(&self) -> anyhow::Result<Option<Vec<Task>>> {
        match self {
            TaskMirror::Persistence(p) => p.get_task_list().await,
            TaskMirror::LocalFile(file) => file.load().await,
            TaskMirror::Memory => Ok(None),
        }
    }

    async fn save(&self, tasks: &[Task]) -> anyhow::Result<()> {
        match self {
            TaskMirror::Persistence(p) => p.set_task_list(tasks).await,
            TaskMirror::LocalFile(file) => file.save(tasks).await,
            TaskMirror::Memory => Ok(()),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone, Default)]
struct Snapshot {
    revision: u64,
    tasks: Arc<Vec<Task>>,
}

struct StoreInner {
    tasks: RwLock<Vec<Task>>,
    cap: usize,
    mirror: Arc<TaskMirror>,
    revision: AtomicU64,
    snapshots: watch::Sender<Snapshot>,
    persisted: watch::Receiver<u64>,
}

/// Ordered task list, most recent first. Every mutation queues a snapshot
/// of the first `cap` tasks for the mirror; the in-memory change never
/// waits on, or fails because of, the write.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    /// Must be called inside a tokio runtime; spawns the mirror writer.
    pub fn new(mirror: TaskMirror, cap: usize) -> Self {
        let mirror = Arc::new(mirror);
        let (snapshots, snapshot_rx) = watch::channel(Snapshot::default());
        let (persisted_tx, persisted) = watch::channel(0u64);
        tokio::spawn(run_mirror_writer(mirror.clone(), snapshot_rx, persisted_tx));
        Self {
            inner: Arc::new(StoreInner {
                tasks: RwLock::new(Vec::new()),
                cap: cap.max(1),
                mirror,
                revision: AtomicU64::new(0),
                snapshots,
                persisted,
            }),
        }
    }

    pub fn mirror_kind(&self) -> &'static str {
        self.inner.mirror.kind()
    }

    /// Replaces the in-memory list with whatever the mirror holds. Returns
    /// the number of tasks loaded, or `None` if the mirror had nothing.
    pub async fn hydrate(&self) -> Option<usize> {
        match self.inner.mirror.load().await {
            Ok(Some(tasks)) => {
                let count = tasks.len();
                *self.inner.tasks.write().await = tasks;
                Some(count)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(mirror = self.mirror_kind(), "task list load failed: {}", err);
                None
            }
        }
    }

    pub async fn list(&self) -> Vec<Task> {
        self.inner.tasks.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.tasks.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn find_by_remote(&self, remote_task_id: &str) -> Option<Task> {
        self.inner
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.remote_task_id.as_deref() == Some(remote_task_id))
            .cloned()
    }

    pub async fn add(&self, task: Task) -> Task {
        let mut tasks = self.inner.tasks.write().await;
        tasks.insert(0, task.clone());
        self.commit(&tasks);
        task
    }

    pub async fn update(&self, id: &str, patch: &TaskPatch) -> Option<Task> {
        let mut tasks = self.inner.tasks.write().await;
        let task = tasks.iter_mut().find(|t| t.id == id)?;
        let changed = patch.apply_to(task);
        let updated = task.clone();
        if changed {
            self.commit(&tasks);
        }
        Some(updated)
    }

    /// Runs `event` through the reducer and stores the result atomically.
    pub async fn apply(&self, id: &str, event: TaskEvent) -> Option<Task> {
        let mut tasks = self.inner.tasks.write().await;
        let slot = tasks.iter_mut().find(|t| t.id == id)?;
        let reduction = reduce(slot, event);
        if !reduction.changed {
            return Some(reduction.task);
        }
        *slot = reduction.task.clone();
        self.commit(&tasks);
        Some(reduction.task)
    }

    pub async fn remove(&self, id: &str) -> Option<Task> {
        let mut tasks = self.inner.tasks.write().await;
        let index = tasks.iter().position(|t| t.id == id)?;
        let removed = tasks.remove(index);
        self.commit(&tasks);
        Some(removed)
    }

    pub async fn clear(&self) {
        let mut tasks = self.inner.tasks.write().await;
        tasks.clear();
        self.commit(&tasks);
    }

    /// Waits until every mutation made so far has been handed to the mirror.
    pub async fn flush(&self) {
        let target = self.inner.revision.load(Ordering::SeqCst);
        let mut persisted = self.inner.persisted.clone();
        let _ = persisted.wait_for(|revision| *revision >= target).await;
    }

    // Called with the write lock held so snapshots leave in mutation order.
    fn commit(&self, tasks: &[Task]) {
        let revision = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let bounded = tasks.iter().take(self.inner.cap).cloned().collect::<Vec<_>>();
        self.inner.snapshots.send_replace(Snapshot {
            revision,
            tasks: Arc::new(bounded),
        });
    }
}

async fn run_mirror_writer(
    mirror: Arc<TaskMirror>,
    mut snapshots: watch::Receiver<Snapshot>,
    persisted: watch::Sender<u64>,
) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(err) = mirror.save(&snapshot.tasks).await {
            tracing::warn!(mirror = mirror.kind(), "task list persistence failed: {}", err);
        }
        persisted.send_replace(snapshot.revision);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_types::{TaskDraft, TaskStatus};
    use tempfile::tempdir;

    fn task(prompt: &str) -> Task {
        Task::new(TaskDraft::new("gpt-image", prompt))
    }

    #[tokio::test]
    async fn add_prepends_and_local_file_is_capped() {
        let dir = tempdir().expect("tempdir");
        let file = LocalTaskFile::new(dir.path().join("tasks.json"));
        let store = TaskStore::new(TaskMirror::LocalFile(file.clone()), 3);

        for i in 0..5 {
            store.add(task(&format!("p{i}"))).await;
        }
        store.flush().await;

        let in_memory = store.list().await;
        assert_eq!(in_memory.len(), 5);
        assert_eq!(in_memory[0].prompt, "p4");

        let persisted = file.load().await.expect("load").expect("some");
        assert_eq!(persisted.len(), 3);
        assert_eq!(persisted[0].prompt, "p4");
        assert_eq!(persisted[2].prompt, "p2");
    }

    #[tokio::test]
    async fn update_and_apply_on_missing_id_are_noops() {
        let store = TaskStore::new(TaskMirror::Memory, 50);
        store.add(task("a")).await;
        assert!(store.update("missing", &TaskPatch::default()).await.is_none());
        assert!(store.apply("missing", TaskEvent::Started).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn apply_routes_through_reducer() {
        let store = TaskStore::new(TaskMirror::Memory, 50);
        let created = store.add(task("a")).await;
        store.apply(&created.id, TaskEvent::Started).await;
        let updated = store
            .apply(&created.id, TaskEvent::Progress { percent: 120.0 })
            .await
            .expect("task");
        assert_eq!(updated.status, TaskStatus::Running);
        assert_eq!(updated.progress, 99.0);
    }

    #[tokio::test]
    async fn hydrate_replaces_list_from_local_file() {
        let dir = tempdir().expect("tempdir");
        let file = LocalTaskFile::new(dir.path().join("tasks.json"));
        file.save(&[task("persisted")]).await.expect("save");

        let store = TaskStore::new(TaskMirror::LocalFile(file), 50);
        assert_eq!(store.hydrate().await, Some(1));
        assert_eq!(store.list().await[0].prompt, "persisted");
    }

    #[tokio::test]
    async fn remove_and_clear_persist() {
        let dir = tempdir().expect("tempdir");
        let file = LocalTaskFile::new(dir.path().join("state").join("tasks.json"));
        let store = TaskStore::new(TaskMirror::LocalFile(file.clone()), 50);
        let a = store.add(task("a")).await;
        store.add(task("b")).await;
        assert_eq!(store.remove(&a.id).await.map(|t| t.prompt), Some("a".to_string()));
        store.flush().await;
        assert_eq!(file.load().await.expect("load").expect("some").len(), 1);

        store.clear().await;
        store.flush().await;
        assert!(file.load().await.expect("load").expect("some").is_empty());
        assert!(!dir.path().join("state").join("tasks.tmp").exists());
    }

    #[test]
    fn mirror_falls_back_without_persistence() {
        let local = LocalTaskFile::new("/tmp/x.json");
        assert_eq!(TaskMirror::select(None, Some(local)).kind(), "local_file");
        assert_eq!(TaskMirror::select(None, None).kind(), "memory");
    }
}
